//! Background data-consistency checker for replicated and sharded document stores.
//!
//! The checker picks a common logical read time per replica set, waits for the
//! secondaries to apply up to it, compares per-collection content hashes keyed
//! by catalog UUID and explains every mismatch with a document diff. Sharded
//! deployments are checked one task per replicated unit.

pub mod cluster_time;
pub mod config;
pub mod diff;
pub mod error;
pub mod failpoint;
pub mod fan_out;
pub mod hashes;
pub mod report;
pub mod retry;
pub mod runner;
pub mod session;
pub mod topology;
pub mod trail;
pub mod types;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use config::CheckerConfig;
pub use error::{ErrorCode, Fault, NodeError, ProgressTimeout, UnsupportedTopology};
pub use report::CheckOutcome;
pub use session::{Connector, NodeSession, ReplicaSetConnection, SessionSet};
pub use topology::{ReplicatedUnit, ShardTopology, Topology, TopologyDiscovery};

/// Run one background consistency check against whatever `discovery` reports.
pub async fn run_background_check(
    discovery: &dyn TopologyDiscovery,
    connector: Arc<dyn Connector>,
    cfg: &CheckerConfig,
) -> Result<CheckOutcome> {
    let topology = discovery.discover().await.context("discover topology")?;
    match &topology {
        Topology::ReplicaSet { nodes } => {
            runner::check_replica_set(connector.as_ref(), nodes, cfg).await
        }
        Topology::Sharded { .. } => {
            let units = fan_out::plan_units(&topology)?;
            tracing::info!(units = units.len(), "checking sharded cluster");
            fan_out::check_units(connector, units, cfg).await
        }
        Topology::Other { description } => Err(UnsupportedTopology {
            description: description.clone(),
        }
        .into()),
    }
}
