//! Concurrent checks across the replicated units of a sharded deployment.
//!
//! Every unit runs in its own task with its own sessions. All tasks are joined
//! before anything is reported, so one failing unit never cuts its siblings
//! short; the first failure in spawn order is raised afterwards.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::config::CheckerConfig;
use crate::error::UnsupportedTopology;
use crate::report::CheckOutcome;
use crate::runner::check_replica_set;
use crate::session::Connector;
use crate::topology::{ReplicatedUnit, ShardTopology, Topology};

/// Label of the config-server unit.
pub const CONFIG_SERVER_UNIT: &str = "config";

/// Units worth checking. One-node units and standalone shards hold nothing
/// to compare and are skipped.
pub fn plan_units(topology: &Topology) -> Result<Vec<ReplicatedUnit>> {
    match topology {
        Topology::ReplicaSet { nodes } => Ok(vec![ReplicatedUnit::new("replica_set", nodes.clone())]),
        Topology::Sharded {
            config_server,
            shards,
        } => {
            let mut units = Vec::with_capacity(shards.len() + 1);
            if config_server.len() > 1 {
                units.push(ReplicatedUnit::new(CONFIG_SERVER_UNIT, config_server.clone()));
            } else {
                tracing::info!(unit = CONFIG_SERVER_UNIT, "skipping single-node config server");
            }
            for (name, shard) in shards {
                match shard {
                    ShardTopology::Standalone { node } => {
                        tracing::info!(unit = %name, node = %node, "skipping standalone shard");
                    }
                    ShardTopology::ReplicaSet { nodes } if nodes.len() > 1 => {
                        units.push(ReplicatedUnit::new(name.clone(), nodes.clone()));
                    }
                    ShardTopology::ReplicaSet { .. } => {
                        tracing::info!(unit = %name, "skipping single-node shard");
                    }
                    ShardTopology::Unrecognized { kind } => {
                        return Err(UnsupportedTopology {
                            description: format!("shard {name} has unrecognized type {kind}"),
                        }
                        .into());
                    }
                }
            }
            Ok(units)
        }
        Topology::Other { description } => Err(UnsupportedTopology {
            description: description.clone(),
        }
        .into()),
    }
}

/// Result of one unit's task, in spawn order.
#[derive(Debug)]
pub struct UnitResult<T> {
    pub name: String,
    pub result: Result<T>,
}

/// Spawn every unit, then await all of them. A panicking task becomes that
/// unit's error.
pub async fn join_units<T, F>(units: Vec<(String, F)>) -> Vec<UnitResult<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let handles: Vec<_> = units
        .into_iter()
        .map(|(name, task)| (name, tokio::spawn(task)))
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow!("task for unit {name} did not complete: {join_err}")),
        };
        results.push(UnitResult { name, result });
    }
    results
}

/// Check every unit concurrently and merge the outcomes.
pub async fn check_units(
    connector: Arc<dyn Connector>,
    units: Vec<ReplicatedUnit>,
    cfg: &CheckerConfig,
) -> Result<CheckOutcome> {
    let cfg = Arc::new(cfg.clone());
    let tasks: Vec<(String, _)> = units
        .into_iter()
        .map(|ReplicatedUnit { name, hosts }| {
            let connector = connector.clone();
            let cfg = cfg.clone();
            let task = async move { check_replica_set(connector.as_ref(), &hosts, &cfg).await };
            (name, task)
        })
        .collect();

    let mut outcomes = Vec::new();
    let mut first_err = None;
    for UnitResult { name, result } in join_units(tasks).await {
        match result {
            Ok(outcome) => {
                tracing::info!(unit = %name, ok = outcome.ok, "unit dbhash check finished");
                outcomes.push(outcome);
            }
            Err(err) => {
                tracing::error!(unit = %name, error = %format!("{err:#}"), "unit dbhash check failed");
                if first_err.is_none() {
                    first_err = Some(err.context(format!("dbhash check of unit {name}")));
                }
            }
        }
    }
    if let Some(err) = first_err {
        return Err(err);
    }
    Ok(CheckOutcome::merge(outcomes))
}
