//! Deployment-shape view consumed by the checker.
//!
//! Discovery itself belongs to the harness. It describes the deployment as a
//! plain `Topology` value and the checker decides which replicated units are
//! worth validating.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Materialized view of the deployment under test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Topology {
    /// A single replica set; `nodes` lists every member, primary first.
    ReplicaSet {
        /// Member addresses.
        nodes: Vec<String>,
    },
    /// A sharded cluster.
    Sharded {
        /// Members of the config-server replica set.
        config_server: Vec<String>,
        /// Shards keyed by shard name.
        shards: BTreeMap<String, ShardTopology>,
    },
    /// Any other deployment shape, described by the discoverer.
    Other {
        /// Free-form shape name reported by discovery.
        description: String,
    },
}

/// How one shard is deployed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShardTopology {
    /// A single non-replicated node.
    Standalone {
        /// Node address.
        node: String,
    },
    /// A replica-set-backed shard.
    ReplicaSet {
        /// Member addresses.
        nodes: Vec<String>,
    },
    /// Shard type discovery could not map.
    Unrecognized {
        /// Shard type name as reported.
        kind: String,
    },
}

/// Source of the deployment shape.
#[async_trait]
pub trait TopologyDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Topology>;
}

/// One replica set the fan-out will check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicatedUnit {
    /// Label used in logs (`config` or the shard name).
    pub name: String,
    /// Member addresses handed to the connector.
    pub hosts: Vec<String>,
}

impl ReplicatedUnit {
    pub fn new(name: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            name: name.into(),
            hosts,
        }
    }
}

/// Static discovery for callers that already know the shape.
#[derive(Clone, Debug)]
pub struct StaticTopology(pub Topology);

#[async_trait]
impl TopologyDiscovery for StaticTopology {
    async fn discover(&self) -> Result<Topology> {
        Ok(self.0.clone())
    }
}
