//! Node session contract and the per-replica-set session set.
//!
//! The driver that actually talks to nodes lives outside this crate. It plugs
//! in through `Connector` (open sessions for a replica set) and `NodeSession`
//! (one causally-tracked connection to one node).

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{CollectionUuid, Document, LogicalTimestamp, SignedClusterTime};

/// Failpoint activation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailpointMode {
    AlwaysOn,
    Off,
}

/// Metadata returned by any acknowledged command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandReply {
    pub operation_time: Option<LogicalTimestamp>,
}

/// Reply to a name-only database listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListDatabasesReply {
    pub names: Vec<String>,
    pub operation_time: Option<LogicalTimestamp>,
}

/// Reply to a content-hash request for one database.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DbHashReply {
    /// Collection name -> content hash.
    pub collections: BTreeMap<String, String>,
    /// Collection name -> catalog UUID. Collections without one are not compared.
    pub uuids: BTreeMap<String, CollectionUuid>,
    pub operation_time: Option<LogicalTimestamp>,
}

/// One causally-tracked connection to one node.
///
/// Commands take `&mut self` because every reply advances the session's
/// operation time and cluster time.
#[async_trait]
pub trait NodeSession: Send + Sync {
    fn host(&self) -> &str;

    /// Latest operation time observed on this session.
    fn operation_time(&self) -> Option<LogicalTimestamp>;

    /// Latest signed cluster time observed on this session.
    fn cluster_time(&self) -> Option<SignedClusterTime>;

    /// Gossip a signed cluster time into this session so the node accepts reads at it.
    fn advance_cluster_time(&mut self, token: &SignedClusterTime);

    async fn supports_snapshot_reads(&mut self) -> Result<bool>;

    async fn is_arbiter(&mut self) -> Result<bool>;

    async fn configure_failpoint(&mut self, name: &str, mode: FailpointMode)
        -> Result<CommandReply>;

    async fn list_database_names(&mut self) -> Result<ListDatabasesReply>;

    /// Content hash and UUID of every collection in `db_name`, read at `read_at` when given.
    async fn db_hash(
        &mut self,
        db_name: &str,
        read_at: Option<LogicalTimestamp>,
    ) -> Result<DbHashReply>;

    /// Majority read bounded below by `after`; returns once the node has caught up.
    async fn majority_read_after(
        &mut self,
        db_name: &str,
        coll_name: &str,
        after: LogicalTimestamp,
    ) -> Result<CommandReply>;

    /// Applied optime from the node's replication status.
    async fn applied_optime(&mut self) -> Result<LogicalTimestamp>;

    /// Empty oplog note on the primary to push the operation stream forward.
    async fn append_oplog_note(&mut self, db_name: &str) -> Result<CommandReply>;

    /// All documents of the collection identified by `uuid`, read at `read_at`, sorted by `_id`.
    async fn find_by_uuid(
        &mut self,
        db_name: &str,
        uuid: CollectionUuid,
        read_at: LogicalTimestamp,
    ) -> Result<Vec<Document>>;

    /// Most recent operation-log entries matching `filter`, newest first.
    async fn dump_oplog(&mut self, filter: &Document, limit: usize) -> Result<Vec<Document>>;
}

/// Freshly opened sessions for one replica set, arbiters included.
pub struct ReplicaSetConnection {
    pub url: String,
    pub primary: Box<dyn NodeSession>,
    pub secondaries: Vec<Box<dyn NodeSession>>,
}

/// Opens sessions against the members of one replicated unit.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, hosts: &[String]) -> Result<ReplicaSetConnection>;
}

/// Sessions used by one replica-set check. Index 0 is always the primary.
///
/// Owned by exactly one runner and dropped when its check ends.
#[derive(Default)]
pub struct SessionSet {
    url: String,
    sessions: Vec<Box<dyn NodeSession>>,
}

impl SessionSet {
    pub fn new(
        url: impl Into<String>,
        primary: Box<dyn NodeSession>,
        secondaries: Vec<Box<dyn NodeSession>>,
    ) -> Self {
        let mut sessions = Vec::with_capacity(secondaries.len() + 1);
        sessions.push(primary);
        sessions.extend(secondaries);
        Self {
            url: url.into(),
            sessions,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn primary_mut(&mut self) -> &mut (dyn NodeSession + 'static) {
        self.sessions[0].as_mut()
    }

    /// Primary together with secondary `index` (`index >= 1`).
    pub fn primary_and_secondary_mut(
        &mut self,
        index: usize,
    ) -> (
        &mut (dyn NodeSession + 'static),
        &mut (dyn NodeSession + 'static),
    ) {
        assert!(index >= 1 && index < self.sessions.len(), "secondary index out of range");
        let (head, tail) = self.sessions.split_at_mut(index);
        (head[0].as_mut(), tail[0].as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn NodeSession + 'static)> {
        self.sessions.iter().map(|session| session.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut (dyn NodeSession + 'static)> {
        self.sessions.iter_mut().map(|session| session.as_mut())
    }
}
