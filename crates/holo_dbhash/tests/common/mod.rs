//! Shared helpers for integration tests: an in-memory replica set.
//!
//! Every write lands on every data-bearing node; `set_lagging` only holds back
//! a node's applied optime. Divergence is introduced by editing one node's
//! copy directly.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use holo_dbhash::session::{
    CommandReply, Connector, DbHashReply, FailpointMode, ListDatabasesReply, NodeSession,
    ReplicaSetConnection,
};
use holo_dbhash::types::{CollectionUuid, Document, LogicalTimestamp, SignedClusterTime};
use holo_dbhash::{CheckerConfig, ErrorCode, NodeError};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once; `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Config with short deadlines for tests.
pub fn test_config() -> CheckerConfig {
    CheckerConfig {
        secondary_wait_timeout: Duration::from_millis(200),
        secondary_poll_interval: Duration::from_millis(5),
        ..CheckerConfig::default()
    }
}

#[derive(Clone, Debug)]
struct SimCollection {
    uuid: Option<CollectionUuid>,
    docs: BTreeMap<String, Document>,
}

#[derive(Debug)]
struct SimNode {
    host: String,
    arbiter: bool,
    applied: LogicalTimestamp,
    lagging: bool,
    failpoint_on: bool,
    failpoint_enables: usize,
    refuse_failpoint_enable: bool,
    dbs: BTreeMap<String, BTreeMap<String, SimCollection>>,
    db_hash_faults: VecDeque<ErrorCode>,
    db_hash_calls: usize,
    oplog_dumps: usize,
}

#[derive(Debug)]
struct SimState {
    name: String,
    clock: LogicalTimestamp,
    snapshot_reads: bool,
    panic_on_db_hash: bool,
    noop_lock_failures: usize,
    noop_writes: usize,
    nodes: Vec<SimNode>,
    oplog: Vec<Document>,
}

impl SimState {
    fn token(&self) -> SignedClusterTime {
        SignedClusterTime {
            cluster_time: self.clock,
            key_id: 1,
            signature: vec![0xAB; 4],
        }
    }

    /// Advance the cluster clock by one operation and record it in the oplog.
    fn tick(&mut self, op: &str, ns: &str) {
        self.clock = self.clock.next();
        for node in self.nodes.iter_mut().filter(|node| !node.lagging) {
            node.applied = self.clock;
        }
        self.oplog.push(json!({
            "op": op,
            "ns": ns,
            "ts": self.clock.to_string(),
        }));
    }
}

/// In-memory replica set; node 0 is the primary.
#[derive(Clone)]
pub struct SimReplicaSet {
    state: Arc<Mutex<SimState>>,
}

impl SimReplicaSet {
    pub fn new(name: &str, data_nodes: usize) -> Self {
        let start = LogicalTimestamp::new(100, 1);
        let nodes = (0..data_nodes)
            .map(|i| SimNode {
                host: format!("{name}-{i}:27017"),
                arbiter: false,
                applied: start,
                lagging: false,
                failpoint_on: false,
                failpoint_enables: 0,
                refuse_failpoint_enable: false,
                dbs: BTreeMap::new(),
                db_hash_faults: VecDeque::new(),
                db_hash_calls: 0,
                oplog_dumps: 0,
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                name: name.to_string(),
                clock: start,
                snapshot_reads: true,
                panic_on_db_hash: false,
                noop_lock_failures: 0,
                noop_writes: 0,
                nodes,
                oplog: Vec::new(),
            })),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_arbiter(&self) {
        self.with_state(|state| {
            let index = state.nodes.len();
            let host = format!("{}-{index}:27017", state.name);
            let applied = state.clock;
            state.nodes.push(SimNode {
                host,
                arbiter: true,
                applied,
                lagging: false,
                failpoint_on: false,
                failpoint_enables: 0,
                refuse_failpoint_enable: false,
                dbs: BTreeMap::new(),
                db_hash_faults: VecDeque::new(),
                db_hash_calls: 0,
                oplog_dumps: 0,
            });
        });
    }

    pub fn name(&self) -> String {
        self.with_state(|state| state.name.clone())
    }

    pub fn hosts(&self) -> Vec<String> {
        self.with_state(|state| state.nodes.iter().map(|node| node.host.clone()).collect())
    }

    /// Insert (or replace) `doc` in `db.coll` on every data-bearing node.
    pub fn insert(&self, db: &str, coll: &str, doc: Document) {
        self.with_state(|state| {
            let uuid = state
                .nodes
                .iter()
                .find_map(|node| node.dbs.get(db)?.get(coll)?.uuid)
                .unwrap_or_else(CollectionUuid::new_v4);
            let key = id_key(&doc);
            for node in state.nodes.iter_mut().filter(|node| !node.arbiter) {
                node.dbs
                    .entry(db.to_string())
                    .or_default()
                    .entry(coll.to_string())
                    .or_insert_with(|| SimCollection {
                        uuid: Some(uuid),
                        docs: BTreeMap::new(),
                    })
                    .docs
                    .insert(key.clone(), doc.clone());
            }
            state.tick("i", &format!("{db}.{coll}"));
        });
    }

    /// Create `db.coll` on every data node without a catalog UUID.
    pub fn create_without_uuid(&self, db: &str, coll: &str, doc: Document) {
        self.with_state(|state| {
            for (i, node) in state.nodes.iter_mut().filter(|node| !node.arbiter).enumerate() {
                let mut docs = BTreeMap::new();
                // Differ per node so only a UUID-less skip keeps the check green.
                let mut doc = doc.clone();
                doc["node"] = json!(i);
                docs.insert(id_key(&doc), doc);
                node.dbs
                    .entry(db.to_string())
                    .or_default()
                    .insert(coll.to_string(), SimCollection { uuid: None, docs });
            }
            state.tick("c", &format!("{db}.{coll}"));
        });
    }

    pub fn collection_uuid(&self, db: &str, coll: &str) -> Option<CollectionUuid> {
        self.with_state(|state| state.nodes[0].dbs.get(db)?.get(coll)?.uuid)
    }

    /// Overwrite one document on a single node only.
    pub fn diverge(&self, node: usize, db: &str, coll: &str, doc: Document) {
        self.with_state(|state| {
            let key = id_key(&doc);
            state.nodes[node]
                .dbs
                .get_mut(db)
                .and_then(|colls| colls.get_mut(coll))
                .expect("collection exists")
                .docs
                .insert(key, doc);
        });
    }

    /// Drop `db.coll` on a single node only.
    pub fn drop_on(&self, node: usize, db: &str, coll: &str) {
        self.with_state(|state| {
            if let Some(colls) = state.nodes[node].dbs.get_mut(db) {
                colls.remove(coll);
            }
        });
    }

    pub fn set_lagging(&self, node: usize, lagging: bool) {
        self.with_state(|state| {
            state.nodes[node].lagging = lagging;
            if !lagging {
                state.nodes[node].applied = state.clock;
            }
        });
    }

    pub fn set_snapshot_reads(&self, supported: bool) {
        self.with_state(|state| state.snapshot_reads = supported);
    }

    /// Fail the next `db_hash` call on `node` with `code`.
    pub fn inject_db_hash_fault(&self, node: usize, code: ErrorCode) {
        self.with_state(|state| state.nodes[node].db_hash_faults.push_back(code));
    }

    pub fn panic_on_db_hash(&self) {
        self.with_state(|state| state.panic_on_db_hash = true);
    }

    pub fn fail_noop_writes_with_lock(&self, times: usize) {
        self.with_state(|state| state.noop_lock_failures = times);
    }

    pub fn noop_writes(&self) -> usize {
        self.with_state(|state| state.noop_writes)
    }

    pub fn db_hash_calls(&self, node: usize) -> usize {
        self.with_state(|state| state.nodes[node].db_hash_calls)
    }

    pub fn oplog_dumps(&self, node: usize) -> usize {
        self.with_state(|state| state.nodes[node].oplog_dumps)
    }

    pub fn failpoint_enabled(&self, node: usize) -> bool {
        self.with_state(|state| state.nodes[node].failpoint_on)
    }

    pub fn failpoint_enables(&self, node: usize) -> usize {
        self.with_state(|state| state.nodes[node].failpoint_enables)
    }

    /// Make every later attempt to switch the failpoint on for `node` fail.
    pub fn refuse_failpoint_enable(&self, node: usize) {
        self.with_state(|state| state.nodes[node].refuse_failpoint_enable = true);
    }

    pub fn any_failpoint_enabled(&self) -> bool {
        self.with_state(|state| state.nodes.iter().any(|node| node.failpoint_on))
    }

    pub fn node_count(&self) -> usize {
        self.with_state(|state| state.nodes.len())
    }

    fn session(&self, index: usize) -> Box<dyn NodeSession> {
        let host = self.with_state(|state| state.nodes[index].host.clone());
        Box::new(SimSession {
            sim: self.clone(),
            index,
            host,
            operation_time: None,
            cluster_time: None,
        })
    }
}

/// Session against one simulated node. Every reply carries the current
/// cluster clock, like a real causally-consistent session.
pub struct SimSession {
    sim: SimReplicaSet,
    index: usize,
    host: String,
    operation_time: Option<LogicalTimestamp>,
    cluster_time: Option<SignedClusterTime>,
}

impl SimSession {
    fn observe(&mut self, time: LogicalTimestamp, token: SignedClusterTime) -> CommandReply {
        if self.operation_time.map_or(true, |seen| time > seen) {
            self.operation_time = Some(time);
        }
        self.advance_cluster_time(&token);
        CommandReply {
            operation_time: Some(time),
        }
    }

    fn reply(&mut self) -> CommandReply {
        let (clock, token) = self.sim.with_state(|state| (state.clock, state.token()));
        self.observe(clock, token)
    }
}

#[async_trait]
impl NodeSession for SimSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn operation_time(&self) -> Option<LogicalTimestamp> {
        self.operation_time
    }

    fn cluster_time(&self) -> Option<SignedClusterTime> {
        self.cluster_time.clone()
    }

    fn advance_cluster_time(&mut self, token: &SignedClusterTime) {
        let newer = self
            .cluster_time
            .as_ref()
            .map_or(true, |current| token.cluster_time > current.cluster_time);
        if newer {
            self.cluster_time = Some(token.clone());
        }
    }

    async fn supports_snapshot_reads(&mut self) -> Result<bool> {
        Ok(self.sim.with_state(|state| state.snapshot_reads))
    }

    async fn is_arbiter(&mut self) -> Result<bool> {
        let index = self.index;
        Ok(self.sim.with_state(|state| state.nodes[index].arbiter))
    }

    async fn configure_failpoint(&mut self, name: &str, mode: FailpointMode) -> Result<CommandReply> {
        if name.is_empty() {
            return Err(NodeError::new(ErrorCode::Other(2), "failpoint name is empty").into());
        }
        let index = self.index;
        let refused = self.sim.with_state(|state| {
            let node = &mut state.nodes[index];
            if mode == FailpointMode::AlwaysOn && node.refuse_failpoint_enable {
                return true;
            }
            node.failpoint_on = mode == FailpointMode::AlwaysOn;
            if node.failpoint_on {
                node.failpoint_enables += 1;
            }
            false
        });
        if refused {
            return Err(NodeError::new(ErrorCode::Other(8), "enable refused").into());
        }
        Ok(self.reply())
    }

    async fn list_database_names(&mut self) -> Result<ListDatabasesReply> {
        let index = self.index;
        let mut names = self
            .sim
            .with_state(|state| state.nodes[index].dbs.keys().cloned().collect::<Vec<_>>());
        names.extend(["admin".to_string(), "config".to_string(), "local".to_string()]);
        let reply = self.reply();
        Ok(ListDatabasesReply {
            names,
            operation_time: reply.operation_time,
        })
    }

    async fn db_hash(
        &mut self,
        db_name: &str,
        read_at: Option<LogicalTimestamp>,
    ) -> Result<DbHashReply> {
        let index = self.index;
        let outcome = self.sim.with_state(|state| {
            if state.panic_on_db_hash {
                return Err(None);
            }
            let node = &mut state.nodes[index];
            node.db_hash_calls += 1;
            if let Some(code) = node.db_hash_faults.pop_front() {
                return Err(Some(NodeError::new(code, format!("injected fault on {}", node.host))));
            }
            if let Some(at) = read_at {
                if at > state.clock {
                    return Err(Some(NodeError::new(
                        ErrorCode::Other(13),
                        format!("read at {at} is in the future"),
                    )));
                }
            }
            let mut reply = DbHashReply::default();
            for (name, coll) in state.nodes[index].dbs.get(db_name).into_iter().flatten() {
                reply.collections.insert(name.clone(), content_hash(&coll.docs));
                if let Some(uuid) = coll.uuid {
                    reply.uuids.insert(name.clone(), uuid);
                }
            }
            Ok(reply)
        });
        let mut reply = match outcome {
            Ok(reply) => reply,
            Err(None) => panic!("simulated node crashed during dbHash"),
            Err(Some(err)) => return Err(err.into()),
        };
        reply.operation_time = self.reply().operation_time;
        Ok(reply)
    }

    async fn majority_read_after(
        &mut self,
        _db_name: &str,
        _coll_name: &str,
        after: LogicalTimestamp,
    ) -> Result<CommandReply> {
        let index = self.index;
        let caught_up = self.sim.with_state(|state| state.nodes[index].applied >= after);
        if !caught_up {
            // A lagging node never satisfies the read; the caller's deadline fires.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(self.reply())
    }

    async fn applied_optime(&mut self) -> Result<LogicalTimestamp> {
        let index = self.index;
        Ok(self.sim.with_state(|state| state.nodes[index].applied))
    }

    async fn append_oplog_note(&mut self, _db_name: &str) -> Result<CommandReply> {
        let lock_failed = self.sim.with_state(|state| {
            if state.noop_lock_failures > 0 {
                state.noop_lock_failures -= 1;
                return true;
            }
            state.noop_writes += 1;
            state.tick("n", "");
            false
        });
        if lock_failed {
            return Err(NodeError::new(ErrorCode::LockFailed, "could not acquire global lock").into());
        }
        Ok(self.reply())
    }

    async fn find_by_uuid(
        &mut self,
        db_name: &str,
        uuid: CollectionUuid,
        _read_at: LogicalTimestamp,
    ) -> Result<Vec<Document>> {
        let index = self.index;
        let docs = self.sim.with_state(|state| {
            state.nodes[index]
                .dbs
                .get(db_name)?
                .values()
                .find(|coll| coll.uuid == Some(uuid))
                .map(|coll| coll.docs.values().cloned().collect::<Vec<_>>())
        });
        docs.ok_or_else(|| anyhow!("collection {uuid} not found in {db_name} on {}", self.host))
    }

    async fn dump_oplog(&mut self, _filter: &Document, limit: usize) -> Result<Vec<Document>> {
        let index = self.index;
        Ok(self.sim.with_state(|state| {
            state.nodes[index].oplog_dumps += 1;
            state.oplog.iter().rev().take(limit).cloned().collect()
        }))
    }
}

/// Connector over a fixed set of simulated replica sets, keyed by first host.
#[derive(Clone, Default)]
pub struct SimConnector {
    sets: HashMap<String, SimReplicaSet>,
}

impl SimConnector {
    pub fn new(sets: &[&SimReplicaSet]) -> Self {
        let sets = sets
            .iter()
            .map(|set| (set.hosts()[0].clone(), (*set).clone()))
            .collect();
        Self { sets }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, hosts: &[String]) -> Result<ReplicaSetConnection> {
        let first = hosts.first().ok_or_else(|| anyhow!("empty host list"))?;
        let sim = self
            .sets
            .get(first)
            .ok_or_else(|| anyhow!("no simulated replica set at {first}"))?;
        let primary = sim.session(0);
        let secondaries = (1..sim.node_count()).map(|i| sim.session(i)).collect();
        Ok(ReplicaSetConnection {
            url: format!("{}/{}", sim.name(), hosts.join(",")),
            primary,
            secondaries,
        })
    }
}

fn id_key(doc: &Document) -> String {
    serde_json::to_string(doc.get("_id").unwrap_or(&Document::Null)).unwrap_or_default()
}

fn content_hash(docs: &BTreeMap<String, Document>) -> String {
    let mut hasher = DefaultHasher::new();
    for (key, doc) in docs {
        key.hash(&mut hasher);
        doc.to_string().hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}
