//! Value types shared by the timestamp coordinator, the hash checker and the report.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One document as returned by a node. The primary key lives under `_id`.
pub type Document = serde_json::Value;

/// Point in a replica set's operation stream, ordered by `(secs, inc)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalTimestamp {
    pub secs: u32,
    pub inc: u32,
}

impl LogicalTimestamp {
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Next representable timestamp.
    pub fn next(self) -> Self {
        match self.inc.checked_add(1) {
            Some(inc) => Self::new(self.secs, inc),
            None => Self::new(self.secs.saturating_add(1), 0),
        }
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Cluster time plus the signature a node needs before it trusts that time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedClusterTime {
    pub cluster_time: LogicalTimestamp,
    pub key_id: i64,
    pub signature: Vec<u8>,
}

/// Catalog-stable collection identity. Survives renames, unlike the name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionUuid(pub Uuid);

impl CollectionUuid {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CollectionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UUID(\"{}\")", self.0)
    }
}

/// Content hash of one collection on one node at one timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    pub uuid: CollectionUuid,
    pub coll_name: String,
    pub host: String,
    pub hash: String,
}

/// Same `_id` on both sides, different contents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentPair {
    pub primary: Document,
    pub secondary: Document,
}

/// Document-level explanation of a hash mismatch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub docs_with_different_contents: Vec<DocumentPair>,
    pub docs_missing_on_primary: Vec<Document>,
    pub docs_missing_on_secondary: Vec<Document>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.docs_with_different_contents.is_empty()
            && self.docs_missing_on_primary.is_empty()
            && self.docs_missing_on_secondary.is_empty()
    }
}

/// A collection whose hash differs between the primary and one secondary.
///
/// Created only on divergence and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MismatchRecord {
    pub db_name: String,
    pub primary: HashRecord,
    pub secondary: HashRecord,
    pub diff: DiffResult,
    pub read_timestamp: LogicalTimestamp,
}

impl MismatchRecord {
    /// `<db>.<collection>` using the primary's collection name.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db_name, self.primary.coll_name)
    }
}
