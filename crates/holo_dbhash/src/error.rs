//! Structured failures and the transient/fatal classifier.
//!
//! Everything crosses call boundaries as `anyhow::Error`. The concrete types
//! here are recovered with `downcast_ref` wherever a caller has to react to a
//! specific failure rather than just report it.

use std::fmt;

use crate::types::LogicalTimestamp;

/// Error codes a node can answer a command with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Operation killed by an administrative action (e.g. session kill).
    Interrupted,
    /// Requested read time is older than the retained snapshot history.
    SnapshotUnavailable,
    /// Invalid request options; includes reading past the all-committed point.
    InvalidOptions,
    /// Lock could not be acquired within the command's budget.
    LockFailed,
    Other(i32),
}

impl ErrorCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            11601 => ErrorCode::Interrupted,
            246 => ErrorCode::SnapshotUnavailable,
            72 => ErrorCode::InvalidOptions,
            107 => ErrorCode::LockFailed,
            other => ErrorCode::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ErrorCode::Interrupted => 11601,
            ErrorCode::SnapshotUnavailable => 246,
            ErrorCode::InvalidOptions => 72,
            ErrorCode::LockFailed => 107,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Interrupted => "Interrupted",
            ErrorCode::SnapshotUnavailable => "SnapshotUnavailable",
            ErrorCode::InvalidOptions => "InvalidOptions",
            ErrorCode::LockFailed => "LockFailed",
            ErrorCode::Other(_) => "Other",
        }
    }
}

/// A command failure reported by a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeError {
    pub code: ErrorCode,
    pub message: String,
}

impl NodeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.code.as_str(),
            self.code.code(),
            self.message
        )
    }
}

impl std::error::Error for NodeError {}

/// A secondary did not apply up to the target timestamp before the deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressTimeout {
    /// Index into the session set; the primary is index 0.
    pub secondary_index: usize,
    pub host: String,
    pub target: LogicalTimestamp,
}

impl fmt::Display for ProgressTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The majority commit point on secondary {} ({}) failed to reach {}",
            self.secondary_index, self.host, self.target
        )
    }
}

impl std::error::Error for ProgressTimeout {}

/// Deployment or shard shape the checker does not know how to validate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsupportedTopology {
    pub description: String,
}

impl fmt::Display for UnsupportedTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported topology configuration: {}", self.description)
    }
}

impl std::error::Error for UnsupportedTopology {}

/// Fault kinds the retry loop distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Interrupted,
    SnapshotTooOld,
    ReadAheadOfAllCommitted,
    LockFailed,
    Unclassified,
}

impl Fault {
    /// Transient faults are retried by the per-database loop and never surface.
    pub fn is_transient(self) -> bool {
        match self {
            Fault::Interrupted | Fault::SnapshotTooOld | Fault::ReadAheadOfAllCommitted => true,
            Fault::LockFailed | Fault::Unclassified => false,
        }
    }
}

/// Map an error to its fault kind by looking for a `NodeError` in the chain.
pub fn classify(err: &anyhow::Error) -> Fault {
    let Some(node_err) = err.chain().find_map(|cause| cause.downcast_ref::<NodeError>()) else {
        return Fault::Unclassified;
    };
    match node_err.code {
        ErrorCode::Interrupted => Fault::Interrupted,
        ErrorCode::SnapshotUnavailable => Fault::SnapshotTooOld,
        ErrorCode::InvalidOptions => Fault::ReadAheadOfAllCommitted,
        ErrorCode::LockFailed => Fault::LockFailed,
        ErrorCode::Other(_) => Fault::Unclassified,
    }
}

/// Node-reported error code carried anywhere in the chain, if any.
pub fn node_error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<NodeError>())
        .map(|node_err| node_err.code)
}
