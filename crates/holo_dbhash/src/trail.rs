//! Bounded diagnostic trail attached to fatal check failures.

use std::collections::VecDeque;

use serde::Serialize;

use crate::types::{LogicalTimestamp, SignedClusterTime};

/// One diagnostic event recorded during a replica-set check.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DebugEvent {
    RetentionEnabled {
        host: String,
        operation_time: Option<LogicalTimestamp>,
    },
    ListDatabases {
        host: String,
        operation_time: Option<LogicalTimestamp>,
    },
    WaitForSecondaries {
        cluster_time: LogicalTimestamp,
        signed_cluster_time: SignedClusterTime,
    },
    MajorityRead {
        host: String,
        operation_time: Option<LogicalTimestamp>,
    },
    AppliedOpTime {
        host: String,
        applied: LogicalTimestamp,
    },
    ReadAtClusterTime {
        host: String,
        cluster_time: LogicalTimestamp,
    },
    TransientError {
        db_name: String,
        attempt: u64,
        error: String,
        perform_noop_write: bool,
    },
    SessionClock {
        host: String,
        operation_time: Option<LogicalTimestamp>,
    },
}

/// Ring of the most recent `capacity` events.
#[derive(Clone, Debug)]
pub struct DiagnosticTrail {
    capacity: usize,
    events: VecDeque<DebugEvent>,
    dropped: u64,
}

impl DiagnosticTrail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity.min(64)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: DebugEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    pub fn events(&self) -> impl Iterator<Item = &DebugEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// JSON rendering for logs and error context.
    pub fn render(&self) -> String {
        #[derive(Serialize)]
        struct View<'a> {
            dropped: u64,
            events: &'a VecDeque<DebugEvent>,
        }
        serde_json::to_string(&View {
            dropped: self.dropped,
            events: &self.events,
        })
        .unwrap_or_else(|err| format!("<unrenderable diagnostic trail: {err}>"))
    }
}
