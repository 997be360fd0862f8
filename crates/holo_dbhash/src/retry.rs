//! Per-database retry loop around timestamp selection and the hash check.
//!
//! Each attempt walks `SelectTimestamp -> WaitSecondaries -> Check` and ends
//! in done, retry or fatal. Transient races (killed sessions, reads older than
//! the retained history, reads past the all-committed point) resolve as
//! replication moves forward, so the loop has no attempt limit. It only logs
//! a warning every `retry_warn_every` attempts.

use std::fmt;

use anyhow::Result;

use crate::cluster_time::{pick_read_timestamp, wait_for_secondaries, ReadTimestamp, SessionClock};
use crate::config::CheckerConfig;
use crate::error::{classify, node_error_code, ErrorCode, Fault};
use crate::hashes::check_collection_hashes_for_db;
use crate::session::SessionSet;
use crate::trail::{DebugEvent, DiagnosticTrail};
use crate::types::{LogicalTimestamp, MismatchRecord};

/// Step of one attempt, used to annotate fatal errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    SelectTimestamp,
    WaitSecondaries,
    Check,
    NoopWrite,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::SelectTimestamp => "select-timestamp",
            Phase::WaitSecondaries => "wait-secondaries",
            Phase::Check => "check",
            Phase::NoopWrite => "noop-write",
        };
        f.write_str(name)
    }
}

/// What to do after a failed check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Retry { noop_write: bool },
    Fatal,
}

/// Map a fault to the retry decision.
///
/// A snapshot-too-old failure at an unchanged timestamp means the secondaries'
/// oldest retained snapshot is past the primary's, and nothing will move the
/// selected time forward without a write on the primary.
pub fn decide(fault: Fault, timestamp_unchanged: bool) -> Decision {
    match fault {
        Fault::Interrupted | Fault::ReadAheadOfAllCommitted => Decision::Retry { noop_write: false },
        Fault::SnapshotTooOld => Decision::Retry {
            noop_write: timestamp_unchanged,
        },
        Fault::LockFailed | Fault::Unclassified => Decision::Fatal,
    }
}

/// Retry bookkeeping for one database.
#[derive(Clone, Debug, Default)]
pub struct RetryState {
    pub attempt: u64,
    pub previous_timestamp: Option<LogicalTimestamp>,
    pub current: Option<ReadTimestamp>,
    /// Some earlier attempt on this database hit a transient fault.
    pub transient_error_seen: bool,
    /// The last transient fault asked for a no-op write before this attempt.
    pub noop_write_requested: bool,
}

impl RetryState {
    /// Start a new attempt at `selected`. The timestamp never moves backwards:
    /// a selection older than the previous one keeps the previous one.
    pub fn begin_attempt(&mut self, selected: ReadTimestamp) -> &ReadTimestamp {
        self.attempt += 1;
        let previous = self.current.take();
        self.previous_timestamp = previous.as_ref().map(|read| read.timestamp);
        let next = match previous {
            Some(previous) if previous.timestamp > selected.timestamp => previous,
            _ => selected,
        };
        self.current.insert(next)
    }

    pub fn current_timestamp(&self) -> Option<LogicalTimestamp> {
        self.current.as_ref().map(|read| read.timestamp)
    }

    pub fn timestamp_unchanged(&self) -> bool {
        match (self.previous_timestamp, self.current_timestamp()) {
            (Some(previous), Some(current)) => previous == current,
            _ => false,
        }
    }
}

/// Check one database until it yields a result or fails with a fatal fault.
pub async fn check_database(
    sessions: &mut SessionSet,
    db_name: &str,
    cfg: &CheckerConfig,
    trail: &mut DiagnosticTrail,
) -> Result<Vec<MismatchRecord>> {
    let mut state = RetryState::default();
    loop {
        let selected = match pick_read_timestamp(sessions) {
            Ok(selected) => selected,
            Err(err) => {
                return Err(abort(err, Phase::SelectTimestamp, sessions, db_name, &state, trail))
            }
        };
        let read = state.begin_attempt(selected).clone();

        if cfg.retry_warn_every > 0 && state.attempt % cfg.retry_warn_every == 0 {
            tracing::warn!(
                replica_set = %sessions.url(),
                db = %db_name,
                attempt = state.attempt,
                read_at = %read.timestamp,
                "dbhash check still retrying transient errors"
            );
        }
        tracing::debug!(
            replica_set = %sessions.url(),
            db = %db_name,
            attempt = state.attempt,
            read_at = %read.timestamp,
            previous = ?state.previous_timestamp,
            "starting dbhash attempt"
        );

        if let Err(err) = wait_for_secondaries(sessions, &read, cfg, trail).await {
            return Err(abort(err, Phase::WaitSecondaries, sessions, db_name, &state, trail));
        }

        for session in sessions.iter() {
            trail.push(DebugEvent::ReadAtClusterTime {
                host: session.host().to_string(),
                cluster_time: read.timestamp,
            });
        }

        let err = match check_collection_hashes_for_db(sessions, db_name, read.timestamp).await {
            Ok(mismatches) => return Ok(mismatches),
            Err(err) => err,
        };

        let fault = classify(&err);
        let noop_write = match decide(fault, state.timestamp_unchanged()) {
            Decision::Retry { noop_write } => noop_write,
            Decision::Fatal => {
                return Err(abort(err, Phase::Check, sessions, db_name, &state, trail));
            }
        };
        state.transient_error_seen = true;
        state.noop_write_requested = noop_write;

        if noop_write {
            if let Err(noop_err) = perform_noop_write(sessions, db_name).await {
                return Err(abort(noop_err, Phase::NoopWrite, sessions, db_name, &state, trail));
            }
        }

        tracing::warn!(
            replica_set = %sessions.url(),
            db = %db_name,
            attempt = state.attempt,
            fault = ?fault,
            read_at = %read.timestamp,
            perform_noop_write = noop_write,
            error = %err,
            "transient error during dbhash check; retrying"
        );
        trail.push(DebugEvent::TransientError {
            db_name: db_name.to_string(),
            attempt: state.attempt,
            error: format!("{err:#}"),
            perform_noop_write: noop_write,
        });
    }
}

/// Empty oplog note on the primary. A lock-acquisition failure is tolerated:
/// the next attempt will try again.
async fn perform_noop_write(sessions: &mut SessionSet, db_name: &str) -> Result<()> {
    let primary = sessions.primary_mut();
    match primary.append_oplog_note(db_name).await {
        Ok(_) => Ok(()),
        Err(err) if node_error_code(&err) == Some(ErrorCode::LockFailed) => {
            tracing::warn!(
                host = %primary.host(),
                error = %err,
                "no-op write could not acquire lock; retrying later"
            );
            Ok(())
        }
        Err(err) => Err(err.context(format!("no-op write on primary {}", primary.host()))),
    }
}

/// Record clocks, log the trail and wrap `err` with the diagnostics.
fn abort(
    err: anyhow::Error,
    phase: Phase,
    sessions: &SessionSet,
    db_name: &str,
    state: &RetryState,
    trail: &mut DiagnosticTrail,
) -> anyhow::Error {
    for session in sessions.iter() {
        let clock = SessionClock::of(session);
        trail.push(DebugEvent::SessionClock {
            host: session.host().to_string(),
            operation_time: clock.operation_time,
        });
    }
    let rendered = trail.render();
    tracing::error!(
        replica_set = %sessions.url(),
        db = %db_name,
        phase = %phase,
        attempt = state.attempt,
        read_at = ?state.current_timestamp(),
        previous = ?state.previous_timestamp,
        transient_error_seen = state.transient_error_seen,
        noop_write_requested = state.noop_write_requested,
        error = %format!("{err:#}"),
        trail = %rendered,
        "dbhash check aborted"
    );
    err.context(format!(
        "dbhash check of {db_name} on {} failed during {phase} (attempt {}, transient error seen: {}, \
         no-op write requested: {}); diagnostics: {rendered}",
        sessions.url(),
        state.attempt,
        state.transient_error_seen,
        state.noop_write_requested,
    ))
}
