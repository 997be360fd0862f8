//! Common read-time selection and secondary catch-up.
//!
//! A primary is not guaranteed to report a later operation time than its
//! secondaries (last-applied advances racily), so the snapshot point is the
//! latest operation time reported by any session. Before reading at that time
//! every secondary must (1) trust it, via the signed cluster time, and
//! (2) have applied up to it.

use anyhow::{anyhow, Context, Result};
use tokio::time::{self, Instant};

use crate::config::CheckerConfig;
use crate::error::ProgressTimeout;
use crate::session::{NodeSession, SessionSet};
use crate::trail::{DebugEvent, DiagnosticTrail};
use crate::types::{LogicalTimestamp, SignedClusterTime};

/// Database the secondary wait read is issued against.
const WAIT_DATABASE: &str = "admin";

/// Selected snapshot point and the token that lets secondaries accept it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadTimestamp {
    pub timestamp: LogicalTimestamp,
    pub token: SignedClusterTime,
}

/// Clock state observed on one session.
#[derive(Clone, Debug)]
pub struct SessionClock {
    pub host: String,
    pub operation_time: Option<LogicalTimestamp>,
    pub cluster_time: Option<SignedClusterTime>,
}

impl SessionClock {
    pub fn of(session: &dyn NodeSession) -> Self {
        Self {
            host: session.host().to_string(),
            operation_time: session.operation_time(),
            cluster_time: session.cluster_time(),
        }
    }
}

/// Maximum operation time over `clocks`, paired with the token of the session
/// that reported it. Ties keep the earliest session. Sessions that have not
/// run a command yet are skipped; an operation time without a signed cluster
/// time is an error.
pub fn latest_clock(
    clocks: impl IntoIterator<Item = SessionClock>,
) -> Result<Option<ReadTimestamp>> {
    let mut best: Option<ReadTimestamp> = None;
    for clock in clocks {
        let (timestamp, token) = match (clock.operation_time, clock.cluster_time) {
            (Some(timestamp), Some(token)) => (timestamp, token),
            (Some(timestamp), None) => {
                return Err(anyhow!(
                    "session on {} reported operation time {timestamp} without a signed cluster time",
                    clock.host
                ));
            }
            (None, _) => {
                tracing::debug!(host = %clock.host, "session has no operation time yet");
                continue;
            }
        };
        let newer = best
            .as_ref()
            .map_or(true, |current| timestamp > current.timestamp);
        if newer {
            best = Some(ReadTimestamp { timestamp, token });
        }
    }
    Ok(best)
}

/// Select the common read timestamp for one attempt.
pub fn pick_read_timestamp(sessions: &SessionSet) -> Result<ReadTimestamp> {
    latest_clock(sessions.iter().map(|session| SessionClock::of(session)))?.ok_or_else(|| {
        anyhow!(
            "no session of replica set {} has observed an operation time",
            sessions.url()
        )
    })
}

/// Make every secondary trust `read.token` and block until each has applied
/// up to `read.timestamp`.
pub async fn wait_for_secondaries(
    sessions: &mut SessionSet,
    read: &ReadTimestamp,
    cfg: &CheckerConfig,
    trail: &mut DiagnosticTrail,
) -> Result<()> {
    trail.push(DebugEvent::WaitForSecondaries {
        cluster_time: read.timestamp,
        signed_cluster_time: read.token.clone(),
    });

    for (index, session) in sessions.iter_mut().enumerate().skip(1) {
        // Without this the read below is rejected as ahead of the node's cluster time.
        session.advance_cluster_time(&read.token);
        let host = session.host().to_string();

        if cfg.majority_read_concern {
            let reply = match time::timeout(
                cfg.secondary_wait_timeout,
                session.majority_read_after(WAIT_DATABASE, &cfg.wait_collection, read.timestamp),
            )
            .await
            {
                Ok(res) => res.with_context(|| {
                    format!("majority read after {} on secondary {index} ({host})", read.timestamp)
                })?,
                Err(_) => {
                    return Err(ProgressTimeout {
                        secondary_index: index,
                        host,
                        target: read.timestamp,
                    }
                    .into())
                }
            };
            trail.push(DebugEvent::MajorityRead {
                host,
                operation_time: reply.operation_time,
            });
        } else {
            wait_for_applied(session, index, read.timestamp, cfg, trail).await?;
        }
    }
    Ok(())
}

/// Poll replication status until the applied optime reaches `target`.
async fn wait_for_applied(
    session: &mut dyn NodeSession,
    index: usize,
    target: LogicalTimestamp,
    cfg: &CheckerConfig,
    trail: &mut DiagnosticTrail,
) -> Result<()> {
    let host = session.host().to_string();
    let deadline = Instant::now() + cfg.secondary_wait_timeout;
    loop {
        let applied = session
            .applied_optime()
            .await
            .with_context(|| format!("replication status of secondary {index} ({host})"))?;
        if applied >= target {
            trail.push(DebugEvent::AppliedOpTime { host, applied });
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ProgressTimeout {
                secondary_index: index,
                host,
                target,
            }
            .into());
        }
        tracing::debug!(
            secondary = index,
            host = %host,
            applied = %applied,
            target = %target,
            "waiting for secondary to apply up to read timestamp"
        );
        time::sleep(cfg.secondary_poll_interval).await;
    }
}
