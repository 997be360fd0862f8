//! Scoped snapshot-history retention for one replica set.
//!
//! `RetentionScope` owns the session set while the retention failpoint is on.
//! `exit` turns it off on every session and hands the sessions back. A scope
//! dropped while still armed (early return, panic, cancelled task) releases
//! the failpoint from a spawned task instead.

use anyhow::{Context, Result};

use crate::session::{FailpointMode, SessionSet};
use crate::trail::{DebugEvent, DiagnosticTrail};

pub struct RetentionScope {
    failpoint: String,
    sessions: SessionSet,
    armed: bool,
}

impl RetentionScope {
    /// Turn `failpoint` on for every session. On failure it is turned off on
    /// every session again before the error is returned.
    pub async fn enter(
        sessions: SessionSet,
        failpoint: &str,
        trail: &mut DiagnosticTrail,
    ) -> Result<Self> {
        let mut scope = Self {
            failpoint: failpoint.to_string(),
            sessions,
            armed: true,
        };
        if let Err(err) = scope.enable_all(trail).await {
            if let Err(release_err) = release_all(&mut scope.sessions, &scope.failpoint).await {
                tracing::warn!(
                    replica_set = %scope.sessions.url(),
                    error = %release_err,
                    "failed to release retention failpoint after enable error"
                );
            }
            scope.armed = false;
            return Err(err);
        }
        Ok(scope)
    }

    pub fn sessions(&self) -> &SessionSet {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionSet {
        &mut self.sessions
    }

    /// Turn the failpoint off on every session and return the sessions with
    /// the first release error, if any.
    pub async fn exit(mut self) -> (SessionSet, Result<()>) {
        let released = release_all(&mut self.sessions, &self.failpoint).await;
        self.armed = false;
        (std::mem::take(&mut self.sessions), released)
    }

    async fn enable_all(&mut self, trail: &mut DiagnosticTrail) -> Result<()> {
        for session in self.sessions.iter_mut() {
            let reply = session
                .configure_failpoint(&self.failpoint, FailpointMode::AlwaysOn)
                .await
                .with_context(|| {
                    format!("enable failpoint {} on {}", self.failpoint, session.host())
                })?;
            trail.push(DebugEvent::RetentionEnabled {
                host: session.host().to_string(),
                operation_time: reply.operation_time,
            });
        }
        Ok(())
    }
}

impl Drop for RetentionScope {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut sessions = std::mem::take(&mut self.sessions);
        let failpoint = std::mem::take(&mut self.failpoint);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    replica_set = %sessions.url(),
                    "retention scope dropped while armed; releasing in background"
                );
                handle.spawn(async move {
                    if let Err(err) = release_all(&mut sessions, &failpoint).await {
                        tracing::error!(
                            replica_set = %sessions.url(),
                            error = %err,
                            "background release of retention failpoint failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    replica_set = %sessions.url(),
                    failpoint = %failpoint,
                    "retention failpoint left enabled: no runtime to release it"
                );
            }
        }
    }
}

/// Turn `failpoint` off on every session, continuing past failures.
async fn release_all(sessions: &mut SessionSet, failpoint: &str) -> Result<()> {
    let mut first_err = None;
    for session in sessions.iter_mut() {
        let res = session
            .configure_failpoint(failpoint, FailpointMode::Off)
            .await
            .with_context(|| format!("disable failpoint {failpoint} on {}", session.host()));
        if let Err(err) = res {
            tracing::warn!(host = %session.host(), error = %err, "failed to release failpoint");
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
