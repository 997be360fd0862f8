//! Consistency check of a single replica set.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};

use anyhow::{Context, Result};
use futures_util::FutureExt;

use crate::config::CheckerConfig;
use crate::failpoint::RetentionScope;
use crate::report::{build_outcome, dump_oplogs, CheckOutcome};
use crate::retry::check_database;
use crate::session::{Connector, NodeSession, ReplicaSetConnection, SessionSet};
use crate::trail::{DebugEvent, DiagnosticTrail};
use crate::types::MismatchRecord;

/// Check every user database of the replica set reachable through `hosts`.
///
/// The retention failpoint is on for the whole check and is released on every
/// exit path, including a panic in the check body (the panic resumes after the
/// release).
pub async fn check_replica_set(
    connector: &dyn Connector,
    hosts: &[String],
    cfg: &CheckerConfig,
) -> Result<CheckOutcome> {
    let ReplicaSetConnection {
        url,
        mut primary,
        secondaries,
    } = connector
        .connect(hosts)
        .await
        .with_context(|| format!("connect to replica set {}", hosts.join(",")))?;

    let supported = primary
        .supports_snapshot_reads()
        .await
        .with_context(|| format!("query snapshot read support on {}", primary.host()))?;
    if !supported {
        tracing::info!(
            replica_set = %url,
            primary = %primary.host(),
            "skipping dbhash check: storage engine does not support snapshot reads"
        );
        return Ok(CheckOutcome::ok());
    }

    let secondaries = without_arbiters(secondaries).await?;
    let sessions = SessionSet::new(url, primary, secondaries);
    let mut trail = DiagnosticTrail::new(cfg.debug_trail_capacity);

    tracing::info!(
        replica_set = %sessions.url(),
        nodes = sessions.len(),
        "starting background dbhash check"
    );

    let mut scope = RetentionScope::enter(sessions, &cfg.retention_failpoint, &mut trail).await?;
    let body = AssertUnwindSafe(check_all_databases(scope.sessions_mut(), cfg, &mut trail))
        .catch_unwind()
        .await;
    let (mut sessions, released) = scope.exit().await;
    let mismatches = match body {
        Ok(result) => result?,
        Err(payload) => panic::resume_unwind(payload),
    };
    released.with_context(|| {
        format!("release retention failpoint on replica set {}", sessions.url())
    })?;

    if mismatches.is_empty() {
        tracing::info!(replica_set = %sessions.url(), "background dbhash check passed");
        return Ok(CheckOutcome::ok());
    }

    dump_oplogs(&mut sessions, cfg.oplog_dump_limit).await;
    let outcome = build_outcome(hosts, &mismatches);
    tracing::error!(
        replica_set = %sessions.url(),
        mismatches = mismatches.len(),
        error = outcome.error.as_deref().unwrap_or_default(),
        report = outcome.report.as_deref().unwrap_or_default(),
        "background dbhash check found mismatches"
    );
    Ok(outcome)
}

/// Drop secondaries that report themselves as arbiters; they hold no data.
async fn without_arbiters(
    secondaries: Vec<Box<dyn NodeSession>>,
) -> Result<Vec<Box<dyn NodeSession>>> {
    let mut kept = Vec::with_capacity(secondaries.len());
    for mut session in secondaries {
        let arbiter = session
            .is_arbiter()
            .await
            .with_context(|| format!("query member state of {}", session.host()))?;
        if arbiter {
            tracing::debug!(host = %session.host(), "excluding arbiter from dbhash check");
            continue;
        }
        kept.push(session);
    }
    Ok(kept)
}

async fn check_all_databases(
    sessions: &mut SessionSet,
    cfg: &CheckerConfig,
    trail: &mut DiagnosticTrail,
) -> Result<Vec<MismatchRecord>> {
    let db_names = list_databases(sessions, cfg, trail).await?;
    let mut mismatches = Vec::new();
    for db_name in &db_names {
        tracing::debug!(replica_set = %sessions.url(), db = %db_name, "checking database");
        mismatches.extend(check_database(sessions, db_name, cfg, trail).await?);
    }
    Ok(mismatches)
}

/// Union of the database names every session reports, minus the excluded ones.
async fn list_databases(
    sessions: &mut SessionSet,
    cfg: &CheckerConfig,
    trail: &mut DiagnosticTrail,
) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for session in sessions.iter_mut() {
        let reply = session
            .list_database_names()
            .await
            .with_context(|| format!("list databases on {}", session.host()))?;
        trail.push(DebugEvent::ListDatabases {
            host: session.host().to_string(),
            operation_time: reply.operation_time,
        });
        names.extend(reply.names);
    }
    names.retain(|name| !cfg.is_excluded_database(name));
    Ok(names)
}
