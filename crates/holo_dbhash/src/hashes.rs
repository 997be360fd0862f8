//! Per-collection content-hash comparison for one database at one timestamp.
//!
//! Collections are matched by catalog UUID, never by name. The catalog is not
//! multi-versioned, so a drop or rename can be visible on the primary before a
//! secondary has applied it. A UUID missing on either side is therefore skipped
//! rather than reported.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::diff::diff_collection;
use crate::session::{DbHashReply, SessionSet};
use crate::types::{CollectionUuid, HashRecord, LogicalTimestamp, MismatchRecord};

/// UUID -> hash record for one session.
pub type HashesByUuid = BTreeMap<CollectionUuid, HashRecord>;

/// Index a hash reply by collection UUID, dropping collections without one.
pub fn hashes_by_uuid(host: &str, reply: DbHashReply) -> HashesByUuid {
    let DbHashReply {
        collections,
        uuids,
        ..
    } = reply;
    collections
        .into_iter()
        .filter_map(|(coll_name, hash)| {
            let uuid = *uuids.get(&coll_name)?;
            Some((
                uuid,
                HashRecord {
                    uuid,
                    coll_name,
                    host: host.to_string(),
                    hash,
                },
            ))
        })
        .collect()
}

/// Pairs of records present on both sides with different hashes.
pub fn mismatched_pairs<'a>(
    primary: &'a HashesByUuid,
    secondary: &'a HashesByUuid,
) -> Vec<(&'a HashRecord, &'a HashRecord)> {
    let uuids: BTreeSet<&CollectionUuid> = primary.keys().chain(secondary.keys()).collect();
    let mut pairs = Vec::new();
    for uuid in uuids {
        match (primary.get(uuid), secondary.get(uuid)) {
            (None, Some(secondary_info)) => {
                tracing::debug!(
                    uuid = %uuid,
                    coll = %secondary_info.coll_name,
                    host = %secondary_info.host,
                    "skipping collection because it doesn't exist on the primary"
                );
            }
            (Some(primary_info), None) => {
                tracing::debug!(
                    uuid = %uuid,
                    coll = %primary_info.coll_name,
                    host = %primary_info.host,
                    "skipping collection because it doesn't exist on the secondary"
                );
            }
            (Some(primary_info), Some(secondary_info)) => {
                if primary_info.hash != secondary_info.hash {
                    pairs.push((primary_info, secondary_info));
                }
            }
            (None, None) => {}
        }
    }
    pairs
}

/// Hash every collection of `db_name` on every session at `read_at` and
/// explain each primary/secondary disagreement with a document diff.
pub async fn check_collection_hashes_for_db(
    sessions: &mut SessionSet,
    db_name: &str,
    read_at: LogicalTimestamp,
) -> Result<Vec<MismatchRecord>> {
    let mut per_session: Vec<HashesByUuid> = Vec::with_capacity(sessions.len());
    for session in sessions.iter_mut() {
        let reply = session
            .db_hash(db_name, Some(read_at))
            .await
            .with_context(|| format!("dbHash of {db_name} at {read_at} on {}", session.host()))?;
        per_session.push(hashes_by_uuid(session.host(), reply));
    }

    let mut mismatches = Vec::new();
    for index in 1..per_session.len() {
        let pairs: Vec<(HashRecord, HashRecord)> =
            mismatched_pairs(&per_session[0], &per_session[index])
                .into_iter()
                .map(|(p, s)| (p.clone(), s.clone()))
                .collect();
        for (primary_info, secondary_info) in pairs {
            tracing::warn!(
                db = %db_name,
                uuid = %primary_info.uuid,
                coll = %primary_info.coll_name,
                primary_host = %primary_info.host,
                primary_hash = %primary_info.hash,
                secondary_host = %secondary_info.host,
                secondary_hash = %secondary_info.hash,
                "dbhash mismatch found for collection"
            );
            let (primary, secondary) = sessions.primary_and_secondary_mut(index);
            let diff = diff_collection(primary, secondary, db_name, primary_info.uuid, read_at)
                .await?;
            mismatches.push(MismatchRecord {
                db_name: db_name.to_string(),
                primary: primary_info,
                secondary: secondary_info,
                diff,
                read_timestamp: read_at,
            });
        }
    }
    Ok(mismatches)
}
