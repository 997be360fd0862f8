//! Mismatch report rendering, outcome construction and oplog dumps.

use std::fmt::Write as _;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::session::SessionSet;
use crate::types::{Document, HashRecord, LogicalTimestamp, MismatchRecord};

/// Result of checking one replicated unit, or the merge of several.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    #[serde(serialize_with = "ok_as_int", deserialize_with = "ok_from_int")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Full mismatch report; `None` when everything matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

impl CheckOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            hosts: Vec::new(),
            report: None,
        }
    }

    /// Combine per-unit outcomes: ok only if every unit is ok.
    pub fn merge(outcomes: impl IntoIterator<Item = CheckOutcome>) -> Self {
        let mut merged = Self::ok();
        let mut errors = Vec::new();
        let mut reports = Vec::new();
        for outcome in outcomes {
            if outcome.ok {
                continue;
            }
            merged.ok = false;
            errors.extend(outcome.error);
            reports.extend(outcome.report);
            merged.hosts.extend(outcome.hosts);
        }
        if !errors.is_empty() {
            merged.error = Some(errors.join("; "));
        }
        if !reports.is_empty() {
            merged.report = Some(reports.join("\n\n"));
        }
        merged
    }
}

fn ok_as_int<S: Serializer>(ok: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*ok))
}

fn ok_from_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(u8::deserialize(deserializer)? != 0)
}

/// Mismatch record as printed in the report: everything but the diff.
#[derive(Serialize)]
struct MismatchHeader<'a> {
    db_name: &'a str,
    primary: &'a HashRecord,
    secondary: &'a HashRecord,
    read_timestamp: LogicalTimestamp,
}

/// Render the report text and the section headings it contains.
pub fn render_report(mismatches: &[MismatchRecord]) -> (Vec<String>, String) {
    let mut headings = Vec::with_capacity(mismatches.len());
    let mut blob = String::new();

    for mismatch in mismatches {
        let heading = format!("dbhash mismatch for {}", mismatch.namespace());
        if !headings.is_empty() {
            blob.push_str("\n\n");
        }
        let header = MismatchHeader {
            db_name: &mismatch.db_name,
            primary: &mismatch.primary,
            secondary: &mismatch.secondary,
            read_timestamp: mismatch.read_timestamp,
        };
        let header = serde_json::to_string_pretty(&header)
            .unwrap_or_else(|err| format!("<unrenderable mismatch record: {err}>"));
        let _ = write!(blob, "{heading}: {header}");
        headings.push(heading);

        let diff = &mismatch.diff;
        if diff.docs_with_different_contents.is_empty() {
            blob.push_str("\nNo documents have different contents on the primary and secondary");
        } else {
            blob.push_str(
                "\nThe following documents have different contents on the primary and secondary:",
            );
            for pair in &diff.docs_with_different_contents {
                let _ = write!(blob, "\n  primary:   {}", one_line(&pair.primary));
                let _ = write!(blob, "\n  secondary: {}", one_line(&pair.secondary));
            }
        }

        if diff.docs_missing_on_primary.is_empty() {
            blob.push_str("\nNo documents are missing from the primary");
        } else {
            blob.push_str("\nThe following documents aren't present on the primary:");
            for doc in &diff.docs_missing_on_primary {
                let _ = write!(blob, "\n  {}", one_line(doc));
            }
        }

        if diff.docs_missing_on_secondary.is_empty() {
            blob.push_str("\nNo documents are missing from the secondary");
        } else {
            blob.push_str("\nThe following documents aren't present on the secondary:");
            for doc in &diff.docs_missing_on_secondary {
                let _ = write!(blob, "\n  {}", one_line(doc));
            }
        }
    }

    (headings, blob)
}

/// Outcome for one replica set given everything its check found.
pub fn build_outcome(hosts: &[String], mismatches: &[MismatchRecord]) -> CheckOutcome {
    if mismatches.is_empty() {
        return CheckOutcome::ok();
    }
    let (headings, blob) = render_report(mismatches);
    let headings_json = serde_json::to_string(&headings).unwrap_or_default();
    CheckOutcome {
        ok: false,
        error: Some(format!(
            "dbhash mismatch (search for the following headings): {headings_json}"
        )),
        hosts: hosts.to_vec(),
        report: Some(blob),
    }
}

/// Log the most recent oplog entries of every session. Failures are logged
/// and skipped so they never hide the mismatch itself.
pub async fn dump_oplogs(sessions: &mut SessionSet, limit: usize) {
    let filter = Document::Object(Default::default());
    for session in sessions.iter_mut() {
        match session.dump_oplog(&filter, limit).await {
            Ok(entries) => {
                tracing::info!(
                    host = %session.host(),
                    entries = entries.len(),
                    limit,
                    "dumping oplog"
                );
                for entry in &entries {
                    tracing::info!(host = %session.host(), entry = %one_line(entry), "oplog entry");
                }
            }
            Err(err) => {
                tracing::warn!(host = %session.host(), error = %err, "failed to dump oplog");
            }
        }
    }
}

fn one_line(doc: &Document) -> String {
    serde_json::to_string(doc).unwrap_or_else(|_| doc.to_string())
}
