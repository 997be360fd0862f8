//! Document-level diff for one collection whose hashes disagree.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::session::NodeSession;
use crate::types::{CollectionUuid, DiffResult, Document, DocumentPair, LogicalTimestamp};

/// Read the collection identified by `uuid` from both sessions at `read_at`
/// and partition the documents by primary key.
pub async fn diff_collection(
    primary: &mut dyn NodeSession,
    secondary: &mut dyn NodeSession,
    db_name: &str,
    uuid: CollectionUuid,
    read_at: LogicalTimestamp,
) -> Result<DiffResult> {
    let primary_docs = primary
        .find_by_uuid(db_name, uuid, read_at)
        .await
        .with_context(|| format!("read {db_name} collection {uuid} from {}", primary.host()))?;
    let secondary_docs = secondary
        .find_by_uuid(db_name, uuid, read_at)
        .await
        .with_context(|| format!("read {db_name} collection {uuid} from {}", secondary.host()))?;
    Ok(partition_documents(primary_docs, secondary_docs))
}

/// Pair documents by `_id` and split them into differing, primary-only and
/// secondary-only sets. Output follows `_id` order.
pub fn partition_documents(primary: Vec<Document>, secondary: Vec<Document>) -> DiffResult {
    let mut secondary_by_id: BTreeMap<String, Document> = secondary
        .into_iter()
        .map(|doc| (id_key(&doc), doc))
        .collect();
    let primary_by_id: BTreeMap<String, Document> =
        primary.into_iter().map(|doc| (id_key(&doc), doc)).collect();

    let mut diff = DiffResult::default();
    for (id, primary_doc) in primary_by_id {
        match secondary_by_id.remove(&id) {
            Some(secondary_doc) if secondary_doc == primary_doc => {}
            Some(secondary_doc) => diff.docs_with_different_contents.push(DocumentPair {
                primary: primary_doc,
                secondary: secondary_doc,
            }),
            None => diff.docs_missing_on_secondary.push(primary_doc),
        }
    }
    diff.docs_missing_on_primary = secondary_by_id.into_values().collect();
    diff
}

/// Canonical pairing key for a document's `_id` (`null` when absent).
fn id_key(doc: &Document) -> String {
    let id = doc.get("_id").unwrap_or(&Document::Null);
    serde_json::to_string(id).unwrap_or_default()
}
