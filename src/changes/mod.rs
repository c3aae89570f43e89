// src/changes/mod.rs

//! The change feed: a cursor over the append-only `changes` log.
//!
//! Every revision insertion (`create`, `update`, `delete`, `force_insert`)
//! appends exactly one row here, keyed by the same `sequence` the
//! revision itself was assigned. This implementation emits one entry per
//! inserted revision rather than deduplicating to "one entry per
//! document, reflecting its current winner"; see DESIGN.md's Open
//! Question resolution. Callers that want "only what currently wins" can
//! re-resolve via `RevisionEngine::get_winner` per document id.

use crate::error::Result;
use crate::kvp::Kvp;
use crate::revision::model::{DocId, RevId};
use rusqlite::params;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub sequence: i64,
    pub doc_id: DocId,
    pub rev_id: RevId,
    pub deleted: bool,
    /// The document's current winning revision, which may differ from
    /// `rev_id` if a later change superseded this entry before the feed
    /// was read (e.g. a losing branch that was since tombstoned).
    /// `None` if the document has since been purged entirely.
    pub winning_rev_id: Option<RevId>,
}

pub struct ChangeFeed {
    kvp: Arc<Kvp>,
}

impl ChangeFeed {
    pub fn new(kvp: Arc<Kvp>) -> Self {
        Self { kvp }
    }

    /// Returns up to `limit` entries with `sequence > since`, ordered
    /// ascending. `doc_ids`, if non-empty, restricts the feed to those
    /// documents (the replicator's filtered-replication case).
    pub fn since(&self, since: i64, limit: u32, doc_ids: &[String]) -> Result<Vec<ChangeEntry>> {
        self.kvp.run_read(|conn| {
            let mut rows: Vec<ChangeEntry> = if doc_ids.is_empty() {
                let mut stmt = conn.prepare(
                    "SELECT sequence, doc_id, generation, hash, deleted FROM changes
                     WHERE sequence > ?1 ORDER BY sequence ASC LIMIT ?2",
                )?;
                stmt.query_map(params![since, limit], row_to_entry)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                let placeholders = doc_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!(
                    "SELECT sequence, doc_id, generation, hash, deleted FROM changes
                     WHERE sequence > ? AND doc_id IN ({placeholders}) ORDER BY sequence ASC LIMIT ?"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(doc_ids.len() + 2);
                bound.push(&since);
                for id in doc_ids {
                    bound.push(id);
                }
                bound.push(&limit);
                stmt.query_map(bound.as_slice(), row_to_entry)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            for entry in &mut rows {
                entry.winning_rev_id = crate::revision::winner_for(conn, &entry.doc_id)?;
            }
            Ok(rows)
        })
    }

    pub fn last_sequence(&self) -> Result<i64> {
        self.kvp.run_read(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM changes",
                [],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<ChangeEntry> {
    let doc_id: String = row.get(1)?;
    let generation: i64 = row.get(2)?;
    let hash: String = row.get(3)?;
    let deleted: bool = row.get::<_, i64>(4)? != 0;
    Ok(ChangeEntry {
        sequence: row.get(0)?,
        doc_id: DocId::new(doc_id).map_err(|_| {
            rusqlite::Error::InvalidColumnType(1, "doc_id".into(), rusqlite::types::Type::Text)
        })?,
        rev_id: RevId::new(generation as u64, hash),
        deleted,
        winning_rev_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::RevisionEngine;
    use std::collections::BTreeMap;

    #[test]
    fn since_returns_entries_in_order() {
        let kvp = Arc::new(Kvp::open_in_memory().unwrap());
        let engine = RevisionEngine::new(kvp.clone(), 1000);
        let feed = ChangeFeed::new(kvp);

        engine
            .create(Some(DocId::new("a").unwrap()), serde_json::json!({}), BTreeMap::new(), false)
            .unwrap();
        engine
            .create(Some(DocId::new("b").unwrap()), serde_json::json!({}), BTreeMap::new(), false)
            .unwrap();

        let entries = feed.since(0, 10, &[]).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].sequence < entries[1].sequence);
        assert_eq!(feed.last_sequence().unwrap(), entries[1].sequence);
    }

    #[test]
    fn since_filters_by_doc_ids() {
        let kvp = Arc::new(Kvp::open_in_memory().unwrap());
        let engine = RevisionEngine::new(kvp.clone(), 1000);
        let feed = ChangeFeed::new(kvp);

        engine
            .create(Some(DocId::new("a").unwrap()), serde_json::json!({}), BTreeMap::new(), false)
            .unwrap();
        engine
            .create(Some(DocId::new("b").unwrap()), serde_json::json!({}), BTreeMap::new(), false)
            .unwrap();

        let entries = feed.since(0, 10, &["b".to_string()]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].doc_id.as_str(), "b");
    }

    #[test]
    fn winning_rev_id_reflects_current_winner_not_the_entry() {
        let kvp = Arc::new(Kvp::open_in_memory().unwrap());
        let engine = RevisionEngine::new(kvp.clone(), 1000);
        let feed = ChangeFeed::new(kvp);

        let doc_id = DocId::new("a").unwrap();
        let root = engine
            .create(Some(doc_id.clone()), serde_json::json!({"v": 1}), BTreeMap::new(), false)
            .unwrap();
        let updated = engine
            .update(&doc_id, &root.rev_id, serde_json::json!({"v": 2}), BTreeMap::new())
            .unwrap();

        let entries = feed.since(0, 10, &[]).unwrap();
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            assert_eq!(entry.winning_rev_id.as_ref(), Some(&updated.rev_id));
        }
    }
}
