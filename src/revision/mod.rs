// src/revision/mod.rs

//! The revision engine: owns the document/revision forest, enforces
//! MVCC, and performs inserts, updates, deletes, conflict detection, and
//! pruning/compaction.
//!
//! Every public operation opens (or is handed) exactly one KVP write or
//! read transaction. The tree
//! itself is never held in memory as a pointer graph; it is reconstructed
//! from `revisions` rows on demand (see [`tree`]).

pub mod model;
pub mod tree;

use crate::error::{Error, Result};
use crate::kvp::Kvp;
use model::{compute_rev_id, compute_rev_hash, AttachmentDescriptor, DocId, RevId, Revision};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct RevisionEngine {
    kvp: Arc<Kvp>,
    revision_limit: u32,
}

impl RevisionEngine {
    pub fn new(kvp: Arc<Kvp>, revision_limit: u32) -> Self {
        Self { kvp, revision_limit }
    }

    /// Creates a new root revision. If `doc_id` is omitted, a random one
    /// is generated. Conflicts if `doc_id` is supplied and the document
    /// already has a non-deleted leaf.
    pub fn create(
        &self,
        doc_id: Option<DocId>,
        body: serde_json::Value,
        attachments: BTreeMap<String, AttachmentDescriptor>,
        local_only: bool,
    ) -> Result<Revision> {
        let digests: Vec<String> = attachments.values().map(|a| a.digest.clone()).collect();
        let rev_id = compute_rev_id(None, false, &body, &digests)?;
        let had_explicit_id = doc_id.is_some();

        self.kvp.run_write(|tx| {
            let doc_id = match doc_id {
                Some(id) => id,
                None => DocId::new(uuid::Uuid::new_v4().to_string())?,
            };

            if had_explicit_id {
                let leaves = fetch_leaves(tx, &doc_id)?;
                if leaves.iter().any(|r| !r.deleted) {
                    return Err(Error::Conflict(format!(
                        "document {doc_id} already exists"
                    )));
                }
            }

            let sequence = insert_revision_row(
                tx,
                &doc_id,
                &rev_id,
                None,
                false,
                Some(&body),
                local_only,
                &attachments,
            )?;

            Ok(Revision {
                doc_id,
                rev_id,
                parent_rev_id: None,
                deleted: false,
                body: Some(body),
                sequence,
                attachments,
                local_only,
            })
        })
    }

    /// Creates a new child revision. Conflicts unless `parent` is a
    /// current leaf of `doc_id`.
    pub fn update(
        &self,
        doc_id: &DocId,
        parent: &RevId,
        body: serde_json::Value,
        attachments: BTreeMap<String, AttachmentDescriptor>,
    ) -> Result<Revision> {
        let digests: Vec<String> = attachments.values().map(|a| a.digest.clone()).collect();
        let rev_id = compute_rev_id(Some(parent), false, &body, &digests)?;

        self.kvp.run_write(|tx| {
            let (parent_row, is_leaf) = fetch_row(tx, doc_id, parent)?.ok_or_else(|| {
                Error::NotFound(format!("revision {parent} of {doc_id} not found"))
            })?;
            if !is_leaf {
                return Err(Error::Conflict(format!(
                    "revision {parent} of {doc_id} is not a current leaf"
                )));
            }

            let sequence = insert_revision_row(
                tx,
                doc_id,
                &rev_id,
                Some(parent.clone()),
                false,
                Some(&body),
                parent_row.local_only,
                &attachments,
            )?;

            Ok(Revision {
                doc_id: doc_id.clone(),
                rev_id,
                parent_rev_id: Some(parent.clone()),
                deleted: false,
                body: Some(body),
                sequence,
                attachments,
                local_only: parent_row.local_only,
            })
        })
    }

    /// Creates a tombstone child revision. Same preconditions as
    /// `update`.
    pub fn delete(&self, doc_id: &DocId, parent: &RevId) -> Result<Revision> {
        let body = serde_json::json!({"_deleted": true});
        let rev_id = compute_rev_id(Some(parent), true, &body, &[])?;

        self.kvp.run_write(|tx| {
            let (parent_row, is_leaf) = fetch_row(tx, doc_id, parent)?.ok_or_else(|| {
                Error::NotFound(format!("revision {parent} of {doc_id} not found"))
            })?;
            if !is_leaf {
                return Err(Error::Conflict(format!(
                    "revision {parent} of {doc_id} is not a current leaf"
                )));
            }

            let sequence = insert_revision_row(
                tx,
                doc_id,
                &rev_id,
                Some(parent.clone()),
                true,
                Some(&body),
                parent_row.local_only,
                &BTreeMap::new(),
            )?;

            Ok(Revision {
                doc_id: doc_id.clone(),
                rev_id,
                parent_rev_id: Some(parent.clone()),
                deleted: true,
                body: Some(body),
                sequence,
                attachments: BTreeMap::new(),
                local_only: parent_row.local_only,
            })
        })
    }

    /// Grafts a foreign revision (and any ancestors the target is
    /// missing) into the tree. Never conflicts: when `parent` is not a
    /// current leaf, the branch is grafted at the deepest ancestor
    /// already present. Returns `Ok(false)` without assigning a new
    /// sequence if the revision was already installed (idempotent, per
    /// invariant 8).
    #[allow(clippy::too_many_arguments)]
    pub fn force_insert(
        &self,
        doc_id: &DocId,
        rev_id: &RevId,
        deleted: bool,
        body: Option<serde_json::Value>,
        attachments: BTreeMap<String, AttachmentDescriptor>,
        history: &[RevId],
        local_only: bool,
    ) -> Result<bool> {
        if let Some(b) = &body {
            let digests: Vec<String> = attachments.values().map(|a| a.digest.clone()).collect();
            let expected_parent = history.first();
            let actual_hash = compute_rev_hash(expected_parent, deleted, b, &digests)?;
            if actual_hash != rev_id.hash {
                return Err(Error::Corruption(format!(
                    "force_insert: revision hash mismatch for {doc_id}/{rev_id}"
                )));
            }
        }

        self.kvp.run_write(|tx| {
            if fetch_row(tx, doc_id, rev_id)?.is_some() {
                debug!("force_insert: {doc_id}/{rev_id} already present, no-op");
                return Ok(false);
            }

            let mut full_chain: Vec<RevId> = Vec::with_capacity(history.len() + 1);
            full_chain.push(rev_id.clone());
            full_chain.extend_from_slice(history);

            let mut existing_idx = None;
            for i in (1..full_chain.len()).rev() {
                if fetch_row(tx, doc_id, &full_chain[i])?.is_some() {
                    existing_idx = Some(i);
                    break;
                }
            }

            let mut parent_for_next: Option<RevId> = if let Some(idx) = existing_idx {
                mark_not_leaf(tx, doc_id, &full_chain[idx])?;
                Some(full_chain[idx].clone())
            } else {
                None
            };

            let iter_start = existing_idx.unwrap_or(full_chain.len());
            for i in (0..iter_start).rev() {
                let is_target = i == 0;
                let (body_i, deleted_i, attachments_i) = if is_target {
                    (body.clone(), deleted, attachments.clone())
                } else {
                    (None, false, BTreeMap::new())
                };

                insert_revision_row(
                    tx,
                    doc_id,
                    &full_chain[i],
                    parent_for_next.clone(),
                    deleted_i,
                    body_i.as_ref(),
                    local_only,
                    &attachments_i,
                )?;

                if !is_target {
                    mark_not_leaf(tx, doc_id, &full_chain[i])?;
                }
                parent_for_next = Some(full_chain[i].clone());
            }

            Ok(true)
        })
    }

    /// Atomically resolves a conflict: inserts `body` as a new leaf
    /// child of `winner_parent`, and tombstones every revision id in
    /// `losers`. Both happen inside one KVP write transaction, so a
    /// reader never observes the merged leaf without its losing
    /// branches also retired, or vice versa.
    pub fn resolve_conflict(
        &self,
        doc_id: &DocId,
        winner_parent: &RevId,
        losers: &[RevId],
        body: serde_json::Value,
        attachments: BTreeMap<String, AttachmentDescriptor>,
    ) -> Result<Revision> {
        let digests: Vec<String> = attachments.values().map(|a| a.digest.clone()).collect();
        let new_rev_id = compute_rev_id(Some(winner_parent), false, &body, &digests)?;

        self.kvp.run_write(|tx| {
            let (parent_row, is_leaf) = fetch_row(tx, doc_id, winner_parent)?.ok_or_else(|| {
                Error::NotFound(format!("revision {winner_parent} of {doc_id} not found"))
            })?;
            if !is_leaf {
                return Err(Error::Conflict(format!(
                    "revision {winner_parent} of {doc_id} is not a current leaf"
                )));
            }

            let sequence = insert_revision_row(
                tx,
                doc_id,
                &new_rev_id,
                Some(winner_parent.clone()),
                false,
                Some(&body),
                parent_row.local_only,
                &attachments,
            )?;
            let merged = Revision {
                doc_id: doc_id.clone(),
                rev_id: new_rev_id,
                parent_rev_id: Some(winner_parent.clone()),
                deleted: false,
                body: Some(body),
                sequence,
                attachments,
                local_only: parent_row.local_only,
            };

            for loser in losers {
                let (loser_row, loser_is_leaf) = fetch_row(tx, doc_id, loser)?.ok_or_else(|| {
                    Error::NotFound(format!("revision {loser} of {doc_id} not found"))
                })?;
                if !loser_is_leaf {
                    return Err(Error::Conflict(format!(
                        "revision {loser} of {doc_id} is not a current leaf"
                    )));
                }
                let tombstone_body = serde_json::json!({"_deleted": true});
                let tombstone_rev = compute_rev_id(Some(loser), true, &tombstone_body, &[])?;
                insert_revision_row(
                    tx,
                    doc_id,
                    &tombstone_rev,
                    Some(loser.clone()),
                    true,
                    Some(&tombstone_body),
                    loser_row.local_only,
                    &BTreeMap::new(),
                )?;
            }

            Ok(merged)
        })
    }

    /// Resolves a conflict by keeping an existing leaf as the sole
    /// winner: every other live leaf is tombstoned, and `keep` itself is
    /// left untouched (no new revision is created on top of it).
    pub fn tombstone_other_leaves(&self, doc_id: &DocId, keep: &RevId, losers: &[RevId]) -> Result<()> {
        self.kvp.run_write(|tx| {
            for loser in losers {
                if loser == keep {
                    continue;
                }
                let (loser_row, loser_is_leaf) = fetch_row(tx, doc_id, loser)?.ok_or_else(|| {
                    Error::NotFound(format!("revision {loser} of {doc_id} not found"))
                })?;
                if !loser_is_leaf {
                    return Err(Error::Conflict(format!(
                        "revision {loser} of {doc_id} is not a current leaf"
                    )));
                }
                let tombstone_body = serde_json::json!({"_deleted": true});
                let tombstone_rev = compute_rev_id(Some(loser), true, &tombstone_body, &[])?;
                insert_revision_row(
                    tx,
                    doc_id,
                    &tombstone_rev,
                    Some(loser.clone()),
                    true,
                    Some(&tombstone_body),
                    loser_row.local_only,
                    &BTreeMap::new(),
                )?;
            }
            Ok(())
        })
    }

    pub fn get_winner(&self, doc_id: &DocId) -> Result<Revision> {
        self.kvp.run_read(|conn| {
            let leaves = fetch_leaves(conn, doc_id)?;
            tree::select_winner(&leaves)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("document {doc_id} not found")))
        })
    }

    pub fn get_rev(&self, doc_id: &DocId, rev_id: &RevId) -> Result<Revision> {
        self.kvp.run_read(|conn| {
            fetch_row(conn, doc_id, rev_id)?
                .map(|(rev, _)| rev)
                .ok_or_else(|| Error::NotFound(format!("revision {rev_id} of {doc_id} not found")))
        })
    }

    pub fn leaves(&self, doc_id: &DocId) -> Result<Vec<Revision>> {
        self.kvp.run_read(|conn| fetch_leaves(conn, doc_id))
    }

    pub fn is_conflicted(&self, doc_id: &DocId) -> Result<bool> {
        self.kvp
            .run_read(|conn| Ok(tree::is_conflicted(&fetch_leaves(conn, doc_id)?)))
    }

    pub fn all_docs(&self, offset: u64, limit: u64, desc: bool) -> Result<Vec<Revision>> {
        self.kvp.run_read(|conn| {
            let order = if desc { "DESC" } else { "ASC" };
            let sql = format!(
                "SELECT DISTINCT doc_id FROM revisions ORDER BY doc_id {order} LIMIT ?1 OFFSET ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let ids: Vec<String> = stmt
                .query_map(params![limit as i64, offset as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let doc_id = DocId::new(id)?;
                let leaves = fetch_leaves(conn, &doc_id)?;
                if let Some(winner) = tree::select_winner(&leaves) {
                    out.push(winner.clone());
                }
            }
            Ok(out)
        })
    }

    /// Walks the ancestor chain of `rev_id` back to the root (or to the
    /// deepest ancestor still present, if earlier history was pruned),
    /// returning the chain ordered root-first.
    pub fn history(&self, doc_id: &DocId, rev_id: &RevId) -> Result<Vec<Revision>> {
        self.kvp.run_read(|conn| {
            let mut chain = Vec::new();
            let mut cursor = Some(rev_id.clone());
            while let Some(id) = cursor {
                let Some((rev, _)) = fetch_row(conn, doc_id, &id)? else {
                    break;
                };
                cursor = rev.parent_rev_id.clone();
                chain.push(rev);
            }
            chain.reverse();
            Ok(chain)
        })
    }

    /// Drops the body of every non-leaf revision, and deletes rows that
    /// fall outside (leaves ∪ ancestors-of-leaves-within-revision-limit)
    /// entirely. Runs inside a single KVP write transaction.
    pub fn compact(&self) -> Result<()> {
        self.kvp.run_write(|tx| {
            let doc_ids = distinct_doc_ids(tx)?;
            for doc_id in doc_ids {
                let leaf_ids: Vec<RevId> = fetch_leaves(tx, &doc_id)?
                    .into_iter()
                    .map(|r| r.rev_id)
                    .collect();
                let edges = fetch_edges(tx, &doc_id)?;
                let preserved = tree::preserved_set(&edges, &leaf_ids, self.revision_limit);

                tx.execute(
                    "UPDATE revisions SET body = NULL WHERE doc_id = ?1 AND is_leaf = 0",
                    params![doc_id.as_str()],
                )?;

                for edge in &edges {
                    if !leaf_ids.contains(&edge.rev_id) && !preserved.contains(&edge.rev_id) {
                        tx.execute(
                            "DELETE FROM revisions WHERE doc_id = ?1 AND generation = ?2 AND hash = ?3",
                            params![doc_id.as_str(), edge.rev_id.generation as i64, edge.rev_id.hash],
                        )?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Removes an entire document: every revision, attachment row, and
    /// change-feed entry.
    pub fn purge(&self, doc_id: &DocId) -> Result<()> {
        self.kvp.run_write(|tx| {
            tx.execute(
                "DELETE FROM revisions WHERE doc_id = ?1",
                params![doc_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM changes WHERE doc_id = ?1",
                params![doc_id.as_str()],
            )?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------
// Row plumbing
// ---------------------------------------------------------------------

struct RevRow {
    revision: Revision,
    is_leaf: bool,
}

fn mark_not_leaf(conn: &Connection, doc_id: &DocId, rev_id: &RevId) -> Result<()> {
    conn.execute(
        "UPDATE revisions SET is_leaf = 0 WHERE doc_id = ?1 AND generation = ?2 AND hash = ?3",
        params![doc_id.as_str(), rev_id.generation as i64, rev_id.hash],
    )?;
    Ok(())
}

fn fetch_attachments(
    conn: &Connection,
    sequence: i64,
) -> Result<BTreeMap<String, AttachmentDescriptor>> {
    let mut stmt = conn.prepare(
        "SELECT name, content_type, length, encoding, encoded_length, digest, revpos
         FROM attachments WHERE sequence = ?1",
    )?;
    let rows = stmt.query_map(params![sequence], |row| {
        let name: String = row.get(0)?;
        Ok((
            name.clone(),
            AttachmentDescriptor {
                name,
                content_type: row.get(1)?,
                length: row.get::<_, i64>(2)? as u64,
                encoding: row.get(3)?,
                encoded_length: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                digest: row.get(5)?,
                revpos: row.get::<_, i64>(6)? as u64,
                follows: false,
                stub: false,
            },
        ))
    })?;
    rows.collect::<std::result::Result<BTreeMap<_, _>, _>>()
        .map_err(Error::from)
}

fn row_to_revision(conn: &Connection, row: &rusqlite::Row) -> rusqlite::Result<RevRow> {
    let doc_id_s: String = row.get("doc_id")?;
    let generation: i64 = row.get("generation")?;
    let hash: String = row.get("hash")?;
    let parent_generation: Option<i64> = row.get("parent_generation")?;
    let parent_hash: Option<String> = row.get("parent_hash")?;
    let deleted: bool = row.get::<_, i64>("deleted")? != 0;
    let body_text: Option<String> = row.get("body")?;
    let local_only: bool = row.get::<_, i64>("local_only")? != 0;
    let is_leaf: bool = row.get::<_, i64>("is_leaf")? != 0;
    let sequence: i64 = row.get("sequence")?;

    let doc_id = DocId::new(doc_id_s).map_err(|_| {
        rusqlite::Error::InvalidColumnType(0, "doc_id".into(), rusqlite::types::Type::Text)
    })?;
    let body = body_text
        .map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "body".into(), rusqlite::types::Type::Text)
        })?;
    let parent_rev_id = match (parent_generation, parent_hash) {
        (Some(g), Some(h)) => Some(RevId::new(g as u64, h)),
        _ => None,
    };
    let attachments = fetch_attachments(conn, sequence).unwrap_or_default();

    Ok(RevRow {
        revision: Revision {
            doc_id,
            rev_id: RevId::new(generation as u64, hash),
            parent_rev_id,
            deleted,
            body,
            sequence,
            attachments,
            local_only,
        },
        is_leaf,
    })
}

const REV_COLUMNS: &str =
    "sequence, doc_id, generation, hash, parent_generation, parent_hash, deleted, body, local_only, is_leaf";

fn fetch_row(
    conn: &Connection,
    doc_id: &DocId,
    rev_id: &RevId,
) -> Result<Option<(Revision, bool)>> {
    let sql = format!(
        "SELECT {REV_COLUMNS} FROM revisions WHERE doc_id = ?1 AND generation = ?2 AND hash = ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt
        .query_row(
            params![doc_id.as_str(), rev_id.generation as i64, rev_id.hash],
            |row| row_to_revision(conn, row),
        )
        .optional()?;
    Ok(row.map(|r| (r.revision, r.is_leaf)))
}

fn fetch_leaves(conn: &Connection, doc_id: &DocId) -> Result<Vec<Revision>> {
    let sql = format!("SELECT {REV_COLUMNS} FROM revisions WHERE doc_id = ?1 AND is_leaf = 1");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![doc_id.as_str()], |row| row_to_revision(conn, row))?;
    rows.map(|r| r.map(|rr| rr.revision))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Resolves a document's current winning `RevId` on an already-open
/// connection, for callers (the change feed) that need it alongside
/// other reads in the same transaction rather than opening their own.
pub(crate) fn winner_for(conn: &Connection, doc_id: &DocId) -> Result<Option<RevId>> {
    let leaves = fetch_leaves(conn, doc_id)?;
    Ok(tree::select_winner(&leaves).map(|r| r.rev_id.clone()))
}

fn distinct_doc_ids(conn: &Connection) -> Result<Vec<DocId>> {
    let mut stmt = conn.prepare("SELECT DISTINCT doc_id FROM revisions")?;
    let ids: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    ids.into_iter().map(DocId::new).collect()
}

fn fetch_edges(conn: &Connection, doc_id: &DocId) -> Result<Vec<tree::Edge>> {
    let mut stmt = conn.prepare(
        "SELECT generation, hash, parent_generation, parent_hash FROM revisions WHERE doc_id = ?1",
    )?;
    let rows = stmt.query_map(params![doc_id.as_str()], |row| {
        let generation: i64 = row.get(0)?;
        let hash: String = row.get(1)?;
        let parent_generation: Option<i64> = row.get(2)?;
        let parent_hash: Option<String> = row.get(3)?;
        Ok(tree::Edge {
            rev_id: RevId::new(generation as u64, hash),
            parent_rev_id: match (parent_generation, parent_hash) {
                (Some(g), Some(h)) => Some(RevId::new(g as u64, h)),
                _ => None,
            },
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

fn insert_revision_row(
    conn: &Connection,
    doc_id: &DocId,
    rev_id: &RevId,
    parent: Option<RevId>,
    deleted: bool,
    body: Option<&serde_json::Value>,
    local_only: bool,
    attachments: &BTreeMap<String, AttachmentDescriptor>,
) -> Result<i64> {
    let body_text = body.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO revisions
            (doc_id, generation, hash, parent_generation, parent_hash, deleted, body, local_only, is_leaf)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
        params![
            doc_id.as_str(),
            rev_id.generation as i64,
            rev_id.hash,
            parent.as_ref().map(|p| p.generation as i64),
            parent.as_ref().map(|p| p.hash.clone()),
            deleted as i64,
            body_text,
            local_only as i64,
        ],
    )?;
    let sequence = conn.last_insert_rowid();

    if let Some(parent) = &parent {
        mark_not_leaf(conn, doc_id, parent)?;
    }

    for attachment in attachments.values() {
        conn.execute(
            "INSERT INTO attachments
                (sequence, name, content_type, length, encoding, encoded_length, digest, revpos)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                sequence,
                attachment.name,
                attachment.content_type,
                attachment.length as i64,
                attachment.encoding,
                attachment.encoded_length.map(|v| v as i64),
                attachment.digest,
                attachment.revpos as i64,
            ],
        )?;
    }

    conn.execute(
        "INSERT INTO changes (sequence, doc_id, generation, hash, deleted) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![sequence, doc_id.as_str(), rev_id.generation as i64, rev_id.hash, deleted as i64],
    )?;

    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvp::Kvp;

    fn engine() -> RevisionEngine {
        RevisionEngine::new(Arc::new(Kvp::open_in_memory().unwrap()), 1000)
    }

    #[test]
    fn create_then_update_then_get_winner() {
        let engine = engine();
        let created = engine
            .create(
                Some(DocId::new("a").unwrap()),
                serde_json::json!({"n": 1}),
                BTreeMap::new(),
                false,
            )
            .unwrap();
        assert_eq!(created.rev_id.generation, 1);

        let updated = engine
            .update(
                &created.doc_id,
                &created.rev_id,
                serde_json::json!({"n": 2}),
                BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(updated.rev_id.generation, 2);

        let winner = engine.get_winner(&created.doc_id).unwrap();
        assert_eq!(winner.rev_id, updated.rev_id);
        assert_eq!(winner.body.unwrap()["n"], 2);
    }

    #[test]
    fn create_conflicts_on_existing_doc() {
        let engine = engine();
        let doc_id = DocId::new("a").unwrap();
        engine
            .create(Some(doc_id.clone()), serde_json::json!({}), BTreeMap::new(), false)
            .unwrap();
        let result = engine.create(Some(doc_id), serde_json::json!({}), BTreeMap::new(), false);
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn update_conflicts_on_non_leaf_parent() {
        let engine = engine();
        let created = engine
            .create(Some(DocId::new("a").unwrap()), serde_json::json!({}), BTreeMap::new(), false)
            .unwrap();
        engine
            .update(&created.doc_id, &created.rev_id, serde_json::json!({"n": 1}), BTreeMap::new())
            .unwrap();

        // parent rev is no longer a leaf
        let result = engine.update(&created.doc_id, &created.rev_id, serde_json::json!({"n": 2}), BTreeMap::new());
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn delete_produces_tombstone_and_changes_winner() {
        let engine = engine();
        let created = engine
            .create(Some(DocId::new("a").unwrap()), serde_json::json!({}), BTreeMap::new(), false)
            .unwrap();
        let tombstone = engine.delete(&created.doc_id, &created.rev_id).unwrap();
        assert!(tombstone.deleted);

        let winner = engine.get_winner(&created.doc_id).unwrap();
        assert!(winner.deleted);
    }

    #[test]
    fn force_insert_grafts_at_deepest_known_ancestor_and_is_idempotent() {
        let engine = engine();
        let doc_id = DocId::new("c").unwrap();

        let root = engine
            .create(Some(doc_id.clone()), serde_json::json!({"v": "A"}), BTreeMap::new(), false)
            .unwrap();

        // local edit produces one leaf at generation 2
        engine
            .update(&doc_id, &root.rev_id, serde_json::json!({"v": "local"}), BTreeMap::new())
            .unwrap();

        // a peer grafts a diverging leaf, also at generation 2, from the same parent
        let foreign_body = serde_json::json!({"v": "remote"});
        let foreign_rev = compute_rev_id(Some(&root.rev_id), false, &foreign_body, &[]).unwrap();
        let inserted = engine
            .force_insert(
                &doc_id,
                &foreign_rev,
                false,
                Some(foreign_body),
                BTreeMap::new(),
                &[root.rev_id.clone()],
                false,
            )
            .unwrap();
        assert!(inserted);

        // document now has two live leaves at generation 2: conflicted
        assert!(engine.is_conflicted(&doc_id).unwrap());
        assert_eq!(engine.leaves(&doc_id).unwrap().len(), 2);

        // re-inserting the same revision is a no-op
        let again = engine
            .force_insert(
                &doc_id,
                &foreign_rev,
                false,
                Some(serde_json::json!({"v": "remote"})),
                BTreeMap::new(),
                &[root.rev_id.clone()],
                false,
            )
            .unwrap();
        assert!(!again);
        assert_eq!(engine.leaves(&doc_id).unwrap().len(), 2);
    }

    #[test]
    fn history_walks_to_root() {
        let engine = engine();
        let doc_id = DocId::new("a").unwrap();
        let r1 = engine
            .create(Some(doc_id.clone()), serde_json::json!({"n": 1}), BTreeMap::new(), false)
            .unwrap();
        let r2 = engine
            .update(&doc_id, &r1.rev_id, serde_json::json!({"n": 2}), BTreeMap::new())
            .unwrap();

        let chain = engine.history(&doc_id, &r2.rev_id).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].rev_id, r1.rev_id);
        assert_eq!(chain[1].rev_id, r2.rev_id);
    }

    #[test]
    fn compact_drops_non_leaf_bodies_but_keeps_shape() {
        let engine = engine();
        let doc_id = DocId::new("d").unwrap();
        let mut rev = engine
            .create(Some(doc_id.clone()), serde_json::json!({"n": 0}), BTreeMap::new(), false)
            .unwrap();
        for i in 1..10 {
            rev = engine
                .update(&doc_id, &rev.rev_id, serde_json::json!({"n": i}), BTreeMap::new())
                .unwrap();
        }

        engine.compact().unwrap();

        let leaf = engine.get_rev(&doc_id, &rev.rev_id).unwrap();
        assert!(leaf.body.is_some());

        let chain = engine.history(&doc_id, &rev.rev_id).unwrap();
        assert_eq!(chain.len(), 10);
        assert!(chain[0].body.is_none());

        let winner = engine.get_winner(&doc_id).unwrap();
        assert_eq!(winner.rev_id, rev.rev_id);
    }

    #[test]
    fn resolve_conflict_merges_and_tombstones_losers_atomically() {
        let engine = engine();
        let doc_id = DocId::new("c").unwrap();
        let root = engine
            .create(Some(doc_id.clone()), serde_json::json!({"v": "A"}), BTreeMap::new(), false)
            .unwrap();
        let a = engine
            .update(&doc_id, &root.rev_id, serde_json::json!({"v": "branch-a"}), BTreeMap::new())
            .unwrap();
        let foreign_body = serde_json::json!({"v": "branch-b"});
        let b_rev = compute_rev_id(Some(&root.rev_id), false, &foreign_body, &[]).unwrap();
        engine
            .force_insert(&doc_id, &b_rev, false, Some(foreign_body), BTreeMap::new(), &[root.rev_id.clone()], false)
            .unwrap();
        assert!(engine.is_conflicted(&doc_id).unwrap());

        let merged = engine
            .resolve_conflict(&doc_id, &a.rev_id, &[b_rev.clone()], serde_json::json!({"v": "merged"}), BTreeMap::new())
            .unwrap();

        assert!(!engine.is_conflicted(&doc_id).unwrap());
        let winner = engine.get_winner(&doc_id).unwrap();
        assert_eq!(winner.rev_id, merged.rev_id);
        let tombstoned = engine.leaves(&doc_id).unwrap();
        assert!(tombstoned.iter().any(|r| r.parent_rev_id.as_ref() == Some(&b_rev) && r.deleted));
    }

    #[test]
    fn purge_removes_everything() {
        let engine = engine();
        let doc_id = DocId::new("a").unwrap();
        let created = engine
            .create(Some(doc_id.clone()), serde_json::json!({}), BTreeMap::new(), false)
            .unwrap();
        engine.purge(&doc_id).unwrap();
        let result = engine.get_rev(&doc_id, &created.rev_id);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
