// src/conflict.rs

//! Conflict resolution: the read path for discovering conflicted
//! documents and the write path for resolving them.
//!
//! Resolution itself is delegated to
//! [`crate::revision::RevisionEngine::resolve_conflict`], which performs
//! the merge-leaf-insert and loser-tombstone-inserts as one KVP
//! transaction. This module adds the convenience of picking the current
//! winner as the merge parent automatically and indexing the result.

use crate::error::{Error, Result};
use crate::query::QueryEngine;
use crate::revision::model::{AttachmentDescriptor, DocId, Revision};
use crate::revision::{tree, RevisionEngine};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ConflictResolver {
    revisions: Arc<RevisionEngine>,
    query: Arc<QueryEngine>,
}

impl ConflictResolver {
    pub fn new(revisions: Arc<RevisionEngine>, query: Arc<QueryEngine>) -> Self {
        Self { revisions, query }
    }

    /// Returns every conflicting leaf for `doc_id` (all non-deleted
    /// leaves when there's more than one), or an empty vec if the
    /// document is not conflicted.
    pub fn conflicts(&self, doc_id: &DocId) -> Result<Vec<Revision>> {
        let leaves = self.revisions.leaves(doc_id)?;
        if !tree::is_conflicted(&leaves) {
            return Ok(Vec::new());
        }
        Ok(leaves.into_iter().filter(|r| !r.deleted).collect())
    }

    /// Resolves a conflict by merging into a new revision on top of the
    /// current winner, tombstoning every other live leaf. Fails if the
    /// document is not actually conflicted, so callers can't silently
    /// no-op a resolution they believe applied.
    pub fn resolve(
        &self,
        doc_id: &DocId,
        body: serde_json::Value,
        attachments: BTreeMap<String, AttachmentDescriptor>,
    ) -> Result<Revision> {
        let live = self.conflicts(doc_id)?;
        if live.len() < 2 {
            return Err(Error::Conflict(format!("document {doc_id} is not conflicted")));
        }

        let winner = tree::select_winner(&live)
            .cloned()
            .expect("non-empty live leaf set always has a winner");
        let losers: Vec<_> = live
            .into_iter()
            .filter(|r| r.rev_id != winner.rev_id)
            .map(|r| r.rev_id)
            .collect();

        let merged = self
            .revisions
            .resolve_conflict(doc_id, &winner.rev_id, &losers, body, attachments)?;
        self.query.index_document(doc_id, merged.body.as_ref())?;
        Ok(merged)
    }

    /// Resolves a conflict by keeping one of the existing conflicting
    /// leaves as the winner, tombstoning every other live leaf. Unlike
    /// [`ConflictResolver::resolve`], no new revision is created: `keep`
    /// itself becomes the document's winning revision.
    pub fn resolve_to_leaf(&self, doc_id: &DocId, keep: &crate::revision::model::RevId) -> Result<Revision> {
        let live = self.conflicts(doc_id)?;
        if live.len() < 2 {
            return Err(Error::Conflict(format!("document {doc_id} is not conflicted")));
        }
        if !live.iter().any(|r| &r.rev_id == keep) {
            return Err(Error::Conflict(format!(
                "{keep} is not a live leaf of document {doc_id}"
            )));
        }

        let losers: Vec<_> = live
            .into_iter()
            .map(|r| r.rev_id)
            .filter(|rev_id| rev_id != keep)
            .collect();
        self.revisions.tombstone_other_leaves(doc_id, keep, &losers)?;

        let winner = self.revisions.get_rev(doc_id, keep)?;
        self.query.index_document(doc_id, winner.body.as_ref())?;
        Ok(winner)
    }
}
