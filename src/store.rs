// src/store.rs

//! `Datastore`: the top-level facade wiring `kvp`, `blob`, `revision`,
//! `attachments`, `changes`, `query`, `conflict`, and `replication`
//! together into the document-level API callers actually use, collapsed
//! into a single struct since this crate's primary surface is the
//! library, not the CLI.

use crate::attachments::AttachmentManager;
use crate::blob::BlobStore;
use crate::changes::ChangeFeed;
use crate::conflict::ConflictResolver;
use crate::config::{CancellationToken, ReplicatorOptions, StoreOptions};
use crate::error::{Error, Result};
use crate::kvp::Kvp;
use crate::query::planner::IndexKind;
use crate::query::{selector, QueryEngine};
use crate::replication::{ReplicationSummary, Replicator};
use crate::revision::model::{AttachmentDescriptor, DocId, Revision};
use crate::revision::RevisionEngine;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One page of a query result: the matching winning revisions plus
/// whatever residual filtering the planner could not push into an
/// index.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub docs: Vec<Revision>,
}

pub struct Datastore {
    kvp: Arc<Kvp>,
    blob: Arc<BlobStore>,
    revisions: Arc<RevisionEngine>,
    attachments: Arc<AttachmentManager>,
    changes: Arc<ChangeFeed>,
    query: Arc<QueryEngine>,
    conflicts: ConflictResolver,
    // Keeps an `open_in_memory` store's scratch attachment directory
    // alive for as long as the store itself.
    _scratch_dir: Option<tempfile::TempDir>,
}

impl Datastore {
    pub fn open(options: StoreOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.root)?;
        let kvp = Arc::new(Kvp::open(options.root.join("db.sqlite"))?);
        std::fs::create_dir_all(options.root.join("extensions"))?;

        let blob = Arc::new(BlobStore::open(
            options.root.join("attachments"),
            kvp.clone(),
            options.encryption.clone(),
        )?);
        let revisions = Arc::new(RevisionEngine::new(kvp.clone(), options.revision_limit));
        let attachments = Arc::new(AttachmentManager::new(blob.clone()));
        let changes = Arc::new(ChangeFeed::new(kvp.clone()));
        let query = Arc::new(QueryEngine::new(kvp.clone()));
        let conflicts = ConflictResolver::new(revisions.clone(), query.clone());

        Ok(Self {
            kvp,
            blob,
            revisions,
            attachments,
            changes,
            query,
            conflicts,
            _scratch_dir: None,
        })
    }

    /// Opens an in-memory, unencrypted store for tests or ephemeral use.
    pub fn open_in_memory() -> Result<Self> {
        let kvp = Arc::new(Kvp::open_in_memory()?);
        let dir = tempfile::tempdir()?;
        let blob = Arc::new(BlobStore::open(
            dir.path(),
            kvp.clone(),
            Arc::new(crate::config::NoEncryption),
        )?);
        let revisions = Arc::new(RevisionEngine::new(kvp.clone(), crate::config::DEFAULT_REVISION_LIMIT));
        let attachments = Arc::new(AttachmentManager::new(blob.clone()));
        let changes = Arc::new(ChangeFeed::new(kvp.clone()));
        let query = Arc::new(QueryEngine::new(kvp.clone()));
        let conflicts = ConflictResolver::new(revisions.clone(), query.clone());
        Ok(Self { kvp, blob, revisions, attachments, changes, query, conflicts, _scratch_dir: Some(dir) })
    }

    /// Inserts a new document. If `doc_id` is `None`, one is generated.
    /// `body` may carry an `_attachments` field with inline base64 data.
    pub fn put(&self, doc_id: Option<DocId>, mut body: serde_json::Value) -> Result<Revision> {
        let incoming_attachments = body
            .as_object_mut()
            .and_then(|map| map.remove("_attachments"));
        let attachments = self.attachments.prepare(&BTreeMap::new(), incoming_attachments.as_ref(), 1)?;

        let revision = self.revisions.create(doc_id, body, attachments, false)?;
        self.reindex_winner(&revision.doc_id)?;
        Ok(revision)
    }

    /// Updates the document at `doc_id`, child of `parent`.
    pub fn update(&self, doc_id: &DocId, parent: &crate::revision::model::RevId, mut body: serde_json::Value) -> Result<Revision> {
        let incoming_attachments = body
            .as_object_mut()
            .and_then(|map| map.remove("_attachments"));
        let current = self.revisions.get_rev(doc_id, parent)?;
        let attachments = self.attachments.prepare(&current.attachments, incoming_attachments.as_ref(), parent.generation + 1)?;

        let revision = self.revisions.update(doc_id, parent, body, attachments)?;
        self.reindex_winner(doc_id)?;
        Ok(revision)
    }

    pub fn delete(&self, doc_id: &DocId, parent: &crate::revision::model::RevId) -> Result<Revision> {
        let revision = self.revisions.delete(doc_id, parent)?;
        self.reindex_winner(doc_id)?;
        Ok(revision)
    }

    /// Fetches the current winning revision, with `_attachments`
    /// materialized as stubs (`include_bodies = false`) or full inline
    /// bodies.
    pub fn get(&self, doc_id: &DocId, include_attachment_bodies: bool) -> Result<serde_json::Value> {
        let winner = self.revisions.get_winner(doc_id)?;
        self.render(&winner, include_attachment_bodies)
    }

    pub fn get_rev(&self, doc_id: &DocId, rev_id: &crate::revision::model::RevId, include_attachment_bodies: bool) -> Result<serde_json::Value> {
        let revision = self.revisions.get_rev(doc_id, rev_id)?;
        self.render(&revision, include_attachment_bodies)
    }

    fn render(&self, revision: &Revision, include_attachment_bodies: bool) -> Result<serde_json::Value> {
        let mut obj = match &revision.body {
            Some(serde_json::Value::Object(map)) => map.clone(),
            Some(_) | None => serde_json::Map::new(),
        };
        obj.insert("_id".into(), revision.doc_id.to_string().into());
        obj.insert("_rev".into(), revision.rev_id.to_string().into());
        if revision.deleted {
            obj.insert("_deleted".into(), true.into());
        }
        if !revision.attachments.is_empty() {
            let attachments = self.attachments.materialize(&revision.attachments, include_attachment_bodies)?;
            obj.insert("_attachments".into(), attachments.into());
        }
        Ok(serde_json::Value::Object(obj))
    }

    pub fn fetch_attachment(&self, doc_id: &DocId, name: &str) -> Result<Vec<u8>> {
        let winner = self.revisions.get_winner(doc_id)?;
        let descriptor = winner
            .attachments
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("attachment '{name}' on {doc_id}")))?;
        self.attachments.fetch(descriptor)
    }

    /// Runs a Mango-like selector query, using an index when the planner
    /// finds one covering the leading equality constraints and falling
    /// back to a full scan with residual in-memory filtering otherwise.
    ///
    /// `sort` is a list of `(field, descending)` pairs preserving order
    /// from the chosen index; every sort field must be covered by that
    /// index or this returns [`Error::UnsupportedSort`].
    pub fn query(&self, selector_value: &serde_json::Value, sort: &[(&str, bool)], limit: usize) -> Result<QueryPage> {
        let candidates = self.query.candidate_doc_ids(selector_value, sort)?;
        let doc_ids = match candidates {
            Some(ids) => ids,
            None => {
                let winners = self.revisions.all_docs(0, u64::MAX, false)?;
                winners.into_iter().map(|r| r.doc_id).collect()
            }
        };

        let mut docs = Vec::new();
        for doc_id in doc_ids {
            if docs.len() >= limit {
                break;
            }
            let winner = self.revisions.get_winner(&doc_id)?;
            if winner.deleted {
                continue;
            }
            let Some(body) = &winner.body else { continue };
            if selector::matches(selector_value, body)? {
                docs.push(winner);
            }
        }
        Ok(QueryPage { docs })
    }

    pub fn create_index(&self, name: &str, fields: Vec<String>, kind: IndexKind) -> Result<String> {
        self.query.create_index(name, fields, kind)
    }

    /// Full-text search against a `text`-kind index.
    pub fn text_search(&self, index_name: &str, query: &str) -> Result<Vec<DocId>> {
        self.query.text_search(index_name, query)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.query.drop_index(name)
    }

    /// Rebuilds every index's rows from scratch, for use after
    /// `create_index` on a store with pre-existing documents or after
    /// `purge`/bulk pull operations that bypassed incremental indexing.
    pub fn reindex(&self) -> Result<()> {
        let winners = self.revisions.all_docs(0, u64::MAX, false)?;
        for winner in winners {
            let body = if winner.deleted { None } else { winner.body.as_ref() };
            self.query.index_document(&winner.doc_id, body)?;
        }
        Ok(())
    }

    fn reindex_winner(&self, doc_id: &DocId) -> Result<()> {
        let winner = self.revisions.get_winner(doc_id)?;
        let body = if winner.deleted { None } else { winner.body.as_ref() };
        self.query.index_document(doc_id, body)
    }

    pub fn conflicts(&self, doc_id: &DocId) -> Result<Vec<Revision>> {
        self.conflicts.conflicts(doc_id)
    }

    pub fn resolve_conflict(
        &self,
        doc_id: &DocId,
        mut body: serde_json::Value,
    ) -> Result<Revision> {
        let incoming_attachments = body
            .as_object_mut()
            .and_then(|map| map.remove("_attachments"));
        let attachments = self.attachments.prepare(&BTreeMap::new(), incoming_attachments.as_ref(), 1)?;
        self.conflicts.resolve(doc_id, body, attachments)
    }

    /// Resolves a conflict by picking one of the existing conflicting
    /// leaves as the winner rather than merging into a new revision.
    pub fn resolve_conflict_to_leaf(&self, doc_id: &DocId, keep: &crate::revision::model::RevId) -> Result<Revision> {
        self.conflicts.resolve_to_leaf(doc_id, keep)
    }

    pub fn compact(&self) -> Result<()> {
        self.revisions.compact()
    }

    pub fn purge(&self, doc_id: &DocId) -> Result<()> {
        self.revisions.purge(doc_id)?;
        self.query.index_document(doc_id, None)
    }

    /// Garbage-collects any blob no longer referenced by a live
    /// revision's attachment set. Works for both encrypted and
    /// unencrypted stores; see [`crate::blob::BlobStore::gc`].
    pub fn gc_blobs(&self) -> Result<u64> {
        let mut referenced = std::collections::HashSet::new();
        for winner in self.revisions.all_docs(0, u64::MAX, false)? {
            for attachment in winner.attachments.values() {
                referenced.insert(attachment.digest.clone());
            }
        }

        let removed = self.blob.gc(&referenced)?;
        debug!("gc_blobs: removed {removed} unreferenced blobs");
        Ok(removed)
    }

    /// Starts a replication session against a remote peer.
    pub fn replicator(&self, options: ReplicatorOptions) -> Result<Replicator> {
        Replicator::new(
            options,
            self.kvp.clone(),
            self.revisions.clone(),
            self.attachments.clone(),
            self.changes.clone(),
            self.query.clone(),
        )
    }

    pub fn pull(&self, options: ReplicatorOptions, cancel: &CancellationToken) -> Result<ReplicationSummary> {
        self.replicator(options)?.pull(cancel)
    }

    pub fn push(&self, options: ReplicatorOptions, cancel: &CancellationToken) -> Result<ReplicationSummary> {
        self.replicator(options)?.push(cancel)
    }

    pub fn sync(
        &self,
        options: ReplicatorOptions,
        cancel: &CancellationToken,
    ) -> Result<(ReplicationSummary, ReplicationSummary)> {
        self.replicator(options)?.sync(cancel)
    }
}
