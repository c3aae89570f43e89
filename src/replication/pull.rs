// src/replication/pull.rs

//! Pull replication: fetches `_changes` from the remote, diffs against
//! local history with `_revs_diff`, fetches the missing bodies via
//! `open_revs`, and grafts them in with `RevisionEngine::force_insert`,
//! never conflicting locally.

use super::checkpoint::CheckpointStore;
use super::client::ReplicationClient;
use super::{current_timestamp, replication_id, ReplicationSummary};
use crate::attachments::AttachmentManager;
use crate::config::{CancellationToken, ReplicatorOptions};
use crate::error::{Error, Result};
use crate::query::QueryEngine;
use crate::revision::model::{AttachmentDescriptor, DocId, RevId};
use crate::revision::RevisionEngine;
use base64::Engine;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

pub struct Puller<'a> {
    pub client: &'a ReplicationClient,
    pub revisions: &'a RevisionEngine,
    pub attachments: &'a AttachmentManager,
    pub query: &'a QueryEngine,
    pub checkpoints: &'a CheckpointStore,
    pub options: &'a ReplicatorOptions,
}

impl Puller<'_> {
    pub fn run(&self, cancel: &CancellationToken) -> Result<ReplicationSummary> {
        let rep_id = replication_id("pull", self.options);
        let mut since = self
            .checkpoints
            .get(&rep_id)?
            .unwrap_or_else(|| "0".to_string());
        let mut docs_written = 0u64;

        loop {
            cancel.check()?;
            let filter = self
                .options
                .filter_name
                .as_deref()
                .map(|name| (name, self.options.filter_params.as_slice()));
            let page = self.client.get_changes(
                cancel,
                &since,
                self.options.changes_batch,
                &self.options.doc_ids,
                filter,
            )?;
            if page.results.is_empty() {
                break;
            }

            let mut revs_diff_request: HashMap<String, Vec<String>> = HashMap::new();
            for row in &page.results {
                let revs = row.changes.iter().map(|c| c.rev.clone()).collect();
                revs_diff_request.insert(row.id.clone(), revs);
            }

            let diff = self.client.post_revs_diff(cancel, &revs_diff_request)?;

            // Each doc_id's fetch-and-graft is independent of the others, so
            // fan the page out across a rayon pool rather than paying the
            // round-trip latency of `get_open_revs` serially per document.
            let written_per_doc: Vec<u64> = diff
                .par_iter()
                .map(|(doc_id, entry)| -> Result<u64> {
                    cancel.check()?;
                    if entry.missing.is_empty() {
                        return Ok(0);
                    }
                    let docs = self.client.get_open_revs(cancel, doc_id, &entry.missing)?;
                    let mut written = 0u64;
                    for wrapped in docs {
                        let Some(doc) = wrapped.get("ok") else { continue };
                        self.apply_foreign_revision(doc_id, doc)?;
                        written += 1;
                    }
                    Ok(written)
                })
                .collect::<Result<Vec<u64>>>()?;
            docs_written += written_per_doc.iter().sum::<u64>();

            since = match &page.last_seq {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.checkpoints.set(&rep_id, &since)?;
            info!("pull: checkpoint advanced to {since}, {docs_written} docs so far");

            if (page.results.len() as u32) < self.options.changes_batch {
                break;
            }
        }

        Ok(ReplicationSummary { docs_written, last_seq: since, completed_at: current_timestamp() })
    }

    fn apply_foreign_revision(&self, doc_id: &str, doc: &serde_json::Value) -> Result<()> {
        let doc_id = DocId::new(doc_id)?;
        let rev_str = doc
            .get("_rev")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::FatalReplication("remote document missing _rev".to_string()))?;
        let rev_id: RevId = rev_str
            .parse()
            .map_err(|_| Error::FatalReplication(format!("malformed remote rev '{rev_str}'")))?;
        let deleted = doc.get("_deleted").and_then(|v| v.as_bool()).unwrap_or(false);
        let history = parse_revisions_history(doc, &rev_id)?;

        let mut body = doc.clone();
        if let serde_json::Value::Object(map) = &mut body {
            for key in ["_id", "_rev", "_revisions", "_attachments", "_deleted"] {
                map.remove(key);
            }
        }

        let attachments = self.resolve_foreign_attachments(doc.get("_attachments"))?;

        let inserted = self.revisions.force_insert(
            &doc_id,
            &rev_id,
            deleted,
            Some(body),
            attachments,
            &history,
            false,
        )?;

        if inserted {
            let winner = self.revisions.get_winner(&doc_id)?;
            self.query
                .index_document(&doc_id, if winner.deleted { None } else { winner.body.as_ref() })?;
            debug!("pulled {doc_id}/{rev_id}");
        }
        Ok(())
    }

    fn resolve_foreign_attachments(
        &self,
        incoming: Option<&serde_json::Value>,
    ) -> Result<BTreeMap<String, AttachmentDescriptor>> {
        let Some(incoming) = incoming else {
            return Ok(BTreeMap::new());
        };
        let map = incoming
            .as_object()
            .ok_or_else(|| Error::FatalReplication("_attachments must be an object".to_string()))?;

        let mut out = BTreeMap::new();
        for (name, entry) in map {
            let entry = entry
                .as_object()
                .ok_or_else(|| Error::FatalReplication(format!("attachment '{name}' malformed")))?;
            let revpos = entry.get("revpos").and_then(|v| v.as_u64()).unwrap_or(1);
            let content_type = entry
                .get("content_type")
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream");
            let digest = entry.get("digest").and_then(|v| v.as_str());
            let is_stub = entry.get("stub").and_then(|v| v.as_bool()).unwrap_or(false);

            let descriptor = if is_stub {
                let digest = digest.ok_or_else(|| {
                    Error::FatalReplication(format!("stub attachment '{name}' has no digest"))
                })?;
                if !self.attachments.blob().exists(digest)? {
                    return Err(Error::BlobMissing(digest.to_string()));
                }
                AttachmentDescriptor {
                    name: name.clone(),
                    content_type: content_type.to_string(),
                    length: entry.get("length").and_then(|v| v.as_u64()).unwrap_or(0),
                    encoding: None,
                    encoded_length: None,
                    digest: digest.to_string(),
                    revpos,
                    follows: false,
                    stub: false,
                }
            } else {
                let data_b64 = entry.get("data").and_then(|v| v.as_str()).ok_or_else(|| {
                    Error::FatalReplication(format!("attachment '{name}' missing inline data"))
                })?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data_b64)
                    .map_err(|e| Error::FatalReplication(format!("attachment '{name}' bad base64: {e}")))?;
                self.attachments.store_foreign(name, content_type, &bytes, revpos, digest)?
            };
            out.insert(name.clone(), descriptor);
        }
        Ok(out)
    }
}

/// Converts the CouchDB-style `_revisions: {start, ids}` compact history
/// (hashes only, newest generation first) into the ancestor `RevId` list
/// `force_insert` expects, excluding the current revision itself.
fn parse_revisions_history(doc: &serde_json::Value, current: &RevId) -> Result<Vec<RevId>> {
    let Some(revisions) = doc.get("_revisions") else {
        return Ok(Vec::new());
    };
    let start = revisions
        .get("start")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::FatalReplication("_revisions missing start".to_string()))?;
    let ids = revisions
        .get("ids")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::FatalReplication("_revisions missing ids".to_string()))?;

    if start != current.generation {
        return Err(Error::FatalReplication(
            "_revisions start does not match _rev generation".to_string(),
        ));
    }

    let mut history = Vec::with_capacity(ids.len().saturating_sub(1));
    for (offset, id) in ids.iter().enumerate().skip(1) {
        let hash = id
            .as_str()
            .ok_or_else(|| Error::FatalReplication("_revisions id is not a string".to_string()))?;
        history.push(RevId::new(start - offset as u64, hash.to_string()));
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_revisions_history_newest_first() {
        let doc = serde_json::json!({
            "_rev": "3-ccc",
            "_revisions": {"start": 3, "ids": ["ccc", "bbb", "aaa"]}
        });
        let current = RevId::new(3, "ccc");
        let history = parse_revisions_history(&doc, &current).unwrap();
        assert_eq!(history, vec![RevId::new(2, "bbb"), RevId::new(1, "aaa")]);
    }

    #[test]
    fn missing_revisions_field_yields_empty_history() {
        let doc = serde_json::json!({"_rev": "1-aaa"});
        let history = parse_revisions_history(&doc, &RevId::new(1, "aaa")).unwrap();
        assert!(history.is_empty());
    }
}
