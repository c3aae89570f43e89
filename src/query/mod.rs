// src/query/mod.rs

//! Secondary indexing: maintains per-index backing tables and plans
//! selector queries against them, falling back to a full scan with
//! in-memory residual filtering when no index covers the query.
//!
//! Index maintenance is push-based: [`QueryEngine::index_document`] is
//! called by [`crate::store::Datastore`] after every committed write
//! with the document's new winning body (or `None` if the winner is now
//! a tombstone or the document was purged).

pub mod planner;
pub mod selector;

use crate::error::{Error, Result};
use crate::kvp::Kvp;
use crate::revision::model::DocId;
use planner::{IndexDef, IndexKind, Plan};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

pub struct QueryEngine {
    kvp: Arc<Kvp>,
}

impl QueryEngine {
    pub fn new(kvp: Arc<Kvp>) -> Self {
        Self { kvp }
    }

    /// Creates an index, or returns the name of an equivalent existing
    /// one. Idempotent: if an index named `name` already exists with the
    /// identical field list and kind, this is a no-op that returns
    /// `name`. If `name` exists with a different definition, the old
    /// index is dropped and recreated with the new one.
    pub fn create_index(&self, name: &str, fields: Vec<String>, kind: IndexKind) -> Result<String> {
        validate_index_name(name)?;
        if fields.is_empty() {
            return Err(Error::Configuration(
                "an index requires at least one field".to_string(),
            ));
        }
        for field in &fields {
            validate_field_path(field)?;
        }

        if let Some(existing) = self.get_def(name)? {
            if existing.kind == kind && existing.fields == fields {
                debug!("index '{name}' already exists with an identical definition, no-op");
                return Ok(name.to_string());
            }
            debug!("index '{name}' exists with a different definition, dropping and recreating");
            self.drop_index(name)?;
        }

        self.kvp.run_write(|tx| {
            let fields_json = serde_json::to_string(&fields)?;
            tx.execute(
                "INSERT INTO index_defs (name, kind, fields, settings) VALUES (?1, ?2, ?3, ?4)",
                params![name, kind.as_str(), fields_json, "{}"],
            )?;

            match kind {
                IndexKind::Json => {
                    let columns = (0..fields.len())
                        .map(|i| format!("f{i} TEXT"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    tx.execute_batch(&format!(
                        "CREATE TABLE idx_{name} (doc_id TEXT NOT NULL, {columns})"
                    ))?;

                    let index_cols = (0..fields.len())
                        .map(|i| format!("f{i}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    tx.execute_batch(&format!(
                        "CREATE INDEX idx_{name}_cols ON idx_{name}({index_cols})"
                    ))?;
                }
                IndexKind::Text => {
                    // An FTS5 virtual table tokenizes each configured field as
                    // its own column; `doc_id` rides along unindexed so it
                    // can still be projected and filtered on by exact match.
                    let columns = (0..fields.len())
                        .map(|i| format!("f{i}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    tx.execute_batch(&format!(
                        "CREATE VIRTUAL TABLE idx_{name} USING fts5(doc_id UNINDEXED, {columns}, tokenize = 'porter unicode61')"
                    ))?;
                }
            }

            Ok(())
        })?;

        debug!("created index '{name}' on {fields:?}");
        Ok(name.to_string())
    }

    fn get_def(&self, name: &str) -> Result<Option<IndexDef>> {
        let row = self.kvp.run_read(|conn| {
            conn.query_row(
                "SELECT name, kind, fields FROM index_defs WHERE name = ?1",
                params![name],
                |row| {
                    let name: String = row.get(0)?;
                    let kind: String = row.get(1)?;
                    let fields_json: String = row.get(2)?;
                    Ok((name, kind, fields_json))
                },
            )
            .optional()
            .map_err(Error::from)
        })?;
        row.map(|(name, kind, fields_json)| {
            let fields: Vec<String> = serde_json::from_str(&fields_json)?;
            let kind = match kind.as_str() {
                "json" => IndexKind::Json,
                "text" => IndexKind::Text,
                other => return Err(Error::Corruption(format!("unknown index kind '{other}'"))),
            };
            Ok(IndexDef { name, kind, fields })
        })
        .transpose()
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        validate_index_name(name)?;
        self.kvp.run_write(|tx| {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS idx_{name}"))?;
            tx.execute("DELETE FROM index_defs WHERE name = ?1", params![name])?;
            Ok(())
        })
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexDef>> {
        self.kvp.run_read(|conn| {
            let mut stmt = conn.prepare("SELECT name, kind, fields FROM index_defs")?;
            let rows = stmt.query_map([], |row| {
                let name: String = row.get(0)?;
                let kind: String = row.get(1)?;
                let fields_json: String = row.get(2)?;
                Ok((name, kind, fields_json))
            })?;

            let mut defs = Vec::new();
            for row in rows {
                let (name, kind, fields_json) = row?;
                let fields: Vec<String> = serde_json::from_str(&fields_json)?;
                let kind = match kind.as_str() {
                    "json" => IndexKind::Json,
                    "text" => IndexKind::Text,
                    other => {
                        return Err(Error::Corruption(format!("unknown index kind '{other}'")))
                    }
                };
                defs.push(IndexDef { name, kind, fields });
            }
            Ok(defs)
        })
    }

    /// Re-points every index's row for `doc_id` at its new winning body.
    /// `body: None` removes the document from every index (tombstoned or
    /// purged).
    pub fn index_document(&self, doc_id: &DocId, body: Option<&serde_json::Value>) -> Result<()> {
        let indexes = self.list_indexes()?;
        self.kvp.run_write(|tx| {
            for index in &indexes {
                tx.execute(
                    &format!("DELETE FROM idx_{} WHERE doc_id = ?1", index.name),
                    params![doc_id.as_str()],
                )?;

                let Some(body) = body else { continue };

                let placeholders = (0..=index.fields.len())
                    .map(|i| format!("?{}", i + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!("INSERT INTO idx_{} VALUES ({placeholders})", index.name);
                let mut bound: Vec<Box<dyn rusqlite::ToSql>> =
                    vec![Box::new(doc_id.as_str().to_string())];

                match index.kind {
                    IndexKind::Json => {
                        for field in &index.fields {
                            let value = selector::lookup_field(body, field)
                                .map(serde_json::to_string)
                                .transpose()?;
                            bound.push(Box::new(value));
                        }
                    }
                    IndexKind::Text => {
                        for field in &index.fields {
                            let value = selector::lookup_field(body, field).map(field_to_text);
                            bound.push(Box::new(value));
                        }
                    }
                }

                let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
                tx.execute(&sql, refs.as_slice())?;
            }
            Ok(())
        })
    }

    /// Full-text search against a `text`-kind index: returns the doc ids
    /// of every document whose indexed field content matches `query`
    /// under FTS5's `MATCH` syntax (e.g. terms, `"phrase"`, `prefix*`).
    pub fn text_search(&self, index_name: &str, query: &str) -> Result<Vec<DocId>> {
        let def = self
            .get_def(index_name)?
            .ok_or_else(|| Error::Configuration(format!("no such index '{index_name}'")))?;
        if def.kind != IndexKind::Text {
            return Err(Error::Configuration(format!(
                "index '{index_name}' is not a text index"
            )));
        }

        self.kvp.run_read(|conn| {
            let sql = format!("SELECT DISTINCT doc_id FROM idx_{index_name} WHERE idx_{index_name} MATCH ?1");
            let mut stmt = conn.prepare(&sql)?;
            let ids: Vec<String> = stmt
                .query_map(params![query], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids.into_iter().map(DocId::new).collect::<Result<Vec<_>>>()
        })
    }

    /// Returns the candidate document ids for `selector`: `Some(ids)` if
    /// an index covered the leading equality constraints, or `None` if
    /// the caller must fall back to scanning every document with
    /// [`selector::matches`] applied as a residual filter.
    ///
    /// `sort` is a list of `(field, descending)` pairs. A non-empty sort
    /// can only be satisfied when every field in it is covered by the
    /// index the planner chose (each index is single-valued per
    /// document, so an index-ordered scan is a valid total order);
    /// otherwise this returns [`Error::UnsupportedSort`]. Sorting a query
    /// that falls back to a full scan is likewise unsupported, since
    /// nothing orders the scan.
    pub fn candidate_doc_ids(
        &self,
        selector_value: &serde_json::Value,
        sort: &[(&str, bool)],
    ) -> Result<Option<Vec<DocId>>> {
        let indexes = self.list_indexes()?;
        match planner::plan(selector_value, &indexes) {
            Plan::FullScan => {
                if sort.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::UnsupportedSort(
                        "no index covers this query; sort requires an index-covered scan".to_string(),
                    ))
                }
            }
            Plan::UseIndex { index, bound } => {
                let conditions = (0..bound.len())
                    .map(|i| format!("f{i} = ?{}", i + 1))
                    .collect::<Vec<_>>()
                    .join(" AND ");

                let order_by = if sort.is_empty() {
                    String::new()
                } else {
                    let mut parts = Vec::with_capacity(sort.len());
                    for (field, descending) in sort {
                        let pos = index.fields.iter().position(|f| f == field).ok_or_else(|| {
                            Error::UnsupportedSort(format!(
                                "sort field '{field}' is not covered by index '{}'",
                                index.name
                            ))
                        })?;
                        parts.push(format!("f{pos} {}", if *descending { "DESC" } else { "ASC" }));
                    }
                    format!(" ORDER BY {}", parts.join(", "))
                };

                // One row per doc_id per index (index_document deletes the
                // old row before inserting the new one), so DISTINCT is
                // only needed to dedupe before we added ordering; dropped
                // when sorting since ORDER BY and DISTINCT don't combine
                // cleanly with SQLite's projection rules here.
                let select = if sort.is_empty() { "DISTINCT doc_id" } else { "doc_id" };
                let sql = format!("SELECT {select} FROM idx_{} WHERE {conditions}{order_by}", index.name);
                let bound_json: Vec<String> = bound
                    .iter()
                    .map(serde_json::to_string)
                    .collect::<std::result::Result<_, _>>()?;

                self.kvp.run_read(|conn| {
                    let mut stmt = conn.prepare(&sql)?;
                    let ids: Vec<String> = stmt
                        .query_map(rusqlite::params_from_iter(bound_json.iter()), |row| {
                            row.get(0)
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(Some(
                        ids.into_iter()
                            .map(DocId::new)
                            .collect::<Result<Vec<_>>>()?,
                    ))
                })
            }
        }
    }
}

/// Renders a field's value as plain text for an FTS5 column: strings
/// pass through unquoted, everything else falls back to its JSON form
/// so numbers/booleans are still searchable as tokens.
fn field_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Field paths may use reserved names (`_id`, `_rev`) but may not
/// contain `$`, which is reserved for selector operators.
fn validate_field_path(field: &str) -> Result<()> {
    if field.contains('$') {
        return Err(Error::InvalidField(format!(
            "field path '{field}' must not contain '$'"
        )));
    }
    Ok(())
}

fn validate_index_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "invalid index name '{name}': must be alphanumeric/underscore, not starting with a digit"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> QueryEngine {
        QueryEngine::new(Arc::new(Kvp::open_in_memory().unwrap()))
    }

    #[test]
    fn create_list_drop_index() {
        let engine = engine();
        engine
            .create_index("by_type", vec!["type".to_string()], IndexKind::Json)
            .unwrap();
        assert_eq!(engine.list_indexes().unwrap().len(), 1);
        engine.drop_index("by_type").unwrap();
        assert!(engine.list_indexes().unwrap().is_empty());
    }

    #[test]
    fn index_document_and_lookup() {
        let engine = engine();
        engine
            .create_index("by_type", vec!["type".to_string()], IndexKind::Json)
            .unwrap();

        let a = DocId::new("a").unwrap();
        let b = DocId::new("b").unwrap();
        engine
            .index_document(&a, Some(&serde_json::json!({"type": "user"})))
            .unwrap();
        engine
            .index_document(&b, Some(&serde_json::json!({"type": "order"})))
            .unwrap();

        let candidates = engine
            .candidate_doc_ids(&serde_json::json!({"type": "user"}), &[])
            .unwrap()
            .unwrap();
        assert_eq!(candidates, vec![a]);
    }

    #[test]
    fn removing_document_clears_index_row() {
        let engine = engine();
        engine
            .create_index("by_type", vec!["type".to_string()], IndexKind::Json)
            .unwrap();
        let a = DocId::new("a").unwrap();
        engine
            .index_document(&a, Some(&serde_json::json!({"type": "user"})))
            .unwrap();
        engine.index_document(&a, None).unwrap();

        let candidates = engine
            .candidate_doc_ids(&serde_json::json!({"type": "user"}), &[])
            .unwrap()
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn unindexed_selector_is_full_scan() {
        let engine = engine();
        let result = engine
            .candidate_doc_ids(&serde_json::json!({"age": {"$gt": 10}}), &[])
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn sort_on_indexed_field_orders_results() {
        let engine = engine();
        engine
            .create_index("by_status_age", vec!["status".to_string(), "age".to_string()], IndexKind::Json)
            .unwrap();
        let a = DocId::new("a").unwrap();
        let b = DocId::new("b").unwrap();
        let c = DocId::new("c").unwrap();
        engine
            .index_document(&a, Some(&serde_json::json!({"status": "open", "age": 42})))
            .unwrap();
        engine
            .index_document(&b, Some(&serde_json::json!({"status": "open", "age": 7})))
            .unwrap();
        engine
            .index_document(&c, Some(&serde_json::json!({"status": "closed", "age": 99})))
            .unwrap();

        let ascending = engine
            .candidate_doc_ids(&serde_json::json!({"status": "open"}), &[("age", false)])
            .unwrap()
            .unwrap();
        assert_eq!(ascending, vec![b, a]);
    }

    #[test]
    fn sort_on_field_not_covered_by_index_is_rejected() {
        let engine = engine();
        engine
            .create_index("by_status", vec!["status".to_string()], IndexKind::Json)
            .unwrap();
        let result = engine.candidate_doc_ids(
            &serde_json::json!({"status": "open"}),
            &[("age", false)],
        );
        assert!(matches!(result, Err(Error::UnsupportedSort(_))));
    }

    #[test]
    fn sort_without_usable_index_is_rejected() {
        let engine = engine();
        let result = engine.candidate_doc_ids(
            &serde_json::json!({"age": {"$gt": 10}}),
            &[("age", false)],
        );
        assert!(matches!(result, Err(Error::UnsupportedSort(_))));
    }

    #[test]
    fn rejects_invalid_index_name() {
        let engine = engine();
        let result = engine.create_index("1bad", vec!["a".to_string()], IndexKind::Json);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_field_path_containing_dollar() {
        let engine = engine();
        let result = engine.create_index("bad_field", vec!["a.$b".to_string()], IndexKind::Json);
        assert!(matches!(result, Err(Error::InvalidField(_))));
    }

    #[test]
    fn create_index_is_idempotent_for_identical_definition() {
        let engine = engine();
        engine
            .create_index("by_type", vec!["type".to_string()], IndexKind::Json)
            .unwrap();
        engine
            .create_index("by_type", vec!["type".to_string()], IndexKind::Json)
            .unwrap();
        assert_eq!(engine.list_indexes().unwrap().len(), 1);
    }

    #[test]
    fn create_index_recreates_when_fields_differ() {
        let engine = engine();
        engine
            .create_index("by_type", vec!["type".to_string()], IndexKind::Json)
            .unwrap();
        engine
            .create_index("by_type", vec!["type".to_string(), "status".to_string()], IndexKind::Json)
            .unwrap();
        let defs = engine.list_indexes().unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].fields, vec!["type".to_string(), "status".to_string()]);
    }

    #[test]
    fn text_index_search_finds_matching_documents() {
        let engine = engine();
        engine
            .create_index("by_body", vec!["body".to_string()], IndexKind::Text)
            .unwrap();
        let a = DocId::new("a").unwrap();
        let b = DocId::new("b").unwrap();
        engine
            .index_document(&a, Some(&serde_json::json!({"body": "the quick brown fox"})))
            .unwrap();
        engine
            .index_document(&b, Some(&serde_json::json!({"body": "lazy dog sleeps"})))
            .unwrap();

        let hits = engine.text_search("by_body", "quick").unwrap();
        assert_eq!(hits, vec![a]);
    }
}
