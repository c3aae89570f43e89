// src/query/planner.rs

//! Chooses a covering index for a selector by leftmost-prefix match, or
//! falls back to a full scan with residual in-memory filtering.

use super::selector;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Json,
    Text,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Json => "json",
            IndexKind::Text => "text",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub kind: IndexKind,
    pub fields: Vec<String>,
}

pub enum Plan<'a> {
    UseIndex { index: &'a IndexDef, bound: Vec<Value> },
    FullScan,
}

/// Picks the `json` index whose field list shares the longest leftmost
/// prefix with the selector's top-level equality constraints. A `text`
/// index is never chosen here; it only participates via an explicit
/// full-text query, not selector planning.
pub fn plan<'a>(selector: &Value, indexes: &'a [IndexDef]) -> Plan<'a> {
    let constraints = selector::equality_constraints(selector);
    if constraints.is_empty() {
        return Plan::FullScan;
    }

    let mut best: Option<(&IndexDef, Vec<Value>)> = None;
    for index in indexes {
        if index.kind != IndexKind::Json {
            continue;
        }
        let mut bound = Vec::new();
        for field in &index.fields {
            match constraints.get(field) {
                Some(value) => bound.push(value.clone()),
                None => break,
            }
        }
        if bound.is_empty() {
            continue;
        }
        if best.as_ref().map(|(_, b)| bound.len() > b.len()).unwrap_or(true) {
            best = Some((index, bound));
        }
    }

    match best {
        Some((index, bound)) => Plan::UseIndex { index, bound },
        None => Plan::FullScan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(name: &str, fields: &[&str]) -> IndexDef {
        IndexDef {
            name: name.to_string(),
            kind: IndexKind::Json,
            fields: fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn picks_longest_matching_prefix() {
        let indexes = vec![idx("by_type", &["type"]), idx("by_type_status", &["type", "status"])];
        let selector = serde_json::json!({"type": "user", "status": "active"});
        match plan(&selector, &indexes) {
            Plan::UseIndex { index, bound } => {
                assert_eq!(index.name, "by_type_status");
                assert_eq!(bound.len(), 2);
            }
            Plan::FullScan => panic!("expected an index plan"),
        }
    }

    #[test]
    fn non_contiguous_prefix_falls_back_to_shorter_index() {
        let indexes = vec![idx("by_type", &["type"]), idx("by_type_status", &["type", "status"])];
        let selector = serde_json::json!({"type": "user", "age": {"$gt": 10}});
        match plan(&selector, &indexes) {
            Plan::UseIndex { index, bound } => {
                assert_eq!(index.name, "by_type");
                assert_eq!(bound.len(), 1);
            }
            Plan::FullScan => panic!("expected an index plan"),
        }
    }

    #[test]
    fn no_usable_index_is_full_scan() {
        let indexes = vec![idx("by_status", &["status"])];
        let selector = serde_json::json!({"age": {"$gt": 10}});
        assert!(matches!(plan(&selector, &indexes), Plan::FullScan));
    }
}
