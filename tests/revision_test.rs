// tests/revision_test.rs

//! Revision-tree behavior exercised against a real on-disk KVP file,
//! complementing the in-memory unit tests inside `src/revision/mod.rs`.

use revtree::kvp::Kvp;
use revtree::revision::model::{compute_rev_id, DocId};
use revtree::revision::RevisionEngine;
use std::collections::BTreeMap;
use std::sync::Arc;

fn engine(dir: &tempfile::TempDir) -> RevisionEngine {
    let kvp = Arc::new(Kvp::open(dir.path().join("db.sqlite")).unwrap());
    RevisionEngine::new(kvp, 1000)
}

#[test]
fn concurrent_branches_from_a_shared_ancestor_both_resolve_to_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let doc_id = DocId::new("doc").unwrap();

    let root = engine
        .create(Some(doc_id.clone()), serde_json::json!({"v": 0}), BTreeMap::new(), false)
        .unwrap();

    // two peers each extend the root independently
    let a = engine
        .update(&doc_id, &root.rev_id, serde_json::json!({"v": "a"}), BTreeMap::new())
        .unwrap();

    let foreign_body = serde_json::json!({"v": "b"});
    let foreign_rev = compute_rev_id(Some(&root.rev_id), false, &foreign_body, &[]).unwrap();
    engine
        .force_insert(&doc_id, &foreign_rev, false, Some(foreign_body), BTreeMap::new(), &[root.rev_id.clone()], false)
        .unwrap();

    assert!(engine.is_conflicted(&doc_id).unwrap());
    let leaves = engine.leaves(&doc_id).unwrap();
    assert_eq!(leaves.len(), 2);

    // deterministic winner: always the same one regardless of insertion order
    let winner_before = engine.get_winner(&doc_id).unwrap();
    assert!(leaves.iter().any(|r| r.rev_id == winner_before.rev_id));
    assert_eq!(a.rev_id.generation, 2);
}

#[test]
fn tombstoned_leaf_is_never_the_winner_if_a_live_leaf_exists() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let doc_id = DocId::new("doc").unwrap();

    let root = engine
        .create(Some(doc_id.clone()), serde_json::json!({}), BTreeMap::new(), false)
        .unwrap();
    let live = engine
        .update(&doc_id, &root.rev_id, serde_json::json!({"alive": true}), BTreeMap::new())
        .unwrap();

    let foreign_body = serde_json::json!({"_deleted": true});
    let foreign_rev = compute_rev_id(Some(&root.rev_id), true, &foreign_body, &[]).unwrap();
    engine
        .force_insert(&doc_id, &foreign_rev, true, Some(foreign_body), BTreeMap::new(), &[root.rev_id.clone()], false)
        .unwrap();

    let winner = engine.get_winner(&doc_id).unwrap();
    assert_eq!(winner.rev_id, live.rev_id);
    assert!(!winner.deleted);
}

#[test]
fn force_insert_with_deep_missing_ancestors_grafts_the_whole_chain() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let doc_id = DocId::new("doc").unwrap();

    // Build a 3-generation foreign chain the local store has never seen.
    let body1 = serde_json::json!({"n": 1});
    let rev1 = compute_rev_id(None, false, &body1, &[]).unwrap();
    let body2 = serde_json::json!({"n": 2});
    let rev2 = compute_rev_id(Some(&rev1), false, &body2, &[]).unwrap();
    let body3 = serde_json::json!({"n": 3});
    let rev3 = compute_rev_id(Some(&rev2), false, &body3, &[]).unwrap();

    let inserted = engine
        .force_insert(
            &doc_id,
            &rev3,
            false,
            Some(body3),
            BTreeMap::new(),
            &[rev2.clone(), rev1.clone()],
            false,
        )
        .unwrap();
    assert!(inserted);

    let history = engine.history(&doc_id, &rev3).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].rev_id, rev1);
    assert_eq!(history[2].rev_id, rev3);
    // grafted ancestors carry no body of their own
    assert!(history[0].body.is_none());
    assert!(history[2].body.is_some());
}

#[test]
fn compaction_enforces_revision_limit_across_many_updates() {
    let dir = tempfile::tempdir().unwrap();
    let kvp = Arc::new(Kvp::open(dir.path().join("db.sqlite")).unwrap());
    let engine = RevisionEngine::new(kvp, 5);
    let doc_id = DocId::new("doc").unwrap();

    let mut rev = engine
        .create(Some(doc_id.clone()), serde_json::json!({"n": 0}), BTreeMap::new(), false)
        .unwrap();
    for i in 1..30 {
        rev = engine
            .update(&doc_id, &rev.rev_id, serde_json::json!({"n": i}), BTreeMap::new())
            .unwrap();
    }

    engine.compact().unwrap();

    // winner still resolvable and its body intact
    let winner = engine.get_winner(&doc_id).unwrap();
    assert_eq!(winner.rev_id, rev.rev_id);
    assert_eq!(winner.body.unwrap()["n"], 29);

    // history walk stops once it runs past the preserved window, rather
    // than erroring
    let chain = engine.history(&doc_id, &rev.rev_id).unwrap();
    assert!(chain.len() <= 30);
    assert!(chain.len() >= 6);
}
