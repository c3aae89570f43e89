// src/revision/tree.rs

//! Pure functions over a document's revision set: winner selection and
//! ancestor-chain reconstruction. No in-memory pointer graph is kept;
//! the tree is reconstructed on demand from KVP rows each time, since
//! revision trees can have shared ancestors across branches.

use super::model::{RevId, Revision};

/// Applies the winner-selection rule: highest generation
/// among non-deleted leaves, tie-broken by lexicographically greatest
/// `rev_id` string; if no non-deleted leaves exist, the same rule is
/// applied over deleted leaves.
pub fn select_winner(leaves: &[Revision]) -> Option<&Revision> {
    let mut candidates: Vec<&Revision> = leaves.iter().filter(|r| !r.deleted).collect();
    if candidates.is_empty() {
        candidates = leaves.iter().collect();
    }
    candidates.into_iter().max_by(|a, b| {
        a.rev_id
            .generation
            .cmp(&b.rev_id.generation)
            .then_with(|| a.rev_id.hash.cmp(&b.rev_id.hash))
    })
}

/// True iff more than one non-deleted leaf exists.
pub fn is_conflicted(leaves: &[Revision]) -> bool {
    leaves.iter().filter(|r| !r.deleted).count() > 1
}

/// A minimal parent-edge view used for depth computations during
/// compaction, independent of full row hydration.
#[derive(Debug, Clone)]
pub struct Edge {
    pub rev_id: RevId,
    pub parent_rev_id: Option<RevId>,
}

/// Given the full edge set of a document and its current leaves, returns
/// the set of `RevId`s that must be preserved: every leaf, plus each
/// leaf's ancestors up to `depth` generations back.
pub fn preserved_set(edges: &[Edge], leaves: &[RevId], depth: u32) -> std::collections::HashSet<RevId> {
    use std::collections::HashMap;
    let by_id: HashMap<&RevId, &Edge> = edges.iter().map(|e| (&e.rev_id, e)).collect();

    let mut preserved = std::collections::HashSet::new();
    for leaf in leaves {
        preserved.insert(leaf.clone());
        let mut cur = leaf.clone();
        for _ in 0..depth {
            let Some(edge) = by_id.get(&cur) else { break };
            let Some(parent) = &edge.parent_rev_id else { break };
            preserved.insert(parent.clone());
            cur = parent.clone();
        }
    }
    preserved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::model::DocId;
    use std::collections::BTreeMap;

    fn rev(doc: &str, gen: u64, hash: &str, deleted: bool) -> Revision {
        Revision {
            doc_id: DocId::new(doc).unwrap(),
            rev_id: RevId::new(gen, hash),
            parent_rev_id: None,
            deleted,
            body: Some(serde_json::json!({})),
            sequence: 0,
            attachments: BTreeMap::new(),
            local_only: false,
        }
    }

    #[test]
    fn winner_prefers_highest_generation() {
        let leaves = vec![rev("a", 2, "x", false), rev("a", 3, "y", false)];
        let winner = select_winner(&leaves).unwrap();
        assert_eq!(winner.rev_id.generation, 3);
    }

    #[test]
    fn winner_tiebreaks_by_hash() {
        let leaves = vec![rev("a", 2, "aaa", false), rev("a", 2, "bbb", false)];
        let winner = select_winner(&leaves).unwrap();
        assert_eq!(winner.rev_id.hash, "bbb");
    }

    #[test]
    fn winner_falls_back_to_deleted_when_no_live_leaves() {
        let leaves = vec![rev("a", 2, "x", true), rev("a", 3, "y", true)];
        let winner = select_winner(&leaves).unwrap();
        assert_eq!(winner.rev_id.generation, 3);
        assert!(winner.deleted);
    }

    #[test]
    fn conflicted_detection() {
        let leaves = vec![rev("a", 1, "x", false), rev("a", 1, "y", false)];
        assert!(is_conflicted(&leaves));
        let single = vec![rev("a", 1, "x", false)];
        assert!(!is_conflicted(&single));
    }

    #[test]
    fn preserved_set_bounds_depth() {
        let edges = vec![
            Edge { rev_id: RevId::new(1, "a"), parent_rev_id: None },
            Edge { rev_id: RevId::new(2, "b"), parent_rev_id: Some(RevId::new(1, "a")) },
            Edge { rev_id: RevId::new(3, "c"), parent_rev_id: Some(RevId::new(2, "b")) },
        ];
        let leaves = vec![RevId::new(3, "c")];
        let preserved = preserved_set(&edges, &leaves, 1);
        assert!(preserved.contains(&RevId::new(3, "c")));
        assert!(preserved.contains(&RevId::new(2, "b")));
        assert!(!preserved.contains(&RevId::new(1, "a")));
    }
}
