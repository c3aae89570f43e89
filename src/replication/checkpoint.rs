// src/replication/checkpoint.rs

//! Local replication checkpoints: the last sequence a given replication
//! direction has durably applied, so a restarted replication resumes
//! instead of re-diffing the whole history.

use crate::error::Result;
use crate::kvp::Kvp;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

pub struct CheckpointStore {
    kvp: Arc<Kvp>,
}

impl CheckpointStore {
    pub fn new(kvp: Arc<Kvp>) -> Self {
        Self { kvp }
    }

    pub fn get(&self, replication_id: &str) -> Result<Option<String>> {
        self.kvp.run_read(|conn| {
            conn.query_row(
                "SELECT source_last_seq FROM checkpoints WHERE replication_id = ?1",
                params![replication_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(crate::error::Error::from)
        })
    }

    pub fn set(&self, replication_id: &str, seq: &str) -> Result<()> {
        self.kvp.run_write(|tx| {
            tx.execute(
                "INSERT INTO checkpoints (replication_id, source_last_seq, updated_at)
                 VALUES (?1, ?2, CURRENT_TIMESTAMP)
                 ON CONFLICT(replication_id) DO UPDATE SET
                    source_last_seq = excluded.source_last_seq,
                    updated_at = excluded.updated_at",
                params![replication_id, seq],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_roundtrip() {
        let store = CheckpointStore::new(Arc::new(Kvp::open_in_memory().unwrap()));
        assert_eq!(store.get("rep1").unwrap(), None);
        store.set("rep1", "42").unwrap();
        assert_eq!(store.get("rep1").unwrap(), Some("42".to_string()));
        store.set("rep1", "99").unwrap();
        assert_eq!(store.get("rep1").unwrap(), Some("99".to_string()));
    }
}
