// src/kvp/mod.rs

//! Key-value persistence: a serialized transactional interface over a
//! single on-disk SQLite file.
//!
//! `Kvp` owns exactly one [`rusqlite::Connection`] behind a mutex. SQLite
//! itself only tolerates one writer at a time and this crate does not
//! attempt to exploit SQLite's WAL concurrent-reader support across
//! separate connections; instead the mutex serializes
//! all access ("readers may proceed concurrently if the underlying
//! engine supports it, otherwise serialized" and this implementation
//! takes the "otherwise" branch deliberately (see DESIGN.md).

pub mod schema;

use crate::error::{Error, Result};
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

pub struct Kvp {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Kvp {
    /// Opens (creating if necessary) the KVP file at `path`, applies
    /// pragmas, and runs schema migrations inside one write transaction.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("opening kvp file at {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        schema::migrate(&mut conn)?;
        info!("kvp ready at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Opens an in-memory KVP store, primarily for tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with read access to the connection.
    pub fn run_read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| {
            Error::Corruption("kvp connection mutex poisoned".to_string())
        })?;
        f(&conn)
    }

    /// Runs `f` inside an exclusive write transaction. Commits on `Ok`,
    /// rolls back on `Err`. No partial state is ever observable, per
    /// all-or-nothing propagation: no partial write is ever visible.
    pub fn run_write<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| {
            Error::Corruption("kvp connection mutex poisoned".to_string())
        })?;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn open_creates_file_and_migrates() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_path_buf();
        drop(temp_file);

        let kvp = Kvp::open(&db_path).unwrap();
        assert!(db_path.exists());

        let version = kvp
            .run_read(|conn| schema::get_schema_version(conn))
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn run_write_rolls_back_on_error() {
        let kvp = Kvp::open_in_memory().unwrap();

        let result: Result<()> = kvp.run_write(|tx| {
            tx.execute(
                "INSERT INTO checkpoints (replication_id, source_last_seq) VALUES ('a', '1')",
                [],
            )?;
            Err(Error::Conflict("force rollback".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = kvp
            .run_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn run_write_commits_on_success() {
        let kvp = Kvp::open_in_memory().unwrap();

        kvp.run_write(|tx| {
            tx.execute(
                "INSERT INTO checkpoints (replication_id, source_last_seq) VALUES ('a', '1')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let count: i64 = kvp
            .run_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
