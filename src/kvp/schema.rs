// src/kvp/schema.rs

//! Schema definitions and versioned migrations for the key-value
//! persistence layer.
//!
//! Every table the rest of the crate relies on (revisions, attachments,
//! the change feed, index definitions and their backing tables, the
//! encrypted-blob filename index, and replication checkpoints) is
//! created here, one idempotent migration step per `user_version`.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version. Bump this and add a `migrate_vN` function when
/// the schema changes.
pub const SCHEMA_VERSION: i32 = 1;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Applies every pending migration inside one write transaction. Failure
/// rolls back the whole migration and the caller sees `Error::Schema`;
/// the on-disk database is left exactly as it was before `migrate` was
/// called.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!("current kvp schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        info!("kvp schema up to date");
        return Ok(());
    }

    let tx = conn.transaction()?;
    for version in (current_version + 1)..=SCHEMA_VERSION {
        debug!("applying kvp migration {}", version);
        apply_migration(&tx, version).map_err(|e| {
            Error::Schema(format!("migration to version {version} failed: {e}"))
        })?;
        set_schema_version(&tx, version)?;
    }
    tx.commit()?;

    info!("kvp schema migration complete, now at version {}", SCHEMA_VERSION);
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::Schema(format!("unknown migration version: {version}"))),
    }
}

/// Initial schema.
///
/// - `revisions`: one row per committed revision, forming the forest of
///   revision trees (one tree per `doc_id`).
/// - `attachments`: descriptor rows linking a revision to a blob digest.
/// - `blob_index`: digest → on-disk filename, used only in encrypted
///   mode where filenames are opaque random tokens.
/// - `changes`: the append-only sequence log.
/// - `index_defs` / per-index backing tables (created dynamically by the
///   query engine, not here; their *definitions* live in `index_defs`).
/// - `checkpoints`: per-replication-direction resume cursors.
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("creating kvp schema version 1");

    conn.execute_batch(
        "
        -- Revisions: the forest of revision trees, one tree per doc_id.
        CREATE TABLE revisions (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            hash TEXT NOT NULL,
            parent_generation INTEGER,
            parent_hash TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            body TEXT,
            local_only INTEGER NOT NULL DEFAULT 0,
            is_leaf INTEGER NOT NULL DEFAULT 1,
            UNIQUE(doc_id, generation, hash)
        );

        CREATE INDEX idx_revisions_doc_id ON revisions(doc_id);
        CREATE INDEX idx_revisions_doc_leaf ON revisions(doc_id, is_leaf);
        CREATE INDEX idx_revisions_parent ON revisions(doc_id, parent_generation, parent_hash);

        -- Attachment descriptors, keyed by the revision that introduced
        -- or last carried them forward.
        CREATE TABLE attachments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sequence INTEGER NOT NULL,
            name TEXT NOT NULL,
            content_type TEXT,
            length INTEGER NOT NULL,
            encoding TEXT,
            encoded_length INTEGER,
            digest TEXT NOT NULL,
            revpos INTEGER NOT NULL,
            UNIQUE(sequence, name),
            FOREIGN KEY (sequence) REFERENCES revisions(sequence) ON DELETE CASCADE
        );

        CREATE INDEX idx_attachments_digest ON attachments(digest);

        -- Encrypted-mode blob filename index (digest -> opaque filename).
        -- Unused, but present, when no encryption key is configured.
        CREATE TABLE blob_index (
            digest TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            length INTEGER NOT NULL
        );

        -- Append-only change feed.
        CREATE TABLE changes (
            sequence INTEGER PRIMARY KEY,
            doc_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            hash TEXT NOT NULL,
            deleted INTEGER NOT NULL
        );

        CREATE INDEX idx_changes_doc_id ON changes(doc_id);

        -- Secondary index definitions (the backing tables themselves are
        -- created/dropped dynamically by the query engine).
        CREATE TABLE index_defs (
            name TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK(kind IN ('json', 'text')),
            fields TEXT NOT NULL,
            settings TEXT NOT NULL
        );

        -- Replication checkpoints, stored on the side receiving data.
        CREATE TABLE checkpoints (
            replication_id TEXT PRIMARY KEY,
            source_last_seq TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        ",
    )?;

    info!("kvp schema version 1 created");
    Ok(())
}
