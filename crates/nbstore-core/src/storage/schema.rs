//! SQLite schema for a space database
//!
//! One database file holds everything a space persists: the doc update log
//! with its snapshots and clocks, the blob table, and the peer clock tables
//! used by sync.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Materialized doc state, rewritten on every push
        CREATE TABLE IF NOT EXISTS snapshots (
            doc_id TEXT PRIMARY KEY,
            data BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Append-only update log, one row per push
        CREATE TABLE IF NOT EXISTS updates (
            doc_id TEXT NOT NULL,
            data BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (doc_id, created_at)
        );

        -- Latest update timestamp per doc
        CREATE TABLE IF NOT EXISTS clocks (
            doc_id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS blobs (
            key TEXT PRIMARY KEY,
            data BLOB NOT NULL,
            mime TEXT NOT NULL,
            size INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        );

        -- Last timestamp pulled from a peer
        CREATE TABLE IF NOT EXISTS peer_clocks (
            peer TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            PRIMARY KEY (peer, doc_id)
        );

        -- Last timestamp pushed to a peer
        CREATE TABLE IF NOT EXISTS peer_pushed_clocks (
            peer TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            PRIMARY KEY (peer, doc_id)
        );

        -- Last timestamp a peer reported holding
        CREATE TABLE IF NOT EXISTS peer_remote_clocks (
            peer TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            PRIMARY KEY (peer, doc_id)
        );

        CREATE INDEX IF NOT EXISTS idx_clocks_timestamp ON clocks(timestamp);
        CREATE INDEX IF NOT EXISTS idx_blobs_deleted_at ON blobs(deleted_at);
        "#,
    )?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
