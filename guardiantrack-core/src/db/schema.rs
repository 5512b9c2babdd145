//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: durable upload queue
    r#"
    CREATE TABLE IF NOT EXISTS pending_uploads (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id         TEXT NOT NULL,
        kind             TEXT NOT NULL,
        payload          TEXT NOT NULL,      -- JSON object, field name -> scalar
        queued_at        DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_pending_uploads_kind ON pending_uploads(kind, id DESC);
    "#,
    // Version 2: parking area for rows whose payload cannot be decoded
    r#"
    CREATE TABLE IF NOT EXISTS quarantined_uploads (
        id               INTEGER PRIMARY KEY,  -- original pending_uploads.id
        event_id         TEXT NOT NULL,
        kind             TEXT NOT NULL,
        payload          TEXT NOT NULL,
        queued_at        DATETIME NOT NULL,
        quarantined_at   DATETIME NOT NULL,
        reason           TEXT NOT NULL
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}
