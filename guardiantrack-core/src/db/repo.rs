//! Database repository layer
//!
//! Provides the durable upload queue on top of a single SQLite connection.

use crate::error::{Error, Result};
use crate::types::{Payload, PendingRow, QueuedUpload, UnreadableUpload, UploadKind};
use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Queued row count for one stored kind name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindCount {
    pub kind: String,
    pub count: i64,
}

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets diagnostic readers run alongside the agent process.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    ///
    /// A poisoned lock is recovered: every statement runs to completion or
    /// fails inside SQLite, so the connection is never left half-written.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Pending upload operations
    // ============================================

    /// Persist a failed delivery and return the stored row
    ///
    /// Kinds that would not read back as themselves are refused, so every row
    /// written here decodes again on the next scan.
    pub fn enqueue_upload(
        &self,
        kind: &UploadKind,
        payload: &Payload,
        event_id: Uuid,
    ) -> Result<QueuedUpload> {
        if !kind.is_canonical() {
            return Err(Error::Payload(format!(
                "upload kind {:?} is not a valid kind name",
                kind.as_str()
            )));
        }

        let payload_text = payload.to_json()?;
        let queued_at = Utc::now();

        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO pending_uploads (event_id, kind, payload, queued_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                event_id.to_string(),
                kind.as_str(),
                payload_text,
                queued_at.to_rfc3339(),
            ],
        )?;

        Ok(QueuedUpload {
            id: conn.last_insert_rowid(),
            event_id,
            kind: kind.clone(),
            payload: payload_text,
            queued_at,
        })
    }

    /// Every queued row, oldest first, including rows that fail to decode
    pub fn scan_pending_uploads(&self) -> Result<Vec<PendingRow>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, kind, payload, queued_at FROM pending_uploads ORDER BY id ASC",
        )?;

        let rows = stmt
            .query_map([], Self::row_to_pending)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// All decodable queued uploads, oldest first
    pub fn list_pending_uploads(&self) -> Result<Vec<QueuedUpload>> {
        Ok(skip_unreadable(self.scan_pending_uploads()?))
    }

    /// Most recently queued uploads of one kind, newest first
    pub fn list_recent_uploads(&self, kind: &UploadKind, limit: usize) -> Result<Vec<QueuedUpload>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, event_id, kind, payload, queued_at
            FROM pending_uploads
            WHERE kind = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![kind.as_str(), limit], Self::row_to_pending)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(skip_unreadable(rows))
    }

    /// Delete a queued upload by identity
    ///
    /// Returns whether a row was deleted; an absent row is not an error.
    pub fn remove_upload(&self, id: i64) -> Result<bool> {
        let conn = self.connection();
        let deleted = conn.execute("DELETE FROM pending_uploads WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// Move a queued row out of the pending table
    ///
    /// Columns are copied as stored, so rows that never decoded can be moved
    /// too. Returns whether a row was moved.
    pub fn quarantine_upload(&self, id: i64, reason: &str) -> Result<bool> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;

        let moved = tx.execute(
            r#"
            INSERT OR REPLACE INTO quarantined_uploads
                (id, event_id, kind, payload, queued_at, quarantined_at, reason)
            SELECT id, event_id, kind, payload, queued_at, ?2, ?3
            FROM pending_uploads
            WHERE id = ?1
            "#,
            params![id, Utc::now().to_rfc3339(), reason],
        )?;
        tx.execute("DELETE FROM pending_uploads WHERE id = ?1", [id])?;

        tx.commit()?;
        Ok(moved > 0)
    }

    /// Count queued uploads
    pub fn count_pending_uploads(&self) -> Result<i64> {
        let conn = self.connection();
        conn.query_row("SELECT COUNT(*) FROM pending_uploads", [], |r| r.get(0))
            .map_err(Error::from)
    }

    /// Count queued uploads per stored kind name, sorted by name
    pub fn count_pending_by_kind(&self) -> Result<Vec<KindCount>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT CAST(kind AS TEXT), COUNT(*) FROM pending_uploads GROUP BY 1 ORDER BY 1",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(KindCount {
                    kind: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// Count quarantined uploads
    pub fn count_quarantined_uploads(&self) -> Result<i64> {
        let conn = self.connection();
        conn.query_row("SELECT COUNT(*) FROM quarantined_uploads", [], |r| r.get(0))
            .map_err(Error::from)
    }

    /// Map a row without failing the query on bad column contents.
    ///
    /// Only SQLite-level errors propagate; anything wrong with the stored
    /// values turns into [`PendingRow::Unreadable`].
    fn row_to_pending(row: &Row) -> rusqlite::Result<PendingRow> {
        let id: i64 = row.get("id")?;
        let event_id = text_column(row, "event_id")?;
        let kind = text_column(row, "kind")?;
        let payload = text_column(row, "payload")?;
        let queued_at = text_column(row, "queued_at")?;

        let decoded = decode_upload(id, event_id, kind, payload, queued_at);
        Ok(match decoded {
            Ok(upload) => PendingRow::Ready(upload),
            Err(reason) => PendingRow::Unreadable(UnreadableUpload { id, reason }),
        })
    }
}

type Column = std::result::Result<String, String>;

fn text_column(row: &Row, name: &str) -> rusqlite::Result<Column> {
    Ok(match row.get_ref(name)? {
        ValueRef::Text(bytes) => {
            String::from_utf8(bytes.to_vec()).map_err(|_| format!("{} is not valid UTF-8", name))
        }
        other => Err(format!("{} is stored as {}", name, other.data_type())),
    })
}

fn decode_upload(
    id: i64,
    event_id: Column,
    kind: Column,
    payload: Column,
    queued_at: Column,
) -> std::result::Result<QueuedUpload, String> {
    let event_id = event_id?;
    let event_id = Uuid::parse_str(&event_id)
        .map_err(|e| format!("event_id {:?} is not a UUID: {}", event_id, e))?;

    let kind_name = kind?;
    let kind = kind_name
        .parse::<UploadKind>()
        .map_err(|e| format!("kind {:?}: {}", kind_name, e))?;
    if kind.as_str() != kind_name {
        return Err(format!("kind {:?} is not a valid kind name", kind_name));
    }

    // The timestamp is informational; a bad one never blocks delivery.
    let queued_at = queued_at
        .ok()
        .and_then(|text| DateTime::parse_from_rfc3339(&text).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(QueuedUpload {
        id,
        event_id,
        kind,
        payload: payload?,
        queued_at,
    })
}

fn skip_unreadable(rows: Vec<PendingRow>) -> Vec<QueuedUpload> {
    rows.into_iter()
        .filter_map(|row| match row {
            PendingRow::Ready(upload) => Some(upload),
            PendingRow::Unreadable(row) => {
                tracing::warn!(id = row.id, reason = %row.reason, "Skipping unreadable queued upload");
                None
            }
        })
        .collect()
}
