//! Database layer for guardiantrack
//!
//! This module provides the durable upload queue using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - The [`UploadQueue`] seam the upload coordinator depends on

pub mod repo;
pub mod schema;

pub use repo::{Database, KindCount};

use crate::error::Result;
use crate::types::{Payload, PendingRow, QueuedUpload, UploadKind};
use uuid::Uuid;

/// Persisted store of not-yet-delivered uploads.
///
/// Writes are visible to the next read on the same handle. Implementations
/// report storage faults as errors; they never retry internally.
pub trait UploadQueue: Send + Sync {
    /// Persist a new row with a fresh identity
    fn enqueue(&self, kind: &UploadKind, payload: &Payload, event_id: Uuid) -> Result<QueuedUpload>;

    /// Every queued row in a stable order, including rows that no longer
    /// decode. One bad row never fails the whole scan.
    fn scan(&self) -> Result<Vec<PendingRow>>;

    /// Every decodable queued row, in the order of [`UploadQueue::scan`]
    fn list_all(&self) -> Result<Vec<QueuedUpload>>;

    /// Newest `limit` rows of `kind`, newest first
    fn list_recent(&self, kind: &UploadKind, limit: usize) -> Result<Vec<QueuedUpload>>;

    /// Delete by identity; deleting an absent row succeeds
    fn remove(&self, id: i64) -> Result<()>;

    /// Take a row out of circulation without delivering it. Works for
    /// unreadable rows too; an absent row succeeds.
    fn quarantine(&self, id: i64, reason: &str) -> Result<()>;
}

impl UploadQueue for Database {
    fn enqueue(&self, kind: &UploadKind, payload: &Payload, event_id: Uuid) -> Result<QueuedUpload> {
        self.enqueue_upload(kind, payload, event_id)
    }

    fn scan(&self) -> Result<Vec<PendingRow>> {
        self.scan_pending_uploads()
    }

    fn list_all(&self) -> Result<Vec<QueuedUpload>> {
        self.list_pending_uploads()
    }

    fn list_recent(&self, kind: &UploadKind, limit: usize) -> Result<Vec<QueuedUpload>> {
        self.list_recent_uploads(kind, limit)
    }

    fn remove(&self, id: i64) -> Result<()> {
        self.remove_upload(id).map(|_| ())
    }

    fn quarantine(&self, id: i64, reason: &str) -> Result<()> {
        self.quarantine_upload(id, reason).map(|_| ())
    }
}
