//! Upload coordinator: immediate delivery, enqueue on failure, drain.
//!
//! The coordinator owns the only write path into the durable queue. Running
//! it inside [`UploadCoordinator::spawn`] serializes event handling and drains
//! on a single worker task, so the two flows never interleave.
//!
//! Cancelling the coordinator's shutdown token stops it early: an in-flight
//! delivery is abandoned, a drain stops before its next row, and fresh events
//! are queued without a delivery attempt. Queued rows are never lost to a
//! shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::UploadQueue;
use crate::types::{
    CaptureEvent, DeliveryFailure, DeliveryOutcome, Payload, PendingRow, QueuedUpload, UploadKind,
};

use super::client::Transport;

/// What started a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    /// Service start or restart
    Startup,
    /// Connectivity watcher saw the network come back
    ConnectivityRestored,
    /// Explicit request from outside the pipeline
    Explicit,
}

impl DrainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainReason::Startup => "startup",
            DrainReason::ConnectivityRestored => "connectivity_restored",
            DrainReason::Explicit => "explicit",
        }
    }
}

impl std::fmt::Display for DrainReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// What happened to one capture event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// Delivered on the first attempt; nothing persisted
    Delivered,
    /// Delivery failed; persisted under this identity
    Queued(i64),
    /// Delivery failed and the queue rejected the write
    Lost,
}

/// Summary of one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Rows in the snapshot
    pub attempted: usize,
    /// Rows delivered and removed
    pub delivered: usize,
    /// Rows whose delivery failed and stay queued
    pub failed: usize,
    /// Rows taken out of circulation because they cannot be decoded
    pub quarantined: usize,
    /// Rows delivered but not removed; they will be delivered again
    pub remove_failures: usize,
    /// Queue size after the drain; `None` if the queue could not be read
    pub remaining: Option<usize>,
    /// Shutdown stopped the drain before every row was tried
    pub interrupted: bool,
}

impl DrainReport {
    /// True when the queue was read back empty
    pub fn is_complete(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Lifetime counters, logged at shutdown
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadStats {
    pub delivered_immediately: usize,
    pub queued: usize,
    pub enqueue_failures: usize,
    pub drains: usize,
    pub redelivered: usize,
    pub redelivery_failures: usize,
    pub quarantined: usize,
    pub remove_failures: usize,
}

/// Decides between immediate delivery and the durable queue
pub struct UploadCoordinator<T, Q> {
    transport: T,
    queue: Arc<Q>,
    shutdown: CancellationToken,
    stats: UploadStats,
}

impl<T, Q> UploadCoordinator<T, Q>
where
    T: Transport,
    Q: UploadQueue,
{
    pub fn new(transport: T, queue: Arc<Q>) -> Self {
        Self {
            transport,
            queue,
            shutdown: CancellationToken::new(),
            stats: UploadStats::default(),
        }
    }

    /// Token that stops this coordinator early once cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shared handle to the queue
    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn stats(&self) -> &UploadStats {
        &self.stats
    }

    pub(crate) fn into_stats(self) -> UploadStats {
        self.stats
    }

    /// Try to deliver a fresh event, queueing it on failure.
    ///
    /// This is the only path by which rows enter the queue.
    pub async fn handle_event(&mut self, event: CaptureEvent) -> EventDisposition {
        let outcome = self
            .deliver(&event.kind, &event.fields, event.event_id)
            .await;

        let failure = match outcome {
            DeliveryOutcome::Success => {
                self.stats.delivered_immediately += 1;
                tracing::debug!(
                    kind = %event.kind,
                    event_id = %event.event_id,
                    "Capture event delivered"
                );
                return EventDisposition::Delivered;
            }
            DeliveryOutcome::Failure(failure) => failure,
        };

        tracing::warn!(
            kind = %event.kind,
            event_id = %event.event_id,
            reason = %failure,
            "Delivery failed, queueing capture event"
        );

        match self
            .queue
            .enqueue(&event.kind, &event.fields, event.event_id)
        {
            Ok(stored) => {
                self.stats.queued += 1;
                tracing::info!(
                    id = stored.id,
                    kind = %stored.kind,
                    "Saved pending upload"
                );
                EventDisposition::Queued(stored.id)
            }
            Err(e) => {
                // The capture source never resubmits, so the event is gone.
                self.stats.enqueue_failures += 1;
                tracing::error!(
                    kind = %event.kind,
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to save pending upload, event lost"
                );
                EventDisposition::Lost
            }
        }
    }

    /// Attempt redelivery of every queued row, one at a time.
    ///
    /// Delivered rows are removed before the next attempt; failed rows stay
    /// queued untouched. Rows that cannot be decoded are quarantined instead
    /// of blocking the rest. The drain never adds rows.
    pub async fn drain(&mut self, reason: DrainReason) -> DrainReport {
        let mut report = DrainReport::default();

        if self.shutdown.is_cancelled() {
            tracing::info!(reason = %reason, "Shutting down, drain skipped");
            report.interrupted = true;
            report.remaining = self.queue.scan().ok().map(|rows| rows.len());
            return report;
        }
        self.stats.drains += 1;

        let snapshot = match self.queue.scan() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(reason = %reason, error = %e, "Failed to read pending uploads");
                return report;
            }
        };

        if snapshot.is_empty() {
            tracing::debug!(reason = %reason, "No pending uploads to retry");
            report.remaining = Some(0);
            return report;
        }

        tracing::info!(
            reason = %reason,
            pending = snapshot.len(),
            "Retrying pending uploads"
        );
        report.attempted = snapshot.len();

        for row in snapshot {
            if self.shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            match row {
                PendingRow::Ready(upload) => self.retry_one(&upload, &mut report).await,
                PendingRow::Unreadable(row) => {
                    tracing::error!(
                        id = row.id,
                        reason = %row.reason,
                        "Skipping pending upload that cannot be decoded"
                    );
                    self.quarantine(row.id, &row.reason, &mut report);
                }
            }
        }

        match self.queue.scan() {
            Ok(rows) => {
                report.remaining = Some(rows.len());
                if report.interrupted {
                    tracing::info!(
                        reason = %reason,
                        delivered = report.delivered,
                        remaining = rows.len(),
                        "Drain interrupted by shutdown, remaining uploads stay queued"
                    );
                } else if rows.is_empty() {
                    tracing::info!(
                        reason = %reason,
                        delivered = report.delivered,
                        "All pending uploads completed"
                    );
                } else {
                    tracing::warn!(
                        reason = %reason,
                        delivered = report.delivered,
                        failed = report.failed,
                        remaining = rows.len(),
                        "Some uploads still pending, will retry on next trigger"
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    reason = %reason,
                    error = %e,
                    "Failed to re-read pending uploads after drain"
                );
            }
        }

        report
    }

    /// One delivery attempt, abandoned as soon as shutdown is requested
    async fn deliver(&self, kind: &UploadKind, payload: &Payload, event_id: Uuid) -> DeliveryOutcome {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => DeliveryOutcome::Failure(DeliveryFailure::Cancelled),
            outcome = self.transport.deliver(kind, payload, event_id) => outcome,
        }
    }

    fn quarantine(&mut self, id: i64, why: &str, report: &mut DrainReport) {
        match self.queue.quarantine(id, why) {
            Ok(()) => {
                report.quarantined += 1;
                self.stats.quarantined += 1;
            }
            Err(e) => {
                // Left in place; it is skipped again next drain.
                report.failed += 1;
                tracing::error!(id, error = %e, "Failed to quarantine upload");
            }
        }
    }

    async fn retry_one(&mut self, upload: &QueuedUpload, report: &mut DrainReport) {
        let payload = match upload.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    id = upload.id,
                    kind = %upload.kind,
                    error = %e,
                    "Skipping pending upload with malformed payload"
                );
                self.quarantine(upload.id, &e.to_string(), report);
                return;
            }
        };

        match self.deliver(&upload.kind, &payload, upload.event_id).await {
            DeliveryOutcome::Success => {
                report.delivered += 1;
                self.stats.redelivered += 1;

                if let Err(e) = self.queue.remove(upload.id) {
                    report.remove_failures += 1;
                    self.stats.remove_failures += 1;
                    tracing::warn!(
                        id = upload.id,
                        error = %e,
                        "Delivered but failed to delete pending upload, it will be sent again"
                    );
                } else {
                    tracing::debug!(id = upload.id, kind = %upload.kind, "Retried and deleted pending upload");
                }
            }
            DeliveryOutcome::Failure(DeliveryFailure::Cancelled) => {
                report.interrupted = true;
                tracing::debug!(id = upload.id, "Retry abandoned by shutdown");
            }
            DeliveryOutcome::Failure(failure) => {
                report.failed += 1;
                self.stats.redelivery_failures += 1;
                tracing::warn!(
                    id = upload.id,
                    kind = %upload.kind,
                    reason = %failure,
                    "Retry failed"
                );
            }
        }
    }
}
