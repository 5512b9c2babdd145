//! Single background worker for the upload coordinator
//!
//! Capture events and drain requests share one channel, so "deliver then
//! enqueue" and "drain" run strictly one after another. Fire-and-forget drain
//! requests are coalesced: while one is waiting in the channel, further
//! requests are dropped.
//!
//! [`CoordinatorHandle::shutdown`] makes the worker finish promptly instead of
//! working through its backlog; whatever is left stays in the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::UploadQueue;
use crate::error::{Error, Result};
use crate::types::{CaptureEvent, QueuedUpload, UploadKind};

use super::client::Transport;
use super::coordinator::{DrainReason, DrainReport, UploadCoordinator, UploadStats};

enum Command {
    Capture(CaptureEvent),
    Drain {
        reason: DrainReason,
        reply: Option<oneshot::Sender<DrainReport>>,
    },
}

/// Cloneable handle to a running coordinator.
///
/// The worker stops once every handle is dropped and the channel is empty.
pub struct CoordinatorHandle<Q> {
    tx: mpsc::UnboundedSender<Command>,
    drain_pending: Arc<AtomicBool>,
    shutdown: CancellationToken,
    queue: Arc<Q>,
}

impl<Q> Clone for CoordinatorHandle<Q> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            drain_pending: self.drain_pending.clone(),
            shutdown: self.shutdown.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<Q: UploadQueue> CoordinatorHandle<Q> {
    /// Hand a capture event to the worker. Never blocks.
    pub fn submit(&self, event: CaptureEvent) -> Result<()> {
        self.tx
            .send(Command::Capture(event))
            .map_err(|_| Error::Shutdown)
    }

    /// Ask for a drain without waiting for it.
    ///
    /// Returns false when the request was coalesced into one already waiting,
    /// or when the worker has stopped.
    pub fn request_drain(&self, reason: DrainReason) -> bool {
        if self.drain_pending.swap(true, Ordering::AcqRel) {
            tracing::debug!(reason = %reason, "Drain already pending, request coalesced");
            return false;
        }

        if self.tx.send(Command::Drain { reason, reply: None }).is_err() {
            self.drain_pending.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Run a drain after everything already submitted, and wait for it
    pub async fn drain(&self, reason: DrainReason) -> Result<DrainReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Drain {
                reason,
                reply: Some(reply),
            })
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Stop the worker early.
    ///
    /// An in-flight delivery is abandoned and pending drains are skipped.
    /// Capture events still waiting are queued without a delivery attempt.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token for stopping the worker after every handle has been dropped
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Diagnostic read path: newest queued rows of one kind. No side effects.
    pub fn recent(&self, kind: &UploadKind, limit: usize) -> Result<Vec<QueuedUpload>> {
        self.queue.list_recent(kind, limit)
    }
}

impl<T, Q> UploadCoordinator<T, Q>
where
    T: Transport + 'static,
    Q: UploadQueue + 'static,
{
    /// Move the coordinator onto its own task.
    ///
    /// The join handle yields the final statistics after the last handle is
    /// dropped.
    pub fn spawn(self) -> (CoordinatorHandle<Q>, JoinHandle<UploadStats>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let drain_pending = Arc::new(AtomicBool::new(false));

        let handle = CoordinatorHandle {
            tx,
            drain_pending: drain_pending.clone(),
            shutdown: self.shutdown_token(),
            queue: self.queue().clone(),
        };

        let task = tokio::spawn(run_worker(self, rx, drain_pending));
        (handle, task)
    }
}

async fn run_worker<T, Q>(
    mut coordinator: UploadCoordinator<T, Q>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    drain_pending: Arc<AtomicBool>,
) -> UploadStats
where
    T: Transport,
    Q: UploadQueue,
{
    tracing::info!("Upload worker started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Capture(event) => {
                coordinator.handle_event(event).await;
            }
            Command::Drain { reason, reply } => {
                if reply.is_none() {
                    // Requests arriving from here on queue a fresh drain.
                    drain_pending.store(false, Ordering::Release);
                }
                let report = coordinator.drain(reason).await;
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
        }
    }

    let stats = coordinator.into_stats();
    tracing::info!(
        delivered_immediately = stats.delivered_immediately,
        queued = stats.queued,
        enqueue_failures = stats.enqueue_failures,
        drains = stats.drains,
        redelivered = stats.redelivered,
        redelivery_failures = stats.redelivery_failures,
        quarantined = stats.quarantined,
        "Upload worker stopped"
    );
    stats
}
