//! Test doubles for the upload pipeline seams

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::UploadQueue;
use crate::error::{Error, Result};
use crate::types::{
    DeliveryFailure, DeliveryOutcome, Payload, PendingRow, QueuedUpload, UploadKind,
};
use crate::upload::Transport;

#[derive(Debug, Clone)]
struct Attempt {
    marker: Option<String>,
    event_id: Uuid,
    success: bool,
}

#[derive(Default)]
struct Inner {
    failing: AtomicBool,
    fail_markers: Vec<String>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    attempts: Mutex<Vec<Attempt>>,
}

/// Transport whose answers are controlled by the test.
///
/// Payloads are told apart by their `marker` field.
#[derive(Clone)]
pub struct ScriptedTransport {
    inner: Arc<Inner>,
}

impl ScriptedTransport {
    fn build(failing: bool, fail_markers: Vec<String>, delay: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                failing: AtomicBool::new(failing),
                fail_markers,
                delay,
                ..Default::default()
            }),
        }
    }

    pub fn succeeding() -> Self {
        Self::build(false, Vec::new(), None)
    }

    pub fn failing() -> Self {
        Self::build(true, Vec::new(), None)
    }

    /// Succeeds except for payloads whose marker is listed
    pub fn failing_markers(markers: &[&str]) -> Self {
        Self::build(false, markers.iter().map(|m| m.to_string()).collect(), None)
    }

    /// Same script, but every attempt takes `delay`
    pub fn with_delay(self, delay: Duration) -> Self {
        Self::build(
            self.inner.failing.load(Ordering::SeqCst),
            self.inner.fail_markers.clone(),
            Some(delay),
        )
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.log().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn attempted_markers(&self) -> Vec<String> {
        self.log().into_iter().filter_map(|a| a.marker).collect()
    }

    pub fn delivered_markers(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|a| a.success)
            .filter_map(|a| a.marker)
            .collect()
    }

    pub fn event_ids(&self) -> Vec<Uuid> {
        self.log().into_iter().map(|a| a.event_id).collect()
    }

    fn log(&self) -> Vec<Attempt> {
        self.inner.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(&self, _kind: &UploadKind, payload: &Payload, event_id: Uuid) -> DeliveryOutcome {
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.inner.delay {
            tokio::time::sleep(delay).await;
        }

        let marker = payload
            .get("marker")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let failing = self.inner.failing.load(Ordering::SeqCst)
            || marker
                .as_ref()
                .is_some_and(|m| self.inner.fail_markers.contains(m));

        self.inner.attempts.lock().unwrap().push(Attempt {
            marker,
            event_id,
            success: !failing,
        });
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);

        if failing {
            DeliveryOutcome::Failure(DeliveryFailure::Network("scripted failure".to_string()))
        } else {
            DeliveryOutcome::Success
        }
    }
}

/// Queue whose storage always faults
pub struct FailingQueue;

fn storage_fault() -> Error {
    Error::Io(std::io::Error::other("disk full"))
}

impl UploadQueue for FailingQueue {
    fn enqueue(&self, _kind: &UploadKind, _payload: &Payload, _event_id: Uuid) -> Result<QueuedUpload> {
        Err(storage_fault())
    }

    fn scan(&self) -> Result<Vec<PendingRow>> {
        Err(storage_fault())
    }

    fn list_all(&self) -> Result<Vec<QueuedUpload>> {
        Err(storage_fault())
    }

    fn list_recent(&self, _kind: &UploadKind, _limit: usize) -> Result<Vec<QueuedUpload>> {
        Err(storage_fault())
    }

    fn remove(&self, _id: i64) -> Result<()> {
        Err(storage_fault())
    }

    fn quarantine(&self, _id: i64, _reason: &str) -> Result<()> {
        Err(storage_fault())
    }
}

/// Real queue whose deletes always fault
pub struct StickyQueue(pub crate::db::Database);

impl UploadQueue for StickyQueue {
    fn enqueue(&self, kind: &UploadKind, payload: &Payload, event_id: Uuid) -> Result<QueuedUpload> {
        self.0.enqueue(kind, payload, event_id)
    }

    fn scan(&self) -> Result<Vec<PendingRow>> {
        self.0.scan()
    }

    fn list_all(&self) -> Result<Vec<QueuedUpload>> {
        self.0.list_all()
    }

    fn list_recent(&self, kind: &UploadKind, limit: usize) -> Result<Vec<QueuedUpload>> {
        self.0.list_recent(kind, limit)
    }

    fn remove(&self, _id: i64) -> Result<()> {
        Err(storage_fault())
    }

    fn quarantine(&self, id: i64, reason: &str) -> Result<()> {
        self.0.quarantine(id, reason)
    }
}
