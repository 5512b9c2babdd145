//! Connectivity watcher
//!
//! Turns a stream of "is the network reachable" notifications into drain
//! requests, firing only on the Disconnected -> Connected edge.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::db::UploadQueue;
use crate::error::{Error, Result};
use crate::upload::{CoordinatorHandle, DrainReason};

/// Link state as seen by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Unknown or unreachable
    #[default]
    Disconnected,
    Connected,
}

/// Something that can be asked to drain the queue
pub trait DrainTrigger {
    /// Returns whether a new drain was actually scheduled
    fn request_drain(&self, reason: DrainReason) -> bool;
}

impl<Q: UploadQueue> DrainTrigger for CoordinatorHandle<Q> {
    fn request_drain(&self, reason: DrainReason) -> bool {
        CoordinatorHandle::request_drain(self, reason)
    }
}

/// Edge-triggered reachability state machine
#[derive(Debug, Default)]
pub struct ConnectivityWatcher {
    state: LinkState,
}

impl ConnectivityWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Feed one notification. Returns true only when the link just came up.
    pub fn observe(&mut self, reachable: bool) -> bool {
        let next = if reachable {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        let came_up = self.state == LinkState::Disconnected && next == LinkState::Connected;

        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "Connectivity changed");
        }
        self.state = next;
        came_up
    }

    /// Consume notifications until the sender side closes.
    ///
    /// Returns how many drains were requested.
    pub async fn run<D: DrainTrigger>(mut self, mut signals: mpsc::Receiver<bool>, trigger: D) -> usize {
        let mut triggered = 0;

        while let Some(reachable) = signals.recv().await {
            if self.observe(reachable) {
                triggered += 1;
                if trigger.request_drain(DrainReason::ConnectivityRestored) {
                    tracing::info!("Network available, retrying pending uploads");
                }
            }
        }

        tracing::debug!(triggered, "Connectivity watcher stopped");
        triggered
    }
}

/// Periodic HTTP reachability probe.
///
/// Any HTTP response counts as reachable; only transport errors count as
/// unreachable.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create probe client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Check once whether the endpoint answers
    pub async fn is_reachable(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::trace!(url = %self.url, error = %e, "Probe failed");
                false
            }
        }
    }

    /// Probe every `interval` and publish results until the receiver is gone
    pub async fn run(self, interval: Duration, signals: mpsc::Sender<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let reachable = self.is_reachable().await;
            if signals.send(reachable).await.is_err() {
                break;
            }
        }
    }
}
