//! Offline-resilient upload pipeline
//!
//! ## Flow
//!
//! ```text
//! CaptureSource ──► CoordinatorHandle ──► worker task ──► Transport (POST)
//!                                             │               │ failure
//!                                             │               ▼
//!                                             └──── drain ◄── UploadQueue (SQLite)
//! ```
//!
//! - A fresh event is delivered immediately; only a failed delivery is queued.
//! - A drain retries every queued row in order and deletes each row as soon as
//!   it is delivered.
//! - Drains run on startup, when connectivity returns, or on request.
//!
//! Delivery is at-least-once. Every attempt for the same capture event
//! carries the same `Idempotency-Key` header.

mod client;
mod coordinator;
mod worker;

pub use client::{Transport, UploadClient, IDEMPOTENCY_HEADER};
pub use coordinator::{DrainReason, DrainReport, EventDisposition, UploadCoordinator, UploadStats};
pub use worker::CoordinatorHandle;
