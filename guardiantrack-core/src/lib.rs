//! # guardiantrack-core
//!
//! Core library for guardiantrack - a background location and activity
//! reporting agent.
//!
//! This library provides:
//! - Domain types for capture events and queued uploads
//! - A durable upload queue backed by SQLite
//! - The upload pipeline: HTTP client, coordinator and its worker
//! - An edge-triggered connectivity watcher
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Delivery model
//!
//! Every capture event is delivered immediately. Only failures are persisted,
//! and persisted rows are retried on startup, when connectivity returns, or
//! on request. Delivery is at-least-once.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use guardiantrack_core::upload::{UploadClient, UploadCoordinator};
//! use guardiantrack_core::{Config, Database};
//!
//! # async fn run() -> guardiantrack_core::Result<()> {
//! let config = Config::load()?;
//!
//! let db = Database::open(&Config::database_path())?;
//! db.migrate()?;
//!
//! let client = UploadClient::new(&config.endpoint)?;
//! let (handle, _worker) = UploadCoordinator::new(client, Arc::new(db)).spawn();
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{Database, UploadQueue};
pub use error::{Error, Result};
pub use types::*;

// Public modules
pub mod capture;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod logging;
pub mod types;
pub mod upload;

#[cfg(test)]
mod testing;
