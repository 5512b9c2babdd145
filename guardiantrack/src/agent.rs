//! Agent mode: long-running capture and upload loop.
//!
//! Startup drains whatever earlier runs left behind, submits the newest
//! call/SMS log entries, then forwards capture events from stdin until EOF or
//! Ctrl+C. A reachability probe drives the connectivity watcher in the
//! background.
//!
//! Ctrl+C stops the upload worker without retrying the rest of the queue;
//! undelivered rows are picked up by the next run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use guardiantrack_core::capture::{
    forward_events, newest, CallLogEntry, CaptureRecord, JsonLinesSource, SmsLogEntry,
};
use guardiantrack_core::connectivity::{ConnectivityWatcher, HttpProbe};
use guardiantrack_core::upload::{CoordinatorHandle, DrainReason, UploadCoordinator, UploadStats};
use guardiantrack_core::{Config, Database};
use serde::de::DeserializeOwned;
use tokio::io::BufReader;
use tokio::sync::mpsc;

use crate::process_lock::acquire_agent_guard;
use crate::{open_queue, upload_client};

#[derive(Args)]
pub struct RunArgs {
    /// JSON array of call-log entries to report at startup
    #[arg(long, value_name = "FILE")]
    call_log: Option<PathBuf>,

    /// JSON array of SMS-log entries to report at startup
    #[arg(long, value_name = "FILE")]
    sms_log: Option<PathBuf>,

    /// Keep running after stdin closes, until interrupted
    #[arg(long)]
    keep_alive: bool,

    /// Disable the reachability probe
    #[arg(long)]
    no_probe: bool,
}

pub async fn run(config: &Config, args: RunArgs) -> Result<()> {
    let client = upload_client(config)?;

    let db_path = Config::database_path();
    let _guard = acquire_agent_guard(&db_path).context("failed to acquire process lock")?;
    let queue = open_queue()?;

    tracing::info!(endpoint = %client.url(), "guardiantrack agent starting");
    println!("Database: {}", db_path.display());
    println!("Endpoint: {}", client.url());

    let (handle, mut worker) = UploadCoordinator::new(client, queue).spawn();
    handle.request_drain(DrainReason::Startup);

    let probe_task = if args.no_probe {
        None
    } else {
        Some(start_connectivity(config, &handle)?)
    };

    let limit = config.capture.log_batch_limit;
    let mut submitted = 0;
    if let Some(path) = &args.call_log {
        submitted += submit_log::<CallLogEntry>(path, limit, &handle)?;
    }
    if let Some(path) = &args.sms_log {
        submitted += submit_log::<SmsLogEntry>(path, limit, &handle)?;
    }

    let mut source = JsonLinesSource::new(BufReader::new(tokio::io::stdin()));
    let mut interrupted = tokio::select! {
        result = forward_events(&mut source, &handle) => {
            submitted += result?;
            tracing::info!(submitted, "Capture input closed");
            if args.keep_alive {
                wait_for_interrupt().await;
                true
            } else {
                false
            }
        }
        _ = wait_for_interrupt() => true,
    };

    if let Some((probe, watcher)) = probe_task {
        // Dropping the probe closes the signal channel, which ends the watcher.
        probe.abort();
        let _ = watcher.await;
    }

    let stop = handle.shutdown_token();
    if interrupted {
        stop.cancel();
    }
    drop(handle);

    // After EOF the worker finishes its backlog unless interrupted; a second
    // interrupt exits without waiting for it.
    let stats = loop {
        tokio::select! {
            stats = &mut worker => break stats.context("upload worker panicked")?,
            _ = wait_for_interrupt() => {
                if interrupted {
                    eprintln!("Interrupted again, exiting without waiting for uploads");
                    std::process::exit(130);
                }
                interrupted = true;
                stop.cancel();
            }
        }
    };
    print_summary(submitted, source.skipped(), &stats);

    Ok(())
}

type ConnectivityTasks = (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<usize>);

fn start_connectivity(
    config: &Config,
    handle: &CoordinatorHandle<Database>,
) -> Result<ConnectivityTasks> {
    let url = config
        .probe_url()
        .context("no probe URL configured")?
        .to_string();
    let probe = HttpProbe::new(url.clone(), config.endpoint.connect_timeout())?;
    let interval = config.connectivity.probe_interval();

    tracing::info!(url = %url, interval_secs = interval.as_secs(), "Starting reachability probe");

    let (tx, rx) = mpsc::channel(4);
    let probe = tokio::spawn(probe.run(interval, tx));
    let watcher = tokio::spawn(ConnectivityWatcher::new().run(rx, handle.clone()));
    Ok((probe, watcher))
}

/// Submit the newest `limit` entries of a JSON log file
fn submit_log<T>(path: &Path, limit: usize, handle: &CoordinatorHandle<Database>) -> Result<usize>
where
    T: CaptureRecord + DeserializeOwned,
{
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let entries: Vec<T> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let total = entries.len();
    let batch = newest(entries, limit);
    for entry in &batch {
        handle.submit(entry.to_event())?;
    }

    tracing::info!(
        kind = %T::kind(),
        total,
        submitted = batch.len(),
        "Submitted log batch"
    );
    Ok(batch.len())
}

async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!();
    println!("Interrupted, shutting down (press Ctrl+C again to exit now)...");
}

fn print_summary(submitted: usize, skipped: usize, stats: &UploadStats) {
    println!();
    println!("Agent stopped:");
    println!("  Events submitted:       {}", submitted);
    if skipped > 0 {
        println!("  Malformed input lines:  {}", skipped);
    }
    println!("  Delivered immediately:  {}", stats.delivered_immediately);
    println!("  Queued for retry:       {}", stats.queued);
    println!("  Redelivered:            {}", stats.redelivered);
    if stats.enqueue_failures > 0 {
        println!("  Lost (queue errors):    {}", stats.enqueue_failures);
    }
    if stats.quarantined > 0 {
        println!("  Quarantined:            {}", stats.quarantined);
    }
}
