//! guardiantrack - background location and activity reporting agent
//!
//! Every capture event is posted to the configured collection endpoint right
//! away. Events that cannot be delivered are kept in a local queue and
//! retried on startup, whenever the network comes back, or on request.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/guardiantrack/queue.db (~/.local/share/guardiantrack/queue.db)
//! - Logs: $XDG_STATE_HOME/guardiantrack/ (~/.local/state/guardiantrack/)
//! - Config: $XDG_CONFIG_HOME/guardiantrack/config.toml (~/.config/guardiantrack/config.toml)

mod agent;
mod process_lock;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use guardiantrack_core::upload::{DrainReason, UploadClient, UploadCoordinator};
use guardiantrack_core::{CaptureEvent, Config, Database, Payload, UploadKind, UploadQueue};
use process_lock::acquire_agent_guard;
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(name = "guardiantrack")]
#[command(about = "Background location and activity reporting agent")]
#[command(version)]
struct Args {
    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent: read capture events from stdin and keep retrying
    Run(agent::RunArgs),

    /// Send a single capture event
    Send {
        /// Event kind (location, call_log, sms_log, ...)
        #[arg(short, long)]
        kind: UploadKind,

        /// Payload field as name=value (repeatable, order is kept)
        #[arg(short, long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,
    },

    /// Retry every pending upload now
    Drain,

    /// Show pending uploads
    Pending {
        /// Only show uploads of this kind
        #[arg(short, long)]
        kind: Option<UploadKind>,

        /// Maximum number of uploads to show (default: from config)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show configuration and queue status
    Status,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let mut logging = config.logging.clone();
    match args.verbose {
        0 => {}
        1 => logging.level = "debug".to_string(),
        _ => logging.level = "trace".to_string(),
    }
    let _log_guard =
        guardiantrack_core::logging::init(&logging).context("failed to initialize logging")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let result = runtime.block_on(async {
        match args.command {
            Command::Run(run_args) => agent::run(&config, run_args).await,
            Command::Send { kind, fields } => cmd_send(&config, kind, &fields).await,
            Command::Drain => cmd_drain(&config).await,
            Command::Pending { kind, limit } => cmd_pending(&config, kind, limit),
            Command::Status => cmd_status(&config),
        }
    });

    // A pending stdin read cannot be cancelled; don't wait for it.
    runtime.shutdown_background();
    result
}

/// Open the queue database at its XDG path and bring the schema up to date
pub(crate) fn open_queue() -> Result<Arc<Database>> {
    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening queue database");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(Arc::new(db))
}

/// Build the endpoint client, explaining how to configure it when missing
pub(crate) fn upload_client(config: &Config) -> Result<UploadClient> {
    UploadClient::new(&config.endpoint)
        .context("collection endpoint is not configured correctly (run 'status' for details)")
}

async fn cmd_send(config: &Config, kind: UploadKind, fields: &[String]) -> Result<()> {
    let payload = parse_fields(fields)?;
    let client = upload_client(config)?;

    let _guard = acquire_agent_guard(&Config::database_path())
        .context("failed to acquire process lock")?;
    let queue = open_queue()?;

    let event = CaptureEvent::new(kind, payload);
    let event_id = event.event_id;

    let (handle, worker) = UploadCoordinator::new(client, queue).spawn();
    handle.submit(event)?;
    drop(handle);
    let stats = worker.await.context("upload worker panicked")?;

    if stats.delivered_immediately > 0 {
        println!("Delivered event {}", event_id);
    } else if stats.queued > 0 {
        println!("Delivery failed, event {} queued for retry", event_id);
    } else {
        anyhow::bail!("delivery failed and event {} could not be queued", event_id);
    }

    Ok(())
}

async fn cmd_drain(config: &Config) -> Result<()> {
    let client = upload_client(config)?;

    let _guard = acquire_agent_guard(&Config::database_path())
        .context("failed to acquire process lock")?;
    let queue = open_queue()?;

    let (handle, worker) = UploadCoordinator::new(client, queue).spawn();
    let report = handle.drain(DrainReason::Explicit).await?;
    drop(handle);
    worker.await.context("upload worker panicked")?;

    if report.attempted == 0 {
        println!("No pending uploads");
        return Ok(());
    }

    println!("Retried {} pending upload(s)", report.attempted);
    println!("  Delivered:   {}", report.delivered);
    println!("  Failed:      {}", report.failed);
    if report.quarantined > 0 {
        println!("  Quarantined: {}", report.quarantined);
    }
    match report.remaining {
        Some(remaining) => println!("  Remaining:   {}", remaining),
        None => println!("  Remaining:   unknown (queue could not be read)"),
    }

    Ok(())
}

fn cmd_pending(config: &Config, kind: Option<UploadKind>, limit: Option<usize>) -> Result<()> {
    let queue = open_queue()?;
    let limit = limit.unwrap_or(config.diagnostics.recent_limit);

    let uploads = match &kind {
        Some(kind) => queue.list_recent(kind, limit)?,
        None => {
            let mut all = queue.list_all()?;
            all.reverse();
            all.truncate(limit);
            all
        }
    };

    if uploads.is_empty() {
        match kind {
            Some(kind) => println!("No pending {} uploads", kind),
            None => println!("No pending uploads"),
        }
        return Ok(());
    }

    for upload in &uploads {
        println!(
            "#{:<6} {:<10} {}  {}",
            upload.id,
            upload.kind,
            upload.queued_at.format("%Y-%m-%d %H:%M:%S"),
            upload.payload
        );
    }

    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("GuardianTrack Status");
    println!("====================");
    println!();

    let endpoint = &config.endpoint;
    println!(
        "Endpoint:        {}",
        endpoint.url.as_deref().unwrap_or("<not set>")
    );
    println!(
        "API Key:         {}",
        if endpoint.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!(
        "Timeouts:        connect {}s, write {}s, read {}s",
        endpoint.connect_timeout_secs, endpoint.write_timeout_secs, endpoint.read_timeout_secs
    );
    println!(
        "Probe URL:       {}",
        config.probe_url().unwrap_or("<not set>")
    );
    println!(
        "Probe Interval:  {}s",
        config.connectivity.probe_interval().as_secs()
    );

    if endpoint.url.is_none() {
        println!();
        println!("Endpoint is not configured. Set it in config.toml:");
        println!();
        println!("  [endpoint]");
        println!("  url = \"https://collector.example.com/exec\"");
    }

    let log_dir = guardiantrack_core::logging::log_dir();
    let log_files = guardiantrack_core::logging::log_files_in(&log_dir)?;
    let db_path = Config::database_path();
    println!();
    println!("Logs:            {} ({} file(s))", log_dir.display(), log_files.len());
    println!("Database:        {}", db_path.display());

    if !db_path.exists() {
        println!("Pending uploads: 0");
        return Ok(());
    }

    let queue = open_queue()?;
    let total = queue.count_pending_uploads()?;
    println!("Pending uploads: {}", total);
    for entry in queue.count_pending_by_kind()? {
        println!("  {:<14} {}", entry.kind, entry.count);
    }

    let quarantined = queue.count_quarantined_uploads()?;
    if quarantined > 0 {
        println!("Quarantined:     {}", quarantined);
    }

    Ok(())
}

/// Turn `name=value` arguments into a payload.
///
/// Values that read as JSON numbers, booleans or null keep that type;
/// everything else is sent as text.
fn parse_fields(fields: &[String]) -> Result<Payload> {
    let mut map = Map::new();

    for field in fields {
        let (name, raw) = field
            .split_once('=')
            .with_context(|| format!("invalid field '{}': expected NAME=VALUE", field))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("invalid field '{}': name must not be empty", field);
        }

        let value = match serde_json::from_str::<Value>(raw) {
            Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
            _ => Value::String(raw.to_string()),
        };
        map.insert(name.to_string(), value);
    }

    Ok(Payload::from_value(Value::Object(map))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_fields_keeps_order_and_types() {
        let payload = parse_fields(&fields(&[
            "timestamp=6/01/2025 08:00:00",
            "latitude=51.5",
            "longitude=-0.12",
            "answered=true",
        ]))
        .unwrap();

        let names: Vec<&str> = payload.field_names().collect();
        assert_eq!(names, vec!["timestamp", "latitude", "longitude", "answered"]);
        assert_eq!(payload.get("latitude"), Some(&serde_json::json!(51.5)));
        assert_eq!(
            payload.get("timestamp"),
            Some(&serde_json::json!("6/01/2025 08:00:00"))
        );
        assert_eq!(payload.get("answered"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn test_parse_fields_rejects_missing_separator() {
        assert!(parse_fields(&fields(&["latitude"])).is_err());
        assert!(parse_fields(&fields(&["=1"])).is_err());
    }

    #[test]
    fn test_parse_fields_value_may_contain_equals() {
        let payload = parse_fields(&fields(&["message=a=b"])).unwrap();
        assert_eq!(payload.get("message"), Some(&serde_json::json!("a=b")));
    }
}
