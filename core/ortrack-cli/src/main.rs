//! ortrack: operator shell over the reconciliation engine.
//!
//! Every command prints one JSON `Response` envelope on stdout and logs to
//! stderr. Scans come from scanner JSON files (`{"tags": [{"epc": ..}]}`);
//! passing several files to `watch` replays them one per cycle.
//!
//! ## Subcommands
//!
//! - `import`: Load a catalog seed into the database
//! - `verify`: One verification scan for an operation session
//! - `watch`: Continuous verification until valid or timed out
//! - `outbound`: Post-operative room check
//! - `status` / `outbound-status`: Stored results, no scan
//! - `advance`: Move an operation session through its lifecycle
//! - `invalidate`: Mark a verification session invalid

mod commands;
mod logging;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use ortrack_core::OperationState;
use ortrack_protocol::Response;

#[derive(Parser)]
#[command(name = "ortrack")]
#[command(about = "Operating-room instrument and tray reconciliation")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.ortrack/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Database file, overriding storage.database_path
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import tags, items, operation types and sessions from a JSON seed
    Import {
        #[arg(value_name = "SEED")]
        seed: PathBuf,
    },

    /// Run one verification cycle
    Verify {
        #[arg(value_name = "SESSION_ID")]
        session_id: i64,

        /// Scanner output to reconcile
        #[arg(long = "scan", value_name = "FILE", required = true)]
        scans: Vec<PathBuf>,

        /// Keep previously used items and add to them
        #[arg(long)]
        cumulative: bool,

        /// Recorded as verified_by
        #[arg(long)]
        operator: Option<String>,
    },

    /// Verify repeatedly until valid or the time limit passes
    Watch {
        #[arg(value_name = "SESSION_ID")]
        session_id: i64,

        /// Scanner outputs, one per cycle; the last repeats
        #[arg(long = "scan", value_name = "FILE", required = true)]
        scans: Vec<PathBuf>,

        /// Discard previous cycles' used items on each cycle
        #[arg(long)]
        fresh: bool,

        #[arg(long)]
        operator: Option<String>,

        /// Overall limit, overriding verification.max_duration_secs
        #[arg(long, value_name = "SECS")]
        max_secs: Option<u64>,

        /// Pause between cycles, overriding verification.cycle_interval_secs
        #[arg(long, value_name = "SECS")]
        interval_secs: Option<u64>,
    },

    /// Check that every used item has left the room
    Outbound {
        #[arg(value_name = "SESSION_ID")]
        session_id: i64,

        #[arg(long = "scan", value_name = "FILE", required = true)]
        scans: Vec<PathBuf>,

        /// Recorded as checked_by
        #[arg(long)]
        operator: Option<String>,
    },

    /// Stored verification result
    Status {
        #[arg(value_name = "SESSION_ID")]
        session_id: i64,
    },

    /// Latest outbound check, if still fresh
    OutboundStatus {
        #[arg(value_name = "SESSION_ID")]
        session_id: i64,
    },

    /// Move an operation session to a new state
    Advance {
        #[arg(value_name = "SESSION_ID")]
        session_id: i64,

        /// scheduled, in_progress, completed, verified or cancelled
        #[arg(value_name = "STATE", value_parser = parse_state)]
        state: OperationState,
    },

    /// Mark a session's verification invalid; later cycles are rejected
    Invalidate {
        #[arg(value_name = "SESSION_ID")]
        session_id: i64,

        #[arg(long)]
        operator: Option<String>,
    },
}

fn parse_state(value: &str) -> Result<OperationState, String> {
    OperationState::from_str(value).ok_or_else(|| format!("unknown operation state '{}'", value))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, config_error) = match ortrack_core::load_config(cli.config.as_deref()) {
        Ok(config) => (config, None),
        Err(err) => (ortrack_core::EngineConfig::default(), Some(err)),
    };
    let log_dir = config.logging.resolved_directory().ok();
    let _logging_guard = logging::init(log_dir.as_deref());
    if let Some(err) = config_error {
        tracing::warn!(error = %err, "Config unusable; using defaults");
    }

    let context = commands::Context {
        config,
        db_path: cli.db,
    };
    let response = match commands::run(&context, cli.command) {
        Ok(data) => Response::ok(data),
        Err(err) => {
            tracing::error!(code = err.code(), error = %err, "ortrack command failed");
            Response::error_with_info(err.to_error_info())
        }
    };

    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{}", json),
        Err(err) => tracing::error!(error = %err, "Failed to encode response"),
    }
    if response.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
