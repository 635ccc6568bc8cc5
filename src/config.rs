//! Command-line and environment configuration for the `cascade-sync` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;
pub const DB_FILE_NAME: &str = "cascade.db";

/// Offline-first client for hazard reports.
///
/// Keeps a local store of reports and media files, records every change in an
/// outbox, and replays it against the remote service when it is reachable.
///
/// Options can also be set through environment variables. Command-line
/// arguments take precedence.
#[derive(Parser, Debug)]
#[command(name = "cascade-sync", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Data directory holding the local store [env: CASCADE_HOME] [default: ~/.cascade]
    #[arg(long, short = 'd', global = true)]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the remote service [env: CASCADE_REMOTE_URL]
    #[arg(long, short = 'r', global = true)]
    pub remote_url: Option<String>,

    /// Timeout for each remote request, in seconds [env: CASCADE_TIMEOUT_SECS] [default: 10]
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// Quiet period before acting on a connectivity change, in milliseconds [env: CASCADE_DEBOUNCE_MS] [default: 300]
    #[arg(long, global = true)]
    pub debounce_ms: Option<u64>,

    /// How often `watch` probes the remote, in seconds [default: 15]
    #[arg(long, global = true)]
    pub probe_interval_secs: Option<u64>,

    /// Never contact the remote
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show connectivity, store location and pending change count
    Status,
    /// List pending outbox entries
    Pending,
    /// Run one sync pass now
    Sync,
    /// List reports
    List {
        #[arg(long)]
        limit: Option<usize>,
        /// dateReported, createdAt, updatedAt or title
        #[arg(long, default_value = "dateReported")]
        sort_by: String,
        /// asc or desc
        #[arg(long, default_value = "desc")]
        order: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        severity: Option<String>,
        #[arg(long)]
        hazard_type: Option<String>,
    },
    /// Show one report
    Show { id: String },
    /// File a new report
    Report {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        location: String,
        #[arg(long)]
        specific_location: Option<String>,
        #[arg(long)]
        hazard_type: String,
        /// Low, Medium, High or Critical
        #[arg(long)]
        severity: String,
        #[arg(long)]
        reported_by: String,
        #[arg(long, requires = "lng")]
        lat: Option<f64>,
        #[arg(long, requires = "lat")]
        lng: Option<f64>,
    },
    /// Change a report's status
    SetStatus { id: String, status: String },
    /// Delete a report
    Delete { id: String },
    /// Attach a file to a report
    Attach {
        report_id: String,
        path: PathBuf,
        /// Defaults to a guess from the file extension
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Drop a pending change without sending it
    Discard { entry: i64 },
    /// Retry a change the remote rejected
    Retry { entry: i64 },
    /// Show KPIs
    Kpis,
    /// Probe the remote periodically and sync whenever it comes back
    Watch,
}

pub struct Config {
    pub data_dir: PathBuf,
    pub remote_url: Option<String>,
    pub timeout: Duration,
    pub debounce: Duration,
    pub probe_interval: Duration,
    pub force_offline: bool,
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_cli_and_env(args: &GlobalArgs) -> Self {
        let data_dir = args
            .data_dir
            .clone()
            .or_else(|| std::env::var("CASCADE_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".cascade"))
                    .unwrap_or_else(|_| PathBuf::from(".cascade"))
            });

        let remote_url = args
            .remote_url
            .clone()
            .or_else(|| std::env::var("CASCADE_REMOTE_URL").ok())
            .filter(|url| !url.trim().is_empty());

        let timeout_secs = args
            .timeout_secs
            .or_else(|| env_u64("CASCADE_TIMEOUT_SECS"))
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let debounce_ms = args
            .debounce_ms
            .or_else(|| env_u64("CASCADE_DEBOUNCE_MS"))
            .unwrap_or(DEFAULT_DEBOUNCE_MS);

        let probe_interval_secs = args
            .probe_interval_secs
            .unwrap_or(DEFAULT_PROBE_INTERVAL_SECS)
            .max(1);

        Self {
            data_dir,
            remote_url,
            timeout: Duration::from_secs(timeout_secs),
            debounce: Duration::from_millis(debounce_ms),
            probe_interval: Duration::from_secs(probe_interval_secs),
            force_offline: args.offline,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }
}
