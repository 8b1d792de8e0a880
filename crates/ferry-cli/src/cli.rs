use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use ferry_core::domain::StateFilter;

#[derive(Parser, Debug)]
#[command(name = "ferry", about = "Durable background upload queue")]
pub struct Cli {
    /// TOML config file
    #[arg(short = 'c', long, env = "FERRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Queue database (overrides `store.path`; defaults to ./ferry.db)
    #[arg(long, env = "FERRY_DB")]
    pub db: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add an upload to the queue
    Enqueue {
        /// Path of the local file to upload
        content_ref: String,

        /// Metadata entry, repeatable (`--meta destination=photo.jpg`)
        #[arg(long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },

    /// Show pending / in-flight / failed counts
    Status,

    /// List items in one state
    List {
        #[arg(long, value_enum, default_value = "pending")]
        state: StateArg,
    },

    /// Move a failed item back to pending with a fresh attempt budget
    Requeue { id: String },

    /// Delete every failed item
    PurgeFailed,

    /// Simulate a host wake, copying uploads into a directory
    Wake {
        /// Wake budget (defaults to `session.default_budget_secs`)
        #[arg(long)]
        budget_secs: Option<u64>,

        #[arg(long)]
        dest_dir: PathBuf,
    },

    /// Invoke a background channel method (`getQueueCount`, `processQueue`)
    Call {
        method: String,

        #[arg(long)]
        dest_dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StateArg {
    Pending,
    InFlight,
    Failed,
}

impl From<StateArg> for StateFilter {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Pending => StateFilter::Pending,
            StateArg::InFlight => StateFilter::InFlight,
            StateArg::Failed => StateFilter::Failed,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}
