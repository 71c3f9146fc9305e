//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use handoff_core::config::Config;
use handoff_core::sync::Backend;

pub mod config;
pub mod receive;
pub mod send;

/// Load configuration with graceful fallback to defaults.
///
/// An explicit path must load; the default location falls back to defaults
/// with a warning when the file cannot be parsed.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Cannot load configuration from '{}'", path.display())),
        None => Ok(Config::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring unreadable configuration file");
            Config::default()
        })),
    }
}

/// Handoff - move a file between two local processes through shared memory
#[derive(Parser)]
#[command(name = "handoff")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(long, global = true, env = "HANDOFF_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Whether detailed logging was requested.
    pub const fn verbose(&self) -> bool {
        match &self.command {
            Command::Send(args) => args.transfer.verbose,
            Command::Recv(args) => args.transfer.verbose,
            Command::Config(_) => false,
        }
    }

    /// Whether output should be JSON.
    pub const fn json(&self) -> bool {
        match &self.command {
            Command::Send(args) => args.transfer.json,
            Command::Recv(args) => args.transfer.json,
            Command::Config(_) => false,
        }
    }
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Send a file to a waiting receiver
    Send(SendArgs),

    /// Receive a file from a sender
    #[command(alias = "receive")]
    Recv(ReceiveArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Handshake backend selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// System V message queue
    Queue,
    /// SIGUSR1/SIGUSR2 notifications
    Signal,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Queue => Self::Queue,
            BackendArg::Signal => Self::Signal,
        }
    }
}

/// Options shared by `send` and `recv`
#[derive(Args, Debug, Default)]
pub struct TransferArgs {
    /// Handshake backend (both sides must agree)
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Shared buffer capacity in bytes (both sides must agree)
    #[arg(short, long)]
    pub capacity: Option<usize>,

    /// File used to derive the IPC key
    #[arg(short, long, value_name = "FILE")]
    pub key_file: Option<PathBuf>,

    /// Project id used to derive the IPC key
    #[arg(long)]
    pub project_id: Option<char>,

    /// How long to wait for the peer (e.g., 30s, 2m)
    #[arg(long, value_name = "DURATION")]
    pub discovery_timeout: Option<String>,

    /// How long a single handshake may block, 0 to wait forever (e.g., 30s)
    #[arg(short, long, value_name = "DURATION")]
    pub timeout: Option<String>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Detailed logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl TransferArgs {
    /// Override configuration values given on the command line.
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(backend) = self.backend {
            config.transfer.backend = backend.into();
        }
        if let Some(capacity) = self.capacity {
            config.transfer.capacity = capacity;
        }
        if let Some(ref key_file) = self.key_file {
            config.ipc.key_file.clone_from(key_file);
        }
        if let Some(project_id) = self.project_id {
            config.ipc.project_id = project_id;
        }
        if let Some(ref value) = self.discovery_timeout {
            config.timeouts.peer_discovery = parse_duration_arg("--discovery-timeout", value)?;
        }
        if let Some(ref value) = self.timeout {
            config.timeouts.handshake = parse_duration_arg("--timeout", value)?;
        }
        config.validate()?;
        Ok(())
    }

    /// Whether human-readable progress should be printed.
    pub const fn interactive(&self) -> bool {
        !self.quiet && !self.json
    }
}

fn parse_duration_arg(flag: &str, value: &str) -> Result<std::time::Duration> {
    handoff_core::config::parse_duration(value).with_context(|| {
        format!("Invalid duration '{value}' for {flag} (expected e.g. 500ms, 30s, 2m)")
    })
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// File to send
    pub file: PathBuf,

    /// Transfer options
    #[command(flatten)]
    pub transfer: TransferArgs,
}

/// Arguments for the receive command
#[derive(Parser)]
pub struct ReceiveArgs {
    /// Output file (defaults to the configured output, "recvfile")
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Transfer options
    #[command(flatten)]
    pub transfer: TransferArgs,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}
