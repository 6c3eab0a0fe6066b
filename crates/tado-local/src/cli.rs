//! Clap derive structures for the `tado-local` CLI.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

use tado_local_core::TrackedField;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// tado-local -- local HomeKit bridge for tado heating systems
#[derive(Debug, Parser)]
#[command(
    name = "tado-local",
    version,
    about = "Local HomeKit bridge for tado thermostats",
    long_about = "Pairs with a tado internet bridge over HomeKit, keeps every device's\n\
        state in a local SQLite file and writes time-bucketed history.\n\n\
        `run` keeps the gateway session open; the other commands read the\n\
        state file or open a short-lived session.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "TADO_LOCAL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// SQLite state file (overrides `state_path`)
    #[arg(long, env = "TADO_LOCAL_STATE", global = true)]
    pub state: Option<PathBuf>,

    /// HAP relay WebSocket URL (overrides `relay.url`)
    #[arg(long, env = "TADO_LOCAL_RELAY_URL", global = true)]
    pub relay: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "TADO_LOCAL_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Pair or reconnect, then keep the bridge running until Ctrl-C
    Run(RunArgs),

    /// Show pairing, connection and counter summary
    Status,

    /// List registered devices with their latest readings
    #[command(alias = "dev", alias = "d")]
    Devices,

    /// List zones
    #[command(alias = "z")]
    Zones,

    /// Show time-bucketed history for a device
    #[command(alias = "h")]
    History(HistoryArgs),

    /// Write a characteristic on a device
    Set(SetArgs),

    /// Inspect or remove stored gateway pairings
    Pairings(PairingsArgs),

    /// Manage configuration
    #[command(alias = "cfg")]
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Run ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Gateway address (overrides `gateway.address`)
    #[arg(long, env = "TADO_LOCAL_BRIDGE_IP")]
    pub bridge_ip: Option<String>,

    /// HomeKit setup code for first pairing (XXX-XX-XXX)
    #[arg(long, env = "TADO_LOCAL_PIN", hide_env_values = true)]
    pub pin: Option<String>,

    /// Forget stored pairings for the gateway before connecting
    #[arg(long)]
    pub clear_pairings: bool,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ── History ──────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Device id, serial number or name
    pub device: String,

    /// Earliest bucket (RFC 3339)
    #[arg(long)]
    pub start: Option<DateTime<Utc>>,

    /// Latest bucket (RFC 3339)
    #[arg(long)]
    pub end: Option<DateTime<Utc>>,

    /// Maximum number of buckets
    #[arg(long, short = 'n', default_value = "50")]
    pub limit: u32,

    /// Buckets to skip from the newest
    #[arg(long, default_value = "0")]
    pub offset: u64,
}

// ── Set ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SetArgs {
    /// Device id, serial number or name
    pub device: String,

    /// Field name (e.g. target_temperature, target_heating_cooling_state)
    #[arg(value_parser = parse_field)]
    pub field: TrackedField,

    /// New value
    #[arg(allow_negative_numbers = true)]
    pub value: f64,
}

fn parse_field(raw: &str) -> Result<TrackedField, String> {
    raw.parse().map_err(|_| {
        let writable: Vec<String> = TrackedField::ALL
            .iter()
            .filter(|f| f.is_writable())
            .map(ToString::to_string)
            .collect();
        format!("unknown field '{raw}' (writable: {})", writable.join(", "))
    })
}

// ── Pairings ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct PairingsArgs {
    #[command(subcommand)]
    pub command: PairingsCommand,
}

#[derive(Debug, Subcommand)]
pub enum PairingsCommand {
    /// List stored pairings
    #[command(alias = "ls")]
    List,

    /// Remove stored pairings
    #[command(alias = "rm")]
    Clear {
        /// Only remove the pairing for this gateway address
        #[arg(long)]
        address: Option<String>,
    },
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration (secrets redacted)
    Show,

    /// Print the config file path
    Path,

    /// Store the tado cloud refresh token
    SetCloudToken {
        /// Refresh token value
        token: String,

        /// Write the token into the config file instead of the system keyring
        #[arg(long)]
        plaintext: bool,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
