//! Clap derive structures for the `emslink` CLI.

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// emslink -- command-line client for energy-management edge backends
#[derive(Debug, Parser)]
#[command(
    name = "emslink",
    version,
    about = "Talk to energy-management edge backends from the command line",
    long_about = "Connects to an edge backend over its WebSocket API: \
        authenticate, list devices, stream telemetry, and send queries.",
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
    /// Connection profile to use
    #[arg(long, short = 'c', env = "EMSLINK_CONNECTION", global = true)]
    pub connection: Option<String>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Authenticate and store the session token
    Login {
        /// Password (prompts when omitted and no other source applies)
        #[arg(long, hide_env = true, env = "EMSLINK_PASSWORD")]
        password: Option<String>,
    },

    /// Drop the session and delete the stored token
    Logout,

    /// List devices announced by the backend
    Devices {
        /// Output format
        #[arg(long, short = 'o', value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// Stream messages for a device (Ctrl-C to stop)
    Watch {
        /// Device name (defaults to the sole device)
        device: Option<String>,

        /// Channel addresses to subscribe to
        #[arg(long, short = 'C')]
        channels: Vec<String>,
    },

    /// Send a query and print the correlated reply
    Query {
        /// Query body as raw JSON, e.g. '{"query":{"kind":"history"}}'
        body: String,

        /// Target device name
        #[arg(long, short = 'd')]
        device: Option<String>,
    },

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the resolved configuration
    Show,

    /// Print the config file path
    Path,

    /// Add or update a connection profile
    Set {
        /// Connection name
        name: String,

        /// Backend WebSocket URL
        #[arg(long)]
        url: String,

        /// Make this the default connection
        #[arg(long)]
        default: bool,
    },
}

// ── Shared value types ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}
