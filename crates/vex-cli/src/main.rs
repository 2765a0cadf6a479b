//! vex-cli, the thin control plane for the vexd daemon.
//!
//! Translates command verbs into socket requests and prints responses. The
//! daemon owns all subsystems and persisted state; whatever this client
//! changes survives the next boot.
//!
//! Restriction-lowering verbs (`unlock`, `reset-score`) take a signed JSON
//! payload as their first argument and are verified here against the
//! management key before the request is ever sent; the daemon trusts
//! co-privileged socket peers, so the gate lives on this side.

mod client;
mod commands;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vex_core::security::{ManagementKey, SignedCommand};
use vex_core::Paths;

use crate::client::Client;

/// vex-cli - control plane for the vexd enforcement daemon
#[derive(Parser, Debug)]
#[command(name = "vex-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Root all state/config paths under this directory instead of the
    /// system layout (must match the daemon's --state-root).
    #[arg(long, global = true)]
    state_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Display current system state (human-readable)
    Status,
    /// Dump live system state as JSON (machine-readable)
    State,
    /// Set network profile (standard|choke|dial-up|black-hole, aliases accepted)
    Throttle {
        /// Profile name or alias
        profile: String,
    },
    /// Set CPU limit percentage (1-100)
    Cpu {
        /// Percentage of capacity; 100 lifts the cap
        percent: String,
    },
    /// Set input latency in milliseconds (0 = pass-through)
    Latency {
        /// Delay in milliseconds
        ms: String,
    },
    /// Set OOM score adjustment (-1000 to 1000)
    Oom {
        /// Score adjustment
        score: String,
    },
    /// Start an interactive penance submission session
    Penance,
    /// Manage the domain blocklist: add/rm/list, or a bare domain as
    /// shorthand for add
    Block {
        /// `add <domain>`, `rm <domain>`, `list`, or `<domain>`
        #[arg(num_args = 0..)]
        args: Vec<String>,
    },
    /// Manage the writing-lines task: set/clear/status/submit
    Lines {
        /// `set <count> <phrase...>`, `clear`, `status`, or `submit`
        #[arg(num_args = 0..)]
        args: Vec<String>,
    },
    /// Manage the forbidden-process list: add/rm/list
    App {
        /// `add <name>`, `rm <name>`, or `list`
        #[arg(num_args = 0..)]
        args: Vec<String>,
    },
    /// Lift all restrictions (requires signed authorization payload)
    Unlock {
        /// Signed JSON payload from the management key holder
        payload: String,
    },
    /// Reset failure score to zero (requires signed authorization payload)
    ResetScore {
        /// Signed JSON payload from the management key holder
        payload: String,
    },
    /// Run anti-tamper and integrity checks
    Check,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = cli
        .state_root
        .as_deref()
        .map_or_else(Paths::system, Paths::rooted);

    if !commands::operator_access() {
        bail!("vex-cli requires root privileges or membership in the 'vex' group");
    }

    // Authorization gate: restriction-lowering verbs carry a payload that
    // must verify against the management key before anything is sent.
    match &cli.command {
        Command::Unlock { payload } | Command::ResetScore { payload } => {
            verify_authorization(&paths, payload)?;
        }
        _ => {}
    }

    let client = Client::new(&paths);
    match cli.command {
        Command::Status => commands::status(&client),
        Command::State => commands::state_dump(&client),
        Command::Throttle { profile } => commands::throttle(&client, &profile),
        Command::Cpu { percent } => commands::cpu(&client, &percent),
        Command::Latency { ms } => commands::latency(&client, &ms),
        Command::Oom { score } => commands::oom(&client, &score),
        Command::Penance => commands::penance(&client, &paths),
        Command::Block { args } => commands::block(&client, &args),
        Command::Lines { args } => commands::lines(&client, &args),
        Command::App { args } => commands::app(&client, &args),
        Command::Unlock { .. } => commands::unlock(&client),
        Command::ResetScore { .. } => commands::reset_score(&client),
        Command::Check => commands::check(&client),
    }
}

fn verify_authorization(paths: &Paths, payload: &str) -> Result<()> {
    let signed = SignedCommand::parse(payload.as_bytes())
        .context("invalid signed command payload")?;
    let key = ManagementKey::load(&paths.management_key_file())
        .unwrap_or_else(|_| ManagementKey::absent());
    key.verify(&signed)
        .map_err(|e| anyhow::anyhow!("AUTHORIZATION DENIED: {e}"))
}
