use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::utils::version;

#[derive(Parser)]
#[command(author, version = version(), about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
#[command(subcommand_value_name = "SUBCOMMAND")]
#[command(subcommand_help_heading = "Subcommands")]
pub struct Cli {
    /// Path to config file (default: bundled tunables, see `kbd_config::Config`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Override the control socket path instead of the runtime-directory default.
    #[arg(short, long)]
    pub socket: Option<PathBuf>,
    /// Run with mock device/tap/guest backends instead of the real macOS ones.
    #[arg(long)]
    pub mock: bool,

    #[command(subcommand)]
    pub subcommand: Option<Sub>,
}

#[derive(Subcommand)]
pub enum Sub {
    /// Validate the config file.
    Validate {
        /// Path to config file (default: bundled tunables).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Communicate with the running interposer daemon.
    Msg {
        #[command(subcommand)]
        msg: Msg,
        /// Format output as JSON.
        #[arg(short, long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum Msg {
    /// List enumerated keyboard devices.
    Devices,
    /// Run identity detection and print the resulting selection.
    DetectIdentity {
        /// Stop after observing this many distinct device keys.
        #[arg(long, default_value_t = 1)]
        stop_after: u32,
    },
    /// List hypervisor-managed guests.
    Guests,
    /// Print a running session's status.
    Status {
        /// Session id returned by `start-session`.
        id: u64,
    },
    /// Stop a running session.
    StopSession {
        /// Session id returned by `start-session`.
        id: u64,
    },
    /// Start a capture or relay session against selected devices.
    StartSession {
        /// Device key(s) to select, as printed by `devices` (vendor:product:location).
        #[arg(long = "device-key", required = true)]
        device_keys: Vec<String>,
        /// Hypervisor guest to relay keystrokes into; omit for capture-only.
        #[arg(long)]
        guest: Option<String>,
        /// Safety-timer duration in seconds; omit to run without one.
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Fetch a running session's captured keystroke log.
    CopyKeystrokeLog {
        /// Session id returned by `start-session`.
        id: u64,
    },
}
