//! Tunables for the keyboard interposer engine.
//!
//! Parsed from a small KDL document, the same format and decoding crate the
//! teacher compositor uses for its own (much larger) configuration. Unlike
//! the teacher, this config has no `include` mechanism — a session runs with
//! one file, loaded once at daemon startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::{Context, IntoDiagnostic};

mod error;

pub use error::ConfigError;

/// Top-level configuration document.
#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Config {
    /// How long a captured-but-unreleased key may go without a fresh HID
    /// down before the Correlator considers it stale (§4.F `HOLD_TTL`).
    #[knuffel(child, unwrap(argument), default = 10_000)]
    pub hold_ttl_ms: u64,

    /// Window after a HID down in which a host down is accepted as the same
    /// keypress (§4.F `INITIAL_WINDOW`).
    #[knuffel(child, unwrap(argument), default = 80)]
    pub initial_window_ms: u64,

    /// How often the correlator janitor sweeps `last_hid_down`/`last_hid_up`.
    #[knuffel(child, unwrap(argument), default = 5_000)]
    pub janitor_interval_ms: u64,

    /// Entries older than this are pruned by the janitor.
    #[knuffel(child, unwrap(argument), default = 30_000)]
    pub janitor_max_age_ms: u64,

    /// Hard cap on the size of each correlator map.
    #[knuffel(child, unwrap(argument), default = 50)]
    pub janitor_cap: usize,

    /// Maximum number of in-flight hypervisor controller invocations.
    #[knuffel(child, unwrap(argument), default = 2)]
    pub guest_max_in_flight: usize,

    /// Path to the hypervisor controller executable.
    #[knuffel(child, unwrap(argument), default = String::from("vmctl"))]
    pub controller_path: String,

    /// Override for the operator control socket path. When absent, the
    /// socket is placed in the runtime directory (see `kbd_proto::socket`).
    #[knuffel(child, unwrap(argument), default)]
    pub socket_path: Option<String>,
}

impl Config {
    /// Loads and parses a config file from disk.
    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let config = Self::parse(
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("config.kdl"),
            &contents,
        )
        .context("error parsing config")?;

        tracing::debug!("loaded config from {path:?}");
        Ok(config)
    }

    /// Parses a config document from an in-memory string.
    pub fn parse(filename: &str, text: &str) -> Result<Self, ConfigError> {
        knuffel::parse(filename, text).map_err(ConfigError::from)
    }

    pub fn hold_ttl(&self) -> Duration {
        Duration::from_millis(self.hold_ttl_ms)
    }

    pub fn initial_window(&self) -> Duration {
        Duration::from_millis(self.initial_window_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }

    pub fn janitor_max_age(&self) -> Duration {
        Duration::from_millis(self.janitor_max_age_ms)
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket_path.as_ref().map(PathBuf::from)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::parse("default-config.kdl", include_str!("../resources/default-config.kdl"))
            .expect("bundled default config must parse")
    }
}
