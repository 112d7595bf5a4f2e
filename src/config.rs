//! Daemon configuration.
//!
//! Loaded from a TOML file with environment-variable overrides, plus a
//! handful of `clap` flags for the three values an operator is likely to
//! override on the command line (bind address, database path, log level).
//! Argument parsing beyond that is explicitly out of scope.

use crate::domain_types::PortNumber;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP bind address, e.g. `0.0.0.0:6677`.
    pub bind: String,
    /// Path to the embedded `SQLite` database file.
    pub db_path: PathBuf,
    /// `RUST_LOG`-style directive used when `RUST_LOG` itself is unset.
    pub log_level: String,
    /// System bus well-known name of the modem manager daemon.
    pub modem_bus_name: String,
    /// Object path of the modem to control, e.g. `/modem0`.
    pub modem_object_path: String,
    /// Persistent USB mode file.
    pub usb_mode_path: PathBuf,
    /// Transient USB mode file; wins over `usb_mode_path` when present.
    pub usb_mode_tmp_path: PathBuf,
    /// Rathole log file path.
    pub rathole_log_path: PathBuf,
    /// Rathole pid file path.
    pub rathole_pid_path: PathBuf,
    /// Rathole generated client config path.
    pub rathole_config_path: PathBuf,
    /// Path to the `rathole` binary.
    pub rathole_binary_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:6677".to_string(),
            db_path: PathBuf::from("6677.db"),
            log_level: "cirrusd=info".to_string(),
            modem_bus_name: "org.ofono".to_string(),
            modem_object_path: "/modem0".to_string(),
            usb_mode_path: PathBuf::from("/mnt/data/mode.cfg"),
            usb_mode_tmp_path: PathBuf::from("/mnt/data/mode_tmp.cfg"),
            rathole_log_path: PathBuf::from("/tmp/rathole.log"),
            rathole_pid_path: PathBuf::from("/tmp/rathole.pid"),
            rathole_config_path: PathBuf::from("/tmp/rathole-client.toml"),
            rathole_binary_path: PathBuf::from("/usr/bin/rathole"),
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then an optional TOML file, then CLI
    /// flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured file path exists but cannot be
    /// parsed as TOML.
    pub fn load(flags: &CliFlags) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = &flags.config {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            Self::default()
        };

        if let Some(bind) = &flags.bind {
            config.bind = bind.clone();
        }
        if let Some(db) = &flags.db {
            config.db_path = db.clone();
        }
        if let Some(level) = &flags.log_level {
            config.log_level = level.clone();
        }

        Ok(config)
    }

    /// The HTTP port, parsed out of `bind`, for display purposes.
    #[must_use]
    pub fn port(&self) -> Option<PortNumber> {
        self.bind
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .and_then(|p| PortNumber::try_new(p).ok())
    }
}

/// Command-line flags accepted by `cirrusd`.
#[derive(Parser, Debug, Default)]
#[command(name = "cirrusd", about = "Connectivity and tunneling supervisor")]
pub struct CliFlags {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the HTTP bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Override the database file path.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Override the log level directive.
    #[arg(long)]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_documented_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.bind, "0.0.0.0:6677");
        assert_eq!(config.db_path, PathBuf::from("6677.db"));
        assert_eq!(config.usb_mode_path, PathBuf::from("/mnt/data/mode.cfg"));
    }

    #[test]
    fn port_parses_from_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.port().unwrap().as_u16(), 6677);
    }

    #[test]
    fn cli_overrides_take_effect() {
        let flags = CliFlags {
            bind: Some("127.0.0.1:9000".to_string()),
            ..Default::default()
        };
        let config = AppConfig::load(&flags).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000");
    }
}
