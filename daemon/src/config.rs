//! Daemon configuration
//!
//! Loaded from an optional JSON file, then overridden by command-line flags.
//!
//! ```json
//! {
//!   "listen": ["unix:path=/run/bus/socket", "unix:abstract=bus"],
//!   "credential_timeout_ms": 5000,
//!   "log_filter": "bus_transport=debug,info",
//!   "allow_uids": [1000]
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use bus_transport::TransportConfig;
use serde::{Deserialize, Serialize};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub const DEFAULT_LISTEN: &str = "unix:abstract=bus-daemon";

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const DEFAULT_LISTEN: &str = "unix:path=/tmp/bus-daemon.sock";

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidArg(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config read error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::InvalidArg(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listen specs, one transport each
    pub listen: Vec<String>,
    pub credential_timeout_ms: u64,
    /// env_logger filter used when RUST_LOG is unset
    pub log_filter: Option<String>,
    /// Users admitted by the EXTERNAL check; empty means the daemon's own
    /// user and root
    pub allow_uids: Vec<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            listen: Vec::new(),
            credential_timeout_ms: TransportConfig::default().credential_timeout_ms,
            log_filter: None,
            allow_uids: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the effective config: `--config` file (if any), then flags.
    ///
    /// `--listen` replaces the file's listen list when given at least once.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = match parse_arg(args, "--config") {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };

        let listen = parse_all_args(args, "--listen");
        if !listen.is_empty() {
            config.listen = listen;
        }

        if let Some(ms) = parse_arg(args, "--cred-timeout-ms") {
            config.credential_timeout_ms = ms
                .parse()
                .map_err(|_| ConfigError::InvalidArg(format!("--cred-timeout-ms {}", ms)))?;
        }

        if config.listen.is_empty() {
            config.listen.push(DEFAULT_LISTEN.to_string());
        }
        Ok(config)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            credential_timeout_ms: self.credential_timeout_ms,
        }
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

/// Parse a command line argument value (first occurrence)
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Values of every occurrence of a repeatable flag
fn parse_all_args(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("bus-daemon")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults_without_args() {
        let config = DaemonConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config.listen, vec![DEFAULT_LISTEN.to_string()]);
        assert_eq!(config.credential_timeout_ms, 5000);
        assert_eq!(config.log_filter(), "info");
        assert!(config.allow_uids.is_empty());
    }

    #[test]
    fn test_repeated_listen_flags() {
        let config = DaemonConfig::from_args(&args(&[
            "--listen",
            "unix:path=/tmp/a",
            "--cred-timeout-ms",
            "250",
            "--listen",
            "unix:abstract=b",
        ]))
        .unwrap();
        assert_eq!(config.listen, vec!["unix:path=/tmp/a", "unix:abstract=b"]);
        assert_eq!(config.transport().credential_timeout_ms, 250);
    }

    #[test]
    fn test_bad_timeout_flag() {
        assert!(matches!(
            DaemonConfig::from_args(&args(&["--cred-timeout-ms", "soon"])),
            Err(ConfigError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            DaemonConfig::from_json(r#"{"allow_uids": [0, 1000], "log_filter": "debug"}"#)
                .unwrap();
        assert_eq!(config.allow_uids, vec![0, 1000]);
        assert_eq!(config.log_filter(), "debug");
        assert_eq!(config.credential_timeout_ms, 5000);
        assert!(config.listen.is_empty());
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(matches!(
            DaemonConfig::from_json("{\"listen\": 3}"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_file_then_flag_override() {
        let path = std::env::temp_dir().join(format!("bus-daemon-cfg-{}.json", std::process::id()));
        fs::write(
            &path,
            r#"{"listen": ["unix:path=/tmp/from-file"], "credential_timeout_ms": 100}"#,
        )
        .unwrap();

        let path_str = path.to_str().unwrap();
        let from_file = DaemonConfig::from_args(&args(&["--config", path_str])).unwrap();
        assert_eq!(from_file.listen, vec!["unix:path=/tmp/from-file"]);
        assert_eq!(from_file.credential_timeout_ms, 100);

        let overridden = DaemonConfig::from_args(&args(&[
            "--config",
            path_str,
            "--listen",
            "unix:path=/tmp/from-flag",
        ]))
        .unwrap();
        assert_eq!(overridden.listen, vec!["unix:path=/tmp/from-flag"]);
        assert_eq!(overridden.credential_timeout_ms, 100);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_config_file() {
        assert!(matches!(
            DaemonConfig::from_args(&args(&["--config", "/nonexistent/bus.json"])),
            Err(ConfigError::Io(_))
        ));
    }
}
