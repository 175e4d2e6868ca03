//! Daemon configuration: optional TOML file, overridden by CLI flags

use crate::cli::DaemonOpts;
use crate::error::{DeployError, Result};
use crate::protocol::timeouts::PROGRESS_TICK_MS;
use crate::server::ServerOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "localhost:8081";
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub listen_addr: String,
    pub rate_limit_ms: u64,
    pub strict_size: bool,
    pub max_archive_bytes: u64,
    pub log_file: Option<PathBuf>,
    pub journal: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            rate_limit_ms: PROGRESS_TICK_MS,
            strict_size: false,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            log_file: None,
            journal: None,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| DeployError::io(path, e))?;
        Self::from_toml(&data).map_err(|e| {
            DeployError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    pub fn from_toml(data: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(data)
    }

    /// File values (if `--config` is given) with CLI flags layered on top
    pub fn from_opts(opts: &DaemonOpts) -> Result<Self> {
        let mut config = match opts.config {
            Some(ref path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(ref addr) = opts.listen_addr {
            config.listen_addr = addr.clone();
        }
        if let Some(ms) = opts.rate_limit_ms {
            config.rate_limit_ms = ms;
        }
        if opts.strict_size {
            config.strict_size = true;
        }
        if let Some(ref p) = opts.log_file {
            config.log_file = Some(p.clone());
        }
        if let Some(ref p) = opts.journal {
            config.journal = Some(p.clone());
        }
        Ok(config)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            rate_limit: Duration::from_millis(self.rate_limit_ms),
            strict_size: self.strict_size,
            max_archive_bytes: self.max_archive_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn default_values() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_addr, "localhost:8081");
        assert_eq!(config.rate_limit_ms, 200);
        assert!(!config.strict_size);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = DaemonConfig::from_toml("listen_addr = \"0.0.0.0:9000\"\nstrict_size = true\n").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert!(config.strict_size);
        assert_eq!(config.rate_limit_ms, 200);
        assert_eq!(config.max_archive_bytes, DEFAULT_MAX_ARCHIVE_BYTES);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DaemonConfig::from_toml("listen = \"x\"").is_err());
    }

    #[test]
    fn cli_overrides_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rdeployd.toml");
        std::fs::write(&path, "listen_addr = \"0.0.0.0:9000\"\nrate_limit_ms = 50\n").unwrap();

        let opts = DaemonOpts::parse_from([
            "rdeployd",
            "--config",
            path.to_str().unwrap(),
            "--listen-addr",
            "127.0.0.1:7000",
            "--journal",
            "/var/log/rdeploy.jsonl",
        ]);
        let config = DaemonConfig::from_opts(&opts).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.rate_limit_ms, 50);
        assert_eq!(config.journal, Some(PathBuf::from("/var/log/rdeploy.jsonl")));

        let options = config.server_options();
        assert_eq!(options.rate_limit, Duration::from_millis(50));
    }

    #[test]
    fn missing_config_file_is_io_error() {
        let opts = DaemonOpts::parse_from(["rdeployd", "--config", "/nonexistent/rdeployd.toml"]);
        assert!(matches!(DaemonConfig::from_opts(&opts), Err(DeployError::Io { .. })));
    }
}
