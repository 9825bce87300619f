//! TOML configuration with per-field defaults.
//!
//! A missing or malformed config file is not fatal: the built-in defaults
//! are used and a warning is logged.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Bulk reconciliation mode for the mirror side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory watched for changes.
    pub monitor_dir: PathBuf,
    /// Address the notification listener binds to.
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            monitor_dir: PathBuf::from("./source"),
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address of the notification server.
    pub server_addr: String,
    pub port: u16,
    /// Source-side root the server monitors. Incoming event paths and bulk
    /// enumeration are both expressed relative to this root.
    pub source_root: PathBuf,
    /// Local mirror root.
    pub target_dir: PathBuf,
    pub sync_mode: SyncMode,
    /// Concurrency level of the bulk-copy worker pool.
    pub max_workers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            port: 8080,
            source_root: PathBuf::from("./source"),
            target_dir: PathBuf::from("./target"),
            sync_mode: SyncMode::Incremental,
            max_workers: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Load from a TOML file, falling back to defaults when the file is
    /// absent or unparseable.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "config file {} not readable ({e}), using defaults",
                    path.display()
                );
                return Self::default();
            }
        };

        match toml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "config file {} is malformed ({e}), using defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let config = Config::load(Path::new("/nonexistent/dsync.toml"));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.client.max_workers, 5);
        assert_eq!(config.client.sync_mode, SyncMode::Incremental);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            sync_mode = "full"
            target_dir = "/mnt/mirror"
            "#,
        )
        .unwrap();

        assert_eq!(config.client.sync_mode, SyncMode::Full);
        assert_eq!(config.client.target_dir, PathBuf::from("/mnt/mirror"));
        assert_eq!(config.client.max_workers, 5);
        assert_eq!(config.server.bind_addr, "0.0.0.0");
    }

    #[test]
    fn malformed_file_falls_back() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "this is not toml [[[").unwrap();
        let config = Config::load(tmp.path());
        assert_eq!(config.client.server_addr, "127.0.0.1");
    }
}
