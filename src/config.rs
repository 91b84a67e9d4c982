//! # Configuration Management
//!
//! This module handles the node's on-disk configuration:
//! - TOML-based configuration file
//! - Device identity and display name
//! - P2P timing and admission settings
//!
//! Everything lives in one directory, `~/.config/eremois-sync/` on Linux
//! unless `EREMOIS_SYNC_CONFIG_DIR` points elsewhere:
//!
//! ```text
//! config.toml    node settings
//! identity.key   Ed25519 device identity
//! keys.toml      symmetric keyring
//! data/          one JSON document per storage namespace
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::p2p::{
    P2PConfig, DEFAULT_DISCOVERY_INTERVAL, DEFAULT_MAX_PEERS, DEFAULT_SYNC_INTERVAL,
    DEFAULT_TIMEOUT,
};

/// Overrides the configuration directory. Used by tests and for running
/// several nodes on one machine.
pub const CONFIG_DIR_ENV: &str = "EREMOIS_SYNC_CONFIG_DIR";

const CONFIG_FILE: &str = "config.toml";

/// Node configuration.
///
/// Network options default when absent from the file, and a zero value also
/// means "use the default".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub device_id: String,
    pub device_name: String,
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_discovery_interval_ms() -> u64 {
    DEFAULT_DISCOVERY_INTERVAL.as_millis() as u64
}

fn default_sync_interval_ms() -> u64 {
    DEFAULT_SYNC_INTERVAL.as_millis() as u64
}

fn default_max_peers() -> usize {
    DEFAULT_MAX_PEERS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

impl Config {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            discovery_interval_ms: default_discovery_interval_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            max_peers: default_max_peers(),
            timeout_ms: default_timeout_ms(),
            base_dir,
        }
    }

    /// Create and save a fresh configuration in the default directory.
    pub async fn init(device_id: &str, device_name: &str) -> Result<Self> {
        Self::init_in(Self::config_dir()?, device_id, device_name).await
    }

    pub async fn init_in(base_dir: PathBuf, device_id: &str, device_name: &str) -> Result<Self> {
        tokio::fs::create_dir_all(&base_dir).await?;
        let config = Self::new(device_id, device_name, base_dir);
        config.save().await?;
        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        Self::load_from(Self::config_dir()?).await
    }

    pub async fn load_from(base_dir: PathBuf) -> Result<Self> {
        let config_file = base_dir.join(CONFIG_FILE);

        if !config_file.exists() {
            anyhow::bail!("eremois-sync not initialized. Run 'eremois-sync init' first.");
        }

        let content = tokio::fs::read_to_string(&config_file).await?;
        let mut config: Config = toml::from_str(&content)?;
        config.base_dir = base_dir;

        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(self.config_path(), content).await?;
        Ok(())
    }

    pub fn p2p_config(&self) -> P2PConfig {
        P2PConfig::from_millis(
            self.discovery_interval_ms,
            self.sync_interval_ms,
            self.max_peers,
            self.timeout_ms,
        )
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.base_dir.join("identity.key")
    }

    pub fn keyring_path(&self) -> PathBuf {
        self.base_dir.join("keys.toml")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    pub fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("eremois-sync");

        Ok(config_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("node");

        let config = Config::init_in(base.clone(), "abc123", "Laptop").await.unwrap();
        assert!(config.config_path().exists());

        let loaded = Config::load_from(base.clone()).await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.base_dir(), base.as_path());
    }

    #[tokio::test]
    async fn test_load_uninitialized_fails() {
        let temp_dir = TempDir::new().unwrap();
        let err = Config::load_from(temp_dir.path().to_path_buf()).await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn test_missing_network_fields_use_defaults() {
        let temp_dir = TempDir::new().unwrap();
        tokio::fs::write(
            temp_dir.path().join(CONFIG_FILE),
            "device_id = \"abc\"\ndevice_name = \"Phone\"\nmax_peers = 3\n",
        )
        .await
        .unwrap();

        let config = Config::load_from(temp_dir.path().to_path_buf()).await.unwrap();
        assert_eq!(config.max_peers, 3);
        assert_eq!(config.sync_interval_ms, 300_000);

        let p2p = config.p2p_config();
        assert_eq!(p2p.max_peers, 3);
        assert_eq!(p2p.discovery_interval, Duration::from_secs(30));
        assert_eq!(p2p.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_means_default() {
        let mut config = Config::new("abc", "Desk", PathBuf::from("/tmp/eremois"));
        config.sync_interval_ms = 0;
        config.max_peers = 0;
        config.timeout_ms = 250;

        let p2p = config.p2p_config();
        assert_eq!(p2p.sync_interval, DEFAULT_SYNC_INTERVAL);
        assert_eq!(p2p.max_peers, DEFAULT_MAX_PEERS);
        assert_eq!(p2p.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_config_paths() {
        let config = Config::new("abc", "Desk", PathBuf::from("/test"));

        assert_eq!(config.config_path(), Path::new("/test/config.toml"));
        assert_eq!(config.identity_path(), Path::new("/test/identity.key"));
        assert_eq!(config.keyring_path(), Path::new("/test/keys.toml"));
        assert_eq!(config.data_dir(), Path::new("/test/data"));
    }
}
