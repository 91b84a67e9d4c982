//! Integration tests for configuration management
//!
//! These tests point the configuration directory at a temp dir through the
//! environment, so they run serially.

use eremois_sync::config::{Config, CONFIG_DIR_ENV};
use serial_test::serial;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
#[serial]
async fn test_config_creation_and_loading() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());

    assert_eq!(Config::config_dir().unwrap(), temp_dir.path());
    assert!(Config::load().await.is_err());

    let config = Config::init("device-1", "Laptop").await.unwrap();
    let loaded = Config::load().await.unwrap();
    assert_eq!(config, loaded);
    assert_eq!(loaded.config_path(), temp_dir.path().join("config.toml"));

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_config_edits_survive_reload() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());

    let mut config = Config::init("device-2", "Phone").await.unwrap();
    config.sync_interval_ms = 60_000;
    config.max_peers = 4;
    config.save().await.unwrap();

    let p2p = Config::load().await.unwrap().p2p_config();
    assert_eq!(p2p.sync_interval, Duration::from_secs(60));
    assert_eq!(p2p.max_peers, 4);
    assert_eq!(p2p.discovery_interval, Duration::from_secs(30));

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_key_and_identity_files_live_in_config_dir() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());

    let config = Config::init("device-3", "Tablet").await.unwrap();
    let identity = eremois_sync::Identity::load_or_generate(&config.identity_path()).unwrap();
    let keys = eremois_sync::EncryptionManager::load_or_generate(&config.keyring_path()).unwrap();

    assert!(config.identity_path().starts_with(temp_dir.path()));
    assert!(config.keyring_path().exists());
    assert_eq!(identity.device_id().len(), 64);
    assert!(keys.current_key_id().is_some());

    std::env::remove_var(CONFIG_DIR_ENV);
}
