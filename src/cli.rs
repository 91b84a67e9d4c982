//! # Command Line Interface
//!
//! This module provides the command-line interface for eremois-sync, including
//! argument parsing, command definitions, and command implementations.
//!
//! ## Commands
//!
//! - `init` - Create the configuration, device identity and first key
//! - `id` - Display this device's id
//! - `key` - List, rotate, export, import or select encryption keys
//! - `snapshot` - Write an encrypted snapshot of local state to a file
//! - `apply` - Merge an encrypted snapshot received out of band
//! - `pending` - Inspect or clear the pending operation log
//! - `status` - Show local state and network settings
//! - `simulate` - Run several in-process devices and watch them converge

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::crypto::{EncryptedEnvelope, EncryptionManager, Identity, Jwk};
use crate::model::{OperationDraft, SyncEntity, Task, TaskStatus};
use crate::node::SyncNode;
use crate::p2p::{P2PConfig, P2PNetworkManager};
use crate::storage::{FileStorage, MemoryStorage};
use crate::sync::SyncManager;
use crate::transport::MemoryNetwork;

/// Command-line interface structure for eremois-sync.
#[derive(Parser)]
#[command(name = "eremois-sync")]
#[command(about = "Local-first, end-to-end encrypted sync for tasks and time blocks")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the configuration, device identity and first encryption key
    Init {
        /// Human-readable name shown to other devices
        #[arg(short, long, default_value = "My device")]
        name: String,
    },

    /// Display this device's id
    Id,

    /// Manage encryption keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Write an encrypted snapshot of local state
    Snapshot {
        /// Output file; prints to stdout when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Merge an encrypted snapshot produced by another device
    Apply {
        /// Snapshot file written by `snapshot`
        file: PathBuf,
    },

    /// Inspect the pending operation log
    Pending {
        #[command(subcommand)]
        command: PendingCommands,
    },

    /// Show local state and network settings
    Status,

    /// Run several devices in-process and check that they converge
    Simulate {
        /// Number of devices
        #[arg(short, long, default_value_t = 3)]
        devices: usize,
        /// Number of edit-and-sync rounds
        #[arg(short, long, default_value_t = 5)]
        rounds: usize,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// List held keys
    List,
    /// Generate a new current key; old keys stay usable for decryption
    Rotate,
    /// Print a key as JWK (the current key by default)
    Export { key_id: Option<String> },
    /// Import a JWK file under the given key id
    Import {
        key_id: String,
        file: PathBuf,
        /// Also make the imported key current
        #[arg(long = "use")]
        make_current: bool,
    },
    /// Make a held key current
    Use { key_id: String },
}

#[derive(Subcommand)]
pub enum PendingCommands {
    /// List recorded operations not yet delivered
    List,
    /// Drop every pending operation
    Clear,
}

/// Everything a one-shot command needs to touch local state.
struct LocalNode {
    config: Config,
    keys: Arc<EncryptionManager>,
    sync: SyncManager,
}

impl LocalNode {
    async fn open() -> Result<Self> {
        let config = Config::load().await?;
        let keys = Arc::new(EncryptionManager::load(&config.keyring_path())?);
        let storage = FileStorage::new(config.data_dir()).await?;
        let sync =
            SyncManager::new(Arc::new(storage), keys.clone(), config.device_id.clone()).await?;

        Ok(Self { config, keys, sync })
    }

    fn save_keys(&self) -> Result<()> {
        self.keys.save(&self.config.keyring_path())?;
        Ok(())
    }
}

/// Create the configuration directory, identity, keyring and data store.
pub async fn init(name: String) -> Result<()> {
    info!("Initializing eremois-sync...");

    let config_dir = Config::config_dir()?;
    if config_dir.join("config.toml").exists() {
        anyhow::bail!("Already initialized at {}", config_dir.display());
    }

    let identity = Identity::load_or_generate(&config_dir.join("identity.key"))?;
    let config = Config::init_in(config_dir, &identity.device_id(), &name).await?;
    info!("Configuration initialized at: {}", config.config_path().display());

    let keys = EncryptionManager::load_or_generate(&config.keyring_path())?;
    FileStorage::new(config.data_dir()).await?;

    println!("{} eremois-sync initialized", "✅".green());
    println!("Device ID: {}", config.device_id.bold());
    println!("Device name: {}", config.device_name);
    if let Some(key_id) = keys.current_key_id() {
        println!("Encryption key: {}", key_id);
    }
    Ok(())
}

pub async fn show_id() -> Result<()> {
    let config = Config::load().await?;
    println!("{}", config.device_id);
    Ok(())
}

pub async fn key(command: KeyCommands) -> Result<()> {
    let node = LocalNode::open().await?;
    let keys = &node.keys;

    match command {
        KeyCommands::List => {
            let current = keys.current_key_id();
            let held = keys.keys();
            if held.is_empty() {
                println!("No keys held. Run 'eremois-sync key rotate' to create one.");
            }
            for key in held {
                let marker = if current.as_deref() == Some(key.id.as_str()) {
                    "*".green().bold()
                } else {
                    " ".normal()
                };
                println!(
                    "{} {}  created {}",
                    marker,
                    key.id,
                    key.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        KeyCommands::Rotate => {
            let key_id = keys.rotate_key();
            node.save_keys()?;
            println!("{} Now encrypting with {}", "🔑".yellow(), key_id);
        }
        KeyCommands::Export { key_id } => {
            let key_id = match key_id.or_else(|| keys.current_key_id()) {
                Some(id) => id,
                None => anyhow::bail!("No current key to export"),
            };
            let jwk = keys.export_key(&key_id)?;
            println!("{}", serde_json::to_string_pretty(&jwk)?);
            eprintln!("{}", format!("Key id: {}", key_id).dimmed());
        }
        KeyCommands::Import { key_id, file, make_current } => {
            let content = tokio::fs::read_to_string(&file).await?;
            let jwk: Jwk = serde_json::from_str(&content)?;
            keys.import_key(&key_id, &jwk)?;
            if make_current {
                keys.use_key(&key_id)?;
            }
            node.save_keys()?;
            println!("{} Imported key {}", "✅".green(), key_id);
        }
        KeyCommands::Use { key_id } => {
            keys.use_key(&key_id)?;
            node.save_keys()?;
            println!("{} Now encrypting with {}", "🔑".yellow(), key_id);
        }
    }
    Ok(())
}

pub async fn snapshot(out: Option<PathBuf>) -> Result<()> {
    let node = LocalNode::open().await?;
    let envelope = node.sync.prepare_data_for_sync().await?;
    let content = serde_json::to_string_pretty(&envelope)?;

    match out {
        Some(path) => {
            tokio::fs::write(&path, content).await?;
            println!("{} Snapshot written to {}", "✅".green(), path.display());
            println!("   Encrypted with key {}", envelope.key_id);
        }
        None => println!("{}", content),
    }
    Ok(())
}

pub async fn apply(file: PathBuf) -> Result<()> {
    let node = LocalNode::open().await?;
    let content = tokio::fs::read_to_string(&file).await?;
    let envelope: EncryptedEnvelope = serde_json::from_str(&content)?;

    if !node.keys.has_key(&envelope.key_id) {
        anyhow::bail!(
            "Snapshot is encrypted with key {} which this device does not hold. \
             Import it with 'eremois-sync key import'.",
            envelope.key_id
        );
    }

    let report = node.sync.process_sync_data(&envelope).await?;
    if report.is_empty() {
        println!("Already up to date.");
    } else {
        println!("{} Merged snapshot from {}", "✅".green(), file.display());
        println!("   Tasks taken: {}", report.tasks);
        println!("   Time blocks taken: {}", report.time_blocks);
        println!("   User pattern updated: {}", report.user_pattern);
    }
    Ok(())
}

pub async fn pending(command: PendingCommands) -> Result<()> {
    let node = LocalNode::open().await?;

    match command {
        PendingCommands::List => {
            let operations = node.sync.pending_operations().await;
            if operations.is_empty() {
                println!("No pending operations.");
            }
            for op in operations {
                println!(
                    "{:<7} {:<12} {}  (device {}, at {})",
                    format!("{:?}", op.op_type).to_lowercase(),
                    format!("{:?}", op.entity_type),
                    op.entity_id,
                    short_id(&op.metadata.device_id),
                    op.metadata.timestamp
                );
            }
        }
        PendingCommands::Clear => {
            let count = node.sync.pending_operations().await.len();
            node.sync.clear_pending_operations().await?;
            println!("Cleared {} pending operation(s).", count);
        }
    }
    Ok(())
}

pub async fn show_status() -> Result<()> {
    let node = LocalNode::open().await?;
    let snapshot = node.sync.snapshot().await?;
    let pending = node.sync.pending_operations().await;
    let p2p = node.config.p2p_config();

    println!("{}\n", "📋 Sync Status".bold());
    println!("  Device: {} ({})", node.config.device_name, short_id(&node.config.device_id));
    println!(
        "  Current key: {}",
        node.keys.current_key_id().unwrap_or_else(|| "none".to_string())
    );
    println!("  Keys held: {}", node.keys.keys().len());
    println!();
    println!("  Tasks: {}", snapshot.tasks.len());
    println!("  Time blocks: {}", snapshot.time_blocks.len());
    println!("  User pattern: {}", if snapshot.user_pattern.is_some() { "yes" } else { "no" });
    println!("  Pending operations: {}", pending.len());
    println!();
    println!("  Discovery every {:?}, sync every {:?}", p2p.discovery_interval, p2p.sync_interval);
    println!("  Max peers: {}, send timeout {:?}", p2p.max_peers, p2p.timeout);
    Ok(())
}

/// Spin up `devices` nodes on an in-process network sharing one key, let
/// each round edit random devices, then sync until every store matches.
pub async fn simulate(devices: usize, rounds: usize) -> Result<()> {
    if !(2..=crate::p2p::DEFAULT_MAX_PEERS).contains(&devices) {
        anyhow::bail!("--devices must be between 2 and {}", crate::p2p::DEFAULT_MAX_PEERS);
    }

    let network = MemoryNetwork::new();
    let shared = EncryptionManager::with_new_key();
    let key_id = shared
        .current_key_id()
        .ok_or_else(|| anyhow::anyhow!("fresh keyring has no key"))?;
    let jwk = shared.export_key(&key_id)?;

    let mut nodes = Vec::with_capacity(devices);
    for _ in 0..devices {
        let device_id = Identity::generate().device_id();
        let keys = Arc::new(EncryptionManager::new());
        keys.import_key(&key_id, &jwk)?;
        keys.use_key(&key_id)?;

        let (transport, inbox) = network.join(&device_id, &short_id(&device_id));
        let sync = SyncManager::new(Arc::new(MemoryStorage::new()), keys, device_id.clone()).await?;
        let manager = P2PNetworkManager::new(device_id, P2PConfig::default(), Arc::new(transport));
        let node = SyncNode::new(Arc::new(sync), manager);
        node.network().listen(inbox);
        nodes.push(node);
    }

    for node in &nodes {
        node.discover().await?;
    }
    println!("{} {} devices connected\n", "🌐".blue(), devices);

    // One task everybody fights over, to exercise last-writer-wins
    let mut contested = Task::new("Plan the week");
    nodes[0]
        .record_and_broadcast(OperationDraft::create(SyncEntity::Task(contested.clone())))
        .await?;

    for round in 1..=rounds {
        let editors: Vec<usize> = {
            let mut rng = rand::thread_rng();
            (0..devices).filter(|_| rng.gen_bool(0.5)).collect()
        };

        for &index in &editors {
            let node = &nodes[index];
            let author = short_id(node.device_id());
            let task = Task::new(format!("Round {} task from {}", round, author));
            node.record_and_broadcast(OperationDraft::create(SyncEntity::Task(task))).await?;

            contested.title = format!(
                "Plan the week (edited by {} in round {})",
                short_id(node.device_id()),
                round
            );
            contested.status = TaskStatus::InProgress;
            contested.updated_at = chrono::Utc::now();
            node.record_and_broadcast(OperationDraft::update(SyncEntity::Task(contested.clone())))
                .await?;
        }

        for node in &nodes {
            node.sync_now().await?;
        }

        let converged = wait_for_convergence(&nodes, Duration::from_secs(2)).await?;
        let status = if converged { "converged".green() } else { "diverged".red() };
        println!(
            "Round {:>2}: {} editor(s), {}",
            round,
            editors.len(),
            status
        );
    }

    let final_state = nodes[0].sync().snapshot().await?;
    let winner = final_state
        .tasks
        .iter()
        .find(|task| task.id == contested.id)
        .map(|task| task.title.clone())
        .unwrap_or_default();

    println!();
    println!("{}", "Final state".bold());
    println!("  Tasks on every device: {}", final_state.tasks.len());
    println!("  Contested task: {}", winner);
    for node in &nodes {
        let stats = node.network().stats();
        println!(
            "  {}  peers {}  sent {} B  received {} B  handler errors {} ({} rejected)",
            short_id(node.device_id()),
            stats.connected_peers,
            stats.bytes_transferred,
            stats.bytes_received,
            stats.handler_errors,
            stats.integrity_failures
        );
    }

    for node in &nodes {
        node.stop().await;
    }
    Ok(())
}

async fn wait_for_convergence(nodes: &[SyncNode], limit: Duration) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let mut states = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut snapshot = node.sync().snapshot().await?;
            snapshot.tasks.sort_by(|a, b| a.id.cmp(&b.id));
            states.push(snapshot);
        }
        if states.windows(2).all(|pair| pair[0] == pair[1]) {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}
