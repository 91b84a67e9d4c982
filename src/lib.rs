//! # eremois-sync
//!
//! Local-first, end-to-end encrypted peer-to-peer synchronization for tasks,
//! time blocks and learned working patterns.
//!
//! Every device keeps its full state locally. Devices exchange encrypted
//! full-state snapshots and merge them per entity with last-writer-wins on
//! `updatedAt`, so any set of devices that keeps syncing converges without a
//! server.
//!
//! ## Core Modules
//!
//! - [`model`] - Synced entities and operation records
//! - [`crypto`] - AES-256-GCM keyring, envelopes and device identity
//! - [`storage`] - Key-value storage adapter and typed namespaces
//! - [`sync`] - Merge algorithm and pending operation log
//! - [`transport`] - Transport trait and the in-process network
//! - [`p2p`] - Peer lifecycle, messaging and periodic loops
//! - [`node`] - Wiring between the sync and P2P layers
//! - [`config`] - Configuration file management
//! - [`cli`] - Command-line interface
//!
//! ## Quick Start
//!
//! ```bash
//! # Initialize this device
//! eremois-sync init --name "Laptop"
//!
//! # Share the key with another device
//! eremois-sync key export > key.json
//!
//! # Exchange state out of band
//! eremois-sync snapshot --out laptop.snapshot
//! eremois-sync apply phone.snapshot
//!
//! # Watch several devices converge
//! eremois-sync simulate --devices 4 --rounds 10
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod model;
pub mod node;
pub mod p2p;
pub mod storage;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use crypto::{EncryptedEnvelope, EncryptionManager, Identity};
pub use error::{Result, SyncError};
pub use node::SyncNode;
pub use p2p::{P2PConfig, P2PNetworkManager};
pub use sync::SyncManager;
