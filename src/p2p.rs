//! # P2P Networking Module
//!
//! Peer lifecycle and message transport, with no knowledge of what the
//! payloads mean. Interpretation is delegated to handlers registered per
//! message type (see [`SyncNode`](crate::node::SyncNode)).
//!
//! ## Features
//!
//! - **Peer Table**: each peer moves `Unknown → Discovered → Connected →
//!   Disconnected`, and may be rediscovered later
//! - **Admission Control**: at most `max_peers` connected peers; extra
//!   connection attempts are refused softly and retried by discovery
//! - **Periodic Loops**: discovery and sync ticks run as supervised tasks, a
//!   failed or panicking tick is logged and the loop keeps going
//! - **Non-reentrant Sync**: overlapping sync ticks collapse into a no-op
//! - **Broadcast**: fans out to every connected peer concurrently and collects
//!   every result
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use eremois_sync::p2p::{MessageType, P2PConfig, P2PNetworkManager};
//! use eremois_sync::transport::MemoryNetwork;
//! use std::sync::Arc;
//!
//! async fn run() -> eremois_sync::error::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let (transport, inbox) = network.join("device-a", "Laptop");
//!
//!     let manager = P2PNetworkManager::new("device-a", P2PConfig::default(), Arc::new(transport));
//!     manager.on_message(MessageType::PeerAnnouncement, |message| async move {
//!         println!("{} is around", message.sender_id);
//!         Ok(())
//!     });
//!     manager.listen(inbox);
//!     manager.start();
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::crypto::EncryptedEnvelope;
use crate::error::{Result, SyncError};
use crate::model::SyncPeer;
use crate::transport::{Inbox, Transport};

pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_PEERS: usize = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2PConfig {
    pub discovery_interval: Duration,
    pub sync_interval: Duration,
    pub max_peers: usize,
    /// Applied to every transport send.
    pub timeout: Duration,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            max_peers: DEFAULT_MAX_PEERS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl P2PConfig {
    /// Build from raw option values; zero means "use the default".
    pub fn from_millis(discovery_ms: u64, sync_ms: u64, max_peers: usize, timeout_ms: u64) -> Self {
        let or_default = |ms: u64, default: Duration| {
            if ms == 0 {
                default
            } else {
                Duration::from_millis(ms)
            }
        };

        Self {
            discovery_interval: or_default(discovery_ms, DEFAULT_DISCOVERY_INTERVAL),
            sync_interval: or_default(sync_ms, DEFAULT_SYNC_INTERVAL),
            max_peers: if max_peers == 0 { DEFAULT_MAX_PEERS } else { max_peers },
            timeout: or_default(timeout_ms, DEFAULT_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    SyncRequest,
    SyncResponse,
    PeerDiscovery,
    PeerAnnouncement,
}

/// Wire message. Any transport carries this JSON shape unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2PMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EncryptedEnvelope>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl P2PMessage {
    pub fn new(message_type: MessageType, sender_id: impl Into<String>) -> Self {
        Self {
            message_type,
            sender_id: sender_id.into(),
            data: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_data(mut self, data: EncryptedEnvelope) -> Self {
        self.data = Some(data);
        self
    }
}

/// Ephemeral counters, reset with the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub connected_peers: usize,
    pub bytes_transferred: u64,
    pub bytes_received: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub active_sync_count: usize,
    pub failed_sync_count: u64,
    pub handler_errors: u64,
    /// Handler failures caused by payloads that could not be opened or trusted.
    pub integrity_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown,
    Discovered,
    Connected,
    Disconnected,
}

/// Outcome of a fan-out send.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, SyncError)>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

pub type MessageHandler = Arc<dyn Fn(P2PMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct PeerRecord {
    peer: SyncPeer,
    state: PeerState,
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<String, PeerRecord>,
    stats: NetworkStats,
}

impl NetworkState {
    fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|record| record.state == PeerState::Connected)
            .count()
    }

    fn refresh_connected(&mut self) {
        self.stats.connected_peers = self.connected_count();
    }
}

struct Loops {
    shutdown: watch::Sender<bool>,
    _handles: Vec<JoinHandle<()>>,
}

struct Inner {
    local_id: String,
    config: P2PConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<NetworkState>,
    handlers: RwLock<HashMap<MessageType, MessageHandler>>,
    loops: Mutex<Option<Loops>>,
    listener: Mutex<Option<watch::Sender<bool>>>,
}

/// Owns the peer table and drives discovery and sync ticks.
///
/// Cheap to clone; all clones share one peer table.
#[derive(Clone)]
pub struct P2PNetworkManager {
    inner: Arc<Inner>,
}

/// Non-owning handle, for handlers that need to reply without keeping the
/// manager alive.
#[derive(Clone)]
pub struct WeakNetworkManager {
    inner: Weak<Inner>,
}

impl WeakNetworkManager {
    pub fn upgrade(&self) -> Option<P2PNetworkManager> {
        self.inner.upgrade().map(|inner| P2PNetworkManager { inner })
    }
}

/// Decrements `active_sync_count` however the sync round ends.
struct SyncGate {
    inner: Arc<Inner>,
}

impl Drop for SyncGate {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.stats.active_sync_count = state.stats.active_sync_count.saturating_sub(1);
    }
}

impl P2PNetworkManager {
    pub fn new(
        local_id: impl Into<String>,
        config: P2PConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_id: local_id.into(),
                config,
                transport,
                state: Mutex::new(NetworkState::default()),
                handlers: RwLock::new(HashMap::new()),
                loops: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakNetworkManager {
        WeakNetworkManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn config(&self) -> &P2PConfig {
        &self.inner.config
    }

    /// Start the discovery and sync loops. Calling it again while running
    /// does nothing.
    pub fn start(&self) {
        let mut loops = self.inner.loops.lock();
        if loops.is_some() {
            debug!("P2P loops already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = &self.inner.config;

        // Loops hold weak handles so dropping every manager clone ends them
        let discovery = {
            let weak = self.downgrade();
            spawn_periodic("discovery", config.discovery_interval, shutdown_rx.clone(), move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(manager) => manager.discover_peers().await,
                        None => Ok(()),
                    }
                }
            })
        };
        let sync = {
            let weak = self.downgrade();
            spawn_periodic("sync", config.sync_interval, shutdown_rx, move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(manager) => manager.sync_with_peers().await.map(|_| ()),
                        None => Ok(()),
                    }
                }
            })
        };

        *loops = Some(Loops {
            shutdown,
            _handles: vec![discovery, sync],
        });
        info!(
            "P2P network started for {} (discovery every {:?}, sync every {:?})",
            self.inner.local_id, config.discovery_interval, config.sync_interval
        );
    }

    pub fn is_running(&self) -> bool {
        self.inner.loops.lock().is_some()
    }

    /// Stop both loops and the inbound listener, then disconnect every peer.
    ///
    /// Ticks already in flight run to completion. Safe to call repeatedly.
    pub async fn stop(&self) {
        let loops = self.inner.loops.lock().take();
        if let Some(loops) = loops {
            let _ = loops.shutdown.send(true);
            info!("P2P network stopping for {}", self.inner.local_id);
        }
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.send(true);
        }
        self.disconnect_from_all_peers().await;
    }

    /// Feed inbound frames from a transport into [`handle_incoming`](Self::handle_incoming).
    pub fn listen(&self, mut inbox: Inbox) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        if let Some(previous) = self.inner.listener.lock().replace(stop_tx) {
            let _ = previous.send(true);
        }

        let weak = self.downgrade();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = inbox.recv() => frame,
                    _ = stop_rx.changed() => None,
                };
                let Some(frame) = frame else { break };
                let Some(manager) = weak.upgrade() else { break };
                manager.handle_incoming(&frame).await;
            }
            debug!("Inbound listener stopped");
        });
    }

    /// Register the handler for one message type, replacing any previous one.
    pub fn on_message<F, Fut>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(P2PMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |message| handler(message).boxed());
        self.inner.handlers.write().insert(message_type, handler);
    }

    /// Admit a peer. Returns `false` when the peer limit is reached or the
    /// transport cannot reach it; discovery retries later.
    pub async fn connect_to_peer(&self, peer: SyncPeer) -> bool {
        let peer_id = peer.id.clone();
        match self.try_connect_to_peer(peer).await {
            Ok(()) => true,
            Err(SyncError::PeerLimitReached { max }) => {
                debug!("Not connecting to {}: peer limit {} reached", peer_id, max);
                false
            }
            Err(e) => {
                warn!("Failed to connect to peer {}: {}", peer_id, e);
                false
            }
        }
    }

    pub async fn try_connect_to_peer(&self, peer: SyncPeer) -> Result<()> {
        if peer.id == self.inner.local_id {
            return Err(SyncError::Transport("refusing to connect to self".to_string()));
        }

        let max = self.inner.config.max_peers;
        {
            let mut state = self.inner.state.lock();
            if let Some(record) = state.peers.get_mut(&peer.id) {
                if record.state == PeerState::Connected {
                    record.peer.last_seen = Utc::now();
                    return Ok(());
                }
            }
            if state.connected_count() >= max {
                return Err(SyncError::PeerLimitReached { max });
            }
        }

        self.with_timeout("connect", self.inner.transport.connect(&peer)).await?;

        let admitted = {
            let mut state = self.inner.state.lock();
            let already = state
                .peers
                .get(&peer.id)
                .is_some_and(|record| record.state == PeerState::Connected);
            // Another connect may have filled the table while we were waiting
            if !already && state.connected_count() >= max {
                false
            } else {
                let mut peer = peer.clone();
                peer.last_seen = Utc::now();
                state.peers.insert(
                    peer.id.clone(),
                    PeerRecord {
                        peer,
                        state: PeerState::Connected,
                    },
                );
                state.refresh_connected();
                true
            }
        };

        if !admitted {
            let _ = self.inner.transport.disconnect(&peer.id).await;
            return Err(SyncError::PeerLimitReached { max });
        }

        info!("Connected to peer {} ({})", peer.id, peer.display_name);
        Ok(())
    }

    pub async fn disconnect_from_peer(&self, peer_id: &str) {
        let was_connected = {
            let mut state = self.inner.state.lock();
            let was_connected = match state.peers.get_mut(peer_id) {
                Some(record) if record.state == PeerState::Connected => {
                    record.state = PeerState::Disconnected;
                    true
                }
                _ => false,
            };
            state.refresh_connected();
            was_connected
        };

        if was_connected {
            if let Err(e) = self.inner.transport.disconnect(peer_id).await {
                warn!("Transport error while disconnecting {}: {}", peer_id, e);
            }
            info!("Disconnected from peer {}", peer_id);
        }
    }

    async fn disconnect_from_all_peers(&self) {
        for peer in self.peers() {
            self.disconnect_from_peer(&peer.id).await;
        }
    }

    pub async fn send_message(&self, peer_id: &str, message: &P2PMessage) -> Result<()> {
        let connected = self
            .inner
            .state
            .lock()
            .peers
            .get(peer_id)
            .is_some_and(|record| record.state == PeerState::Connected);
        if !connected {
            return Err(SyncError::PeerNotFound(peer_id.to_string()));
        }

        let frame = serde_json::to_vec(message)?;
        let size = frame.len() as u64;
        self.with_timeout("send", self.inner.transport.send(peer_id, frame)).await?;

        self.inner.state.lock().stats.bytes_transferred += size;
        debug!("Sent {:?} to {} ({} bytes)", message.message_type, peer_id, size);
        Ok(())
    }

    /// Send to every connected peer concurrently. One failure never stops
    /// delivery to the others.
    pub async fn broadcast_message(&self, message: &P2PMessage) -> BroadcastReport {
        let peer_ids: Vec<String> = self.peers().into_iter().map(|peer| peer.id).collect();
        let sends = peer_ids.iter().map(|peer_id| self.send_message(peer_id, message));
        let results = join_all(sends).await;

        let mut report = BroadcastReport::default();
        for (peer_id, result) in peer_ids.into_iter().zip(results) {
            match result {
                Ok(()) => report.delivered.push(peer_id),
                Err(e) => {
                    warn!("Failed to send {:?} to {}: {}", message.message_type, peer_id, e);
                    report.failed.push((peer_id, e));
                }
            }
        }
        report
    }

    /// Decode one inbound frame and dispatch it. Malformed frames are dropped.
    pub async fn handle_incoming(&self, frame: &[u8]) {
        let message: P2PMessage = match serde_json::from_slice(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame ({} bytes): {}", frame.len(), e);
                return;
            }
        };

        {
            let mut state = self.inner.state.lock();
            state.stats.bytes_received += frame.len() as u64;
            if let Some(record) = state.peers.get_mut(&message.sender_id) {
                record.peer.last_seen = Utc::now();
            }
        }

        self.dispatch(message).await;
    }

    /// Run the registered handler. Errors and panics are logged and counted,
    /// never propagated.
    pub async fn dispatch(&self, message: P2PMessage) {
        let message_type = message.message_type;
        let handler = self.inner.handlers.read().get(&message_type).cloned();
        let Some(handler) = handler else {
            debug!("No handler registered for {:?}", message_type);
            return;
        };

        let sender = message.sender_id.clone();
        // The handler itself is called inside the task so an eager panic is contained too
        let outcome = tokio::spawn(async move { handler(message).await }).await;

        let mut integrity = false;
        match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) if e.is_integrity_failure() => {
                warn!("Rejected {:?} from {}: {}", message_type, sender, e);
                integrity = true;
            }
            Ok(Err(e)) if e.is_transient() => {
                debug!("Transient failure handling {:?} from {}: {}", message_type, sender, e);
            }
            Ok(Err(e)) => warn!("Error handling {:?} from {}: {}", message_type, sender, e),
            Err(e) => error!("Handler for {:?} panicked: {}", message_type, e),
        }

        let mut state = self.inner.state.lock();
        state.stats.handler_errors += 1;
        if integrity {
            state.stats.integrity_failures += 1;
        }
    }

    /// One discovery tick: learn candidates from the transport, admit what
    /// fits, then announce ourselves.
    ///
    /// Records of peers that are not connected and no longer discoverable
    /// are dropped, so the table only grows with the live neighbourhood.
    pub async fn discover_peers(&self) -> Result<()> {
        let candidates = self.inner.transport.discover().await?;

        let mut to_connect = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let before = state.peers.len();
            {
                let seen: HashSet<&str> =
                    candidates.iter().map(|peer| peer.id.as_str()).collect();
                state.peers.retain(|id, record| {
                    record.state == PeerState::Connected || seen.contains(id.as_str())
                });
            }
            let pruned = before - state.peers.len();
            if pruned > 0 {
                debug!("Pruned {} stale peer records", pruned);
            }

            for candidate in candidates {
                if candidate.id == self.inner.local_id {
                    continue;
                }
                match state.peers.get_mut(&candidate.id) {
                    Some(record) if record.state == PeerState::Connected => {
                        record.peer.last_seen = Utc::now();
                    }
                    Some(record) => {
                        record.state = PeerState::Discovered;
                        to_connect.push(candidate);
                    }
                    None => {
                        debug!("Discovered peer {} ({})", candidate.id, candidate.display_name);
                        state.peers.insert(
                            candidate.id.clone(),
                            PeerRecord {
                                peer: candidate.clone(),
                                state: PeerState::Discovered,
                            },
                        );
                        to_connect.push(candidate);
                    }
                }
            }
        }

        for candidate in to_connect {
            self.connect_to_peer(candidate).await;
        }

        let announce = P2PMessage::new(MessageType::PeerDiscovery, self.inner.local_id.clone());
        let report = self.broadcast_message(&announce).await;
        debug!("Discovery tick reached {}/{} peers", report.delivered.len(), report.attempted());
        Ok(())
    }

    /// One sync round. Returns `None` when a round is already in progress.
    pub async fn sync_with_peers(&self) -> Result<Option<BroadcastReport>> {
        {
            let mut state = self.inner.state.lock();
            if state.stats.active_sync_count > 0 {
                debug!("Sync already in progress, skipping tick");
                return Ok(None);
            }
            state.stats.active_sync_count += 1;
        }
        let _gate = SyncGate {
            inner: self.inner.clone(),
        };

        let request = P2PMessage::new(MessageType::SyncRequest, self.inner.local_id.clone());
        let report = self.broadcast_message(&request).await;

        {
            let mut state = self.inner.state.lock();
            state.stats.last_sync_time = Some(Utc::now());
            if report.attempted() > 0 && report.delivered.is_empty() {
                state.stats.failed_sync_count += 1;
            }
        }

        info!(
            "Sync round sent to {}/{} peers",
            report.delivered.len(),
            report.attempted()
        );
        Ok(Some(report))
    }

    /// Connected peers (copies).
    pub fn peers(&self) -> Vec<SyncPeer> {
        let state = self.inner.state.lock();
        let mut peers: Vec<SyncPeer> = state
            .peers
            .values()
            .filter(|record| record.state == PeerState::Connected)
            .map(|record| record.peer.clone())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn peer_state(&self, peer_id: &str) -> PeerState {
        self.inner
            .state
            .lock()
            .peers
            .get(peer_id)
            .map(|record| record.state)
            .unwrap_or(PeerState::Unknown)
    }

    pub fn update_peer_last_seen(&self, peer_id: &str) {
        if let Some(record) = self.inner.state.lock().peers.get_mut(peer_id) {
            record.peer.last_seen = Utc::now();
        }
    }

    pub fn stats(&self) -> NetworkStats {
        self.inner.state.lock().stats.clone()
    }

    async fn with_timeout<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.inner.config.timeout;
        match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!("{} after {:?}", what, limit))),
        }
    }
}

/// Run `tick` every `period` until `shutdown` fires.
///
/// Each tick runs in its own task so a panic is contained, and runs to
/// completion even if shutdown is signalled meanwhile.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            match tokio::spawn(tick()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_transient() => debug!("{} tick failed: {}", name, e),
                Ok(Err(e)) => warn!("{} tick failed: {}", name, e),
                Err(e) => error!("{} tick panicked: {}", name, e),
            }

            if *shutdown.borrow() {
                break;
            }
        }
        debug!("{} loop stopped", name);
    })
}
