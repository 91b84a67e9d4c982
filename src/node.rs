//! # Sync Node
//!
//! Joins a [`SyncManager`] to a [`P2PNetworkManager`]. The network layer only
//! moves messages; this is where each message type gets its meaning:
//!
//! | inbound              | reaction                                         |
//! |----------------------|--------------------------------------------------|
//! | `SYNC_REQUEST`       | reply `SYNC_RESPONSE` with our encrypted snapshot |
//! | `SYNC_RESPONSE`      | decrypt and merge the snapshot                   |
//! | `PEER_DISCOVERY`     | reply `PEER_ANNOUNCEMENT`                        |
//! | `PEER_ANNOUNCEMENT`  | admit the sender                                 |
//!
//! Replies go to senders that are not yet connected only if admission control
//! lets them in.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::model::{OperationDraft, SyncOperation, SyncPeer};
use crate::p2p::{
    BroadcastReport, MessageType, P2PMessage, P2PNetworkManager, PeerState, WeakNetworkManager,
};
use crate::sync::SyncManager;
use crate::transport::Inbox;

/// What happened to one locally committed change.
#[derive(Debug)]
pub struct CommitOutcome {
    pub operation: SyncOperation,
    pub broadcast: BroadcastReport,
    /// Pending operations dropped from the log after delivery.
    pub acknowledged: usize,
}

pub struct SyncNode {
    sync: Arc<SyncManager>,
    network: P2PNetworkManager,
}

impl SyncNode {
    pub fn new(sync: Arc<SyncManager>, network: P2PNetworkManager) -> Self {
        let node = Self { sync, network };
        node.register_handlers();
        node
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn network(&self) -> &P2PNetworkManager {
        &self.network
    }

    pub fn device_id(&self) -> &str {
        self.network.local_id()
    }

    /// Start consuming `inbox` and run the periodic loops.
    pub fn start(&self, inbox: Inbox) {
        self.network.listen(inbox);
        self.network.start();
    }

    pub async fn stop(&self) {
        self.network.stop().await;
    }

    /// Run one discovery tick now instead of waiting for the loop.
    pub async fn discover(&self) -> Result<()> {
        self.network.discover_peers().await
    }

    /// Ask every connected peer for its snapshot.
    pub async fn sync_now(&self) -> Result<Option<BroadcastReport>> {
        self.network.sync_with_peers().await
    }

    /// Push our snapshot to every connected peer unprompted.
    pub async fn push_snapshot(&self) -> Result<BroadcastReport> {
        let envelope = self.sync.prepare_data_for_sync().await?;
        let message =
            P2PMessage::new(MessageType::SyncResponse, self.device_id()).with_data(envelope);
        Ok(self.network.broadcast_message(&message).await)
    }

    /// Apply a local change, log it and push the resulting state to peers.
    ///
    /// Pending operations are dropped once at least one peer received the
    /// snapshot carrying them.
    pub async fn record_and_broadcast(&self, draft: OperationDraft) -> Result<CommitOutcome> {
        let operation = self.sync.record_operation(draft).await?;
        if let Err(e) = self.sync.apply_operation(&operation).await {
            self.sync.acknowledge_operations(std::slice::from_ref(&operation)).await?;
            return Err(e);
        }

        let shipped = self.sync.pending_operations().await;
        let broadcast = self.push_snapshot().await?;

        let acknowledged = if broadcast.delivered.is_empty() {
            debug!(
                "{} operations stay pending, no peer received the snapshot",
                shipped.len()
            );
            0
        } else {
            self.sync.acknowledge_operations(&shipped).await?
        };

        Ok(CommitOutcome {
            operation,
            broadcast,
            acknowledged,
        })
    }

    fn register_handlers(&self) {
        let weak = self.network.downgrade();

        let (sync, network) = (self.sync.clone(), weak.clone());
        self.network.on_message(MessageType::SyncRequest, move |message| {
            answer_sync_request(sync.clone(), network.clone(), message)
        });

        let sync = self.sync.clone();
        self.network.on_message(MessageType::SyncResponse, move |message| {
            merge_sync_response(sync.clone(), message)
        });

        let network = weak.clone();
        self.network.on_message(MessageType::PeerDiscovery, move |message| {
            answer_discovery(network.clone(), message)
        });

        self.network.on_message(MessageType::PeerAnnouncement, move |message| {
            admit_announced(weak.clone(), message)
        });
    }
}

async fn answer_sync_request(
    sync: Arc<SyncManager>,
    network: WeakNetworkManager,
    message: P2PMessage,
) -> Result<()> {
    let Some(network) = network.upgrade() else { return Ok(()) };
    ensure_connected(&network, &message.sender_id).await?;

    let envelope = sync.prepare_data_for_sync().await?;
    let reply = P2PMessage::new(MessageType::SyncResponse, network.local_id()).with_data(envelope);
    network.send_message(&message.sender_id, &reply).await
}

async fn merge_sync_response(sync: Arc<SyncManager>, message: P2PMessage) -> Result<()> {
    let envelope = message.data.ok_or_else(|| {
        SyncError::InvalidSyncPayload(format!(
            "SYNC_RESPONSE from {} carries no data",
            message.sender_id
        ))
    })?;
    let report = sync.process_sync_data(&envelope).await?;
    debug!("Merged snapshot from {}: {:?}", message.sender_id, report);
    Ok(())
}

async fn answer_discovery(network: WeakNetworkManager, message: P2PMessage) -> Result<()> {
    let Some(network) = network.upgrade() else { return Ok(()) };
    ensure_connected(&network, &message.sender_id).await?;

    let reply = P2PMessage::new(MessageType::PeerAnnouncement, network.local_id());
    network.send_message(&message.sender_id, &reply).await
}

async fn admit_announced(network: WeakNetworkManager, message: P2PMessage) -> Result<()> {
    let Some(network) = network.upgrade() else { return Ok(()) };
    if network.peer_state(&message.sender_id) != PeerState::Connected
        && network.connect_to_peer(SyncPeer::new(&message.sender_id, &message.sender_id)).await
    {
        info!("Peer {} announced itself", message.sender_id);
    }
    Ok(())
}

/// Admit `sender` if it is not connected yet, honouring the peer limit.
async fn ensure_connected(network: &P2PNetworkManager, sender: &str) -> Result<()> {
    if network.peer_state(sender) == PeerState::Connected {
        return Ok(());
    }
    network.try_connect_to_peer(SyncPeer::new(sender, sender)).await.map_err(|e| {
        warn!("Not answering {}: {}", sender, e);
        e
    })
}
