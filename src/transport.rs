//! # Transport Abstraction
//!
//! The P2P layer never talks to sockets directly. Anything that can find
//! peers and move opaque frames between them implements [`Transport`]: a
//! WebRTC data channel, a TCP stream, Bluetooth. Frames are the JSON-encoded
//! wire messages; inbound frames are handed to
//! [`P2PNetworkManager::handle_incoming`](crate::p2p::P2PNetworkManager::handle_incoming).
//!
//! [`MemoryNetwork`] is an in-process hub used by tests and the `simulate`
//! command. Each joined node gets a [`MemoryTransport`] plus the receiving end
//! of its inbox.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::SyncPeer;

/// Inbound frames for one node.
pub type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Peers currently reachable, excluding ourselves.
    async fn discover(&self) -> Result<Vec<SyncPeer>>;

    async fn connect(&self, peer: &SyncPeer) -> Result<()>;

    async fn send(&self, peer_id: &str, frame: Vec<u8>) -> Result<()>;

    async fn disconnect(&self, peer_id: &str) -> Result<()>;
}

struct Endpoint {
    display_name: String,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
    reachable: bool,
}

/// In-process hub connecting any number of nodes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<RwLock<HashMap<String, Endpoint>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and hand back its transport and inbox.
    pub fn join(&self, peer_id: &str, display_name: &str) -> (MemoryTransport, Inbox) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        self.endpoints.write().insert(
            peer_id.to_string(),
            Endpoint {
                display_name: display_name.to_string(),
                inbox: inbox_tx,
                reachable: true,
            },
        );
        debug!("Node {} joined the memory network", peer_id);

        let transport = MemoryTransport {
            local_id: peer_id.to_string(),
            network: self.clone(),
        };
        (transport, inbox_rx)
    }

    pub fn leave(&self, peer_id: &str) {
        self.endpoints.write().remove(peer_id);
    }

    /// Simulate a node dropping off the network without leaving.
    pub fn set_reachable(&self, peer_id: &str, reachable: bool) {
        if let Some(endpoint) = self.endpoints.write().get_mut(peer_id) {
            endpoint.reachable = reachable;
        }
    }

    pub fn node_count(&self) -> usize {
        self.endpoints.read().len()
    }

    fn deliver(&self, peer_id: &str, frame: Vec<u8>) -> Result<()> {
        let endpoints = self.endpoints.read();
        let endpoint = endpoints
            .get(peer_id)
            .filter(|e| e.reachable)
            .ok_or_else(|| SyncError::Transport(format!("peer {} is unreachable", peer_id)))?;
        endpoint
            .inbox
            .send(frame)
            .map_err(|_| SyncError::Transport(format!("inbox of {} is closed", peer_id)))
    }
}

/// One node's handle on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local_id: String,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn discover(&self) -> Result<Vec<SyncPeer>> {
        let endpoints = self.network.endpoints.read();
        let mut peers: Vec<SyncPeer> = endpoints
            .iter()
            .filter(|(id, endpoint)| **id != self.local_id && endpoint.reachable)
            .map(|(id, endpoint)| SyncPeer::new(id.clone(), endpoint.display_name.clone()))
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }

    async fn connect(&self, peer: &SyncPeer) -> Result<()> {
        let endpoints = self.network.endpoints.read();
        match endpoints.get(&peer.id) {
            Some(endpoint) if endpoint.reachable => Ok(()),
            _ => Err(SyncError::Transport(format!("peer {} is unreachable", peer.id))),
        }
    }

    async fn send(&self, peer_id: &str, frame: Vec<u8>) -> Result<()> {
        self.network.deliver(peer_id, frame)
    }

    async fn disconnect(&self, _peer_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_discover_excludes_self() {
        let network = MemoryNetwork::new();
        let (alice, _alice_inbox) = network.join("alice", "Alice's laptop");
        let (_bob, _bob_inbox) = network.join("bob", "Bob's phone");

        let peers = alice.discover().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "bob");
        assert_eq!(peers[0].display_name, "Bob's phone");
    }

    #[tokio::test]
    async fn test_send_delivers_to_inbox() {
        let network = MemoryNetwork::new();
        let (alice, _alice_inbox) = network.join("alice", "A");
        let (_bob, mut bob_inbox) = network.join("bob", "B");

        alice.send("bob", b"hello".to_vec()).await.unwrap();
        assert_eq!(bob_inbox.recv().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let network = MemoryNetwork::new();
        let (alice, _alice_inbox) = network.join("alice", "A");
        let (_bob, _bob_inbox) = network.join("bob", "B");

        network.set_reachable("bob", false);
        assert!(alice.discover().await.unwrap().is_empty());
        assert_matches!(alice.send("bob", vec![1]).await, Err(SyncError::Transport(_)));

        network.leave("bob");
        assert_eq!(network.node_count(), 1);
        assert_matches!(
            alice.connect(&SyncPeer::new("bob", "B")).await,
            Err(SyncError::Transport(_))
        );
    }
}
