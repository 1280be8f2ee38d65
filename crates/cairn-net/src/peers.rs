//! Peer connection tracking.
//!
//! Maintains the table of live overlay connections keyed by the peer's
//! advertised listen endpoint, with the outbound queue used to reach it.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use cairn_shared::{FloodMessage, PeerAddr};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Information about a connected peer.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Listen address the peer announced in its hello.
    pub addr: PeerAddr,
    pub direction: Direction,
    /// Distinguishes a replaced connection from its successor.
    pub conn_id: u64,
    /// Timestamp of when the connection was established (Unix epoch millis).
    pub connected_at: u64,
    sender: mpsc::Sender<FloodMessage>,
}

/// Tracks all currently connected peers.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, ConnectionInfo>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connected peer, replacing any older connection to the same
    /// endpoint.
    pub fn on_connected(
        &mut self,
        addr: PeerAddr,
        direction: Direction,
        conn_id: u64,
        sender: mpsc::Sender<FloodMessage>,
    ) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        debug!(
            peer = %addr.endpoint(),
            username = %addr.username,
            direction = ?direction,
            conn_id,
            "Tracking new peer connection"
        );

        let info = ConnectionInfo {
            addr: addr.clone(),
            direction,
            conn_id,
            connected_at: now,
            sender,
        };
        self.peers.insert(addr.endpoint(), info);
    }

    /// Remove `endpoint` if it is still served by connection `conn_id`.
    pub fn on_disconnected(&mut self, endpoint: &str, conn_id: u64) -> Option<PeerAddr> {
        match self.peers.get(endpoint) {
            Some(info) if info.conn_id == conn_id => {
                debug!(peer = %endpoint, conn_id, "Removed peer from table");
                self.peers.remove(endpoint).map(|info| info.addr)
            }
            _ => None,
        }
    }

    /// Remove `endpoint` regardless of which connection serves it.
    pub fn remove(&mut self, endpoint: &str) -> Option<PeerAddr> {
        self.peers.remove(endpoint).map(|info| info.addr)
    }

    pub fn get(&self, endpoint: &str) -> Option<&ConnectionInfo> {
        self.peers.get(endpoint)
    }

    pub fn is_connected(&self, endpoint: &str) -> bool {
        self.peers.contains_key(endpoint)
    }

    pub fn connected_peers(&self) -> Vec<PeerAddr> {
        self.peers.values().map(|info| info.addr.clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Queue handle for one peer.
    pub fn sender(&self, endpoint: &str) -> Option<mpsc::Sender<FloodMessage>> {
        self.peers.get(endpoint).map(|info| info.sender.clone())
    }

    /// Queue handles for every peer except `exclude`.
    pub fn senders_except(
        &self,
        exclude: Option<&str>,
    ) -> Vec<(String, mpsc::Sender<FloodMessage>)> {
        self.peers
            .iter()
            .filter(|(endpoint, _)| Some(endpoint.as_str()) != exclude)
            .map(|(endpoint, info)| (endpoint.clone(), info.sender.clone()))
            .collect()
    }
}
