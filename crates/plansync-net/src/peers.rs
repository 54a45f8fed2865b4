//! Peer connection tracking.
//!
//! Maintains an in-memory map of peers we are negotiating with or connected
//! to, their connection state, and whether the path is direct or relayed.

use std::collections::HashMap;

use tracing::debug;

use plansync_shared::types::{ConnectionMode, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Negotiating,
    Open,
}

/// Information about a tracked peer.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub state: PeerState,
    /// Whether the open path is direct or via a relay.
    pub mode: ConnectionMode,
    /// When the channel opened (Unix epoch millis), if it has.
    pub opened_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct PeerTracker {
    peers: HashMap<PeerId, ConnectionInfo>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that negotiation with a peer has started.
    pub fn on_negotiating(&mut self, peer_id: &PeerId) {
        debug!(peer = %peer_id.short(), "Tracking peer negotiation");
        self.peers.insert(
            peer_id.clone(),
            ConnectionInfo {
                peer_id: peer_id.clone(),
                state: PeerState::Negotiating,
                mode: ConnectionMode::Disconnected,
                opened_at: None,
            },
        );
    }

    /// Record that a peer's channel opened. Returns false for unknown peers.
    pub fn on_open(&mut self, peer_id: &PeerId, is_relayed: bool) -> bool {
        let Some(info) = self.peers.get_mut(peer_id) else {
            return false;
        };
        info.state = PeerState::Open;
        info.mode = if is_relayed {
            ConnectionMode::Relayed
        } else {
            ConnectionMode::Direct
        };
        info.opened_at = Some(chrono::Utc::now().timestamp_millis());
        debug!(peer = %peer_id.short(), mode = ?info.mode, "Peer channel open");
        true
    }

    pub fn on_closed(&mut self, peer_id: &PeerId) -> Option<ConnectionInfo> {
        let removed = self.peers.remove(peer_id);
        if removed.is_some() {
            debug!(peer = %peer_id.short(), "Removed peer from tracker");
        }
        removed
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&ConnectionInfo> {
        self.peers.get(peer_id)
    }

    pub fn connection_mode(&self, peer_id: &PeerId) -> ConnectionMode {
        self.peers
            .get(peer_id)
            .map(|info| info.mode)
            .unwrap_or(ConnectionMode::Disconnected)
    }

    pub fn is_open(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get(peer_id)
            .map(|info| info.state == PeerState::Open)
            .unwrap_or(false)
    }

    /// Open peers, sorted for deterministic fan-out order.
    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .values()
            .filter(|info| info.state == PeerState::Open)
            .map(|info| info.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn open_count(&self) -> usize {
        self.peers
            .values()
            .filter(|info| info.state == PeerState::Open)
            .count()
    }

    pub fn relayed_count(&self) -> usize {
        self.peers
            .values()
            .filter(|info| info.mode == ConnectionMode::Relayed)
            .count()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
