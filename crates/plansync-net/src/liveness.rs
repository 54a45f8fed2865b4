//! Heartbeat bookkeeping.
//!
//! Records when each open peer was last heard from. Any inbound frame counts.
//! The session pings every interval and closes whatever
//! [`LivenessTracker::expired`] reports.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use plansync_shared::types::PeerId;

#[derive(Debug)]
pub struct LivenessTracker {
    timeout: Duration,
    last_seen: HashMap<PeerId, Instant>,
}

impl LivenessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: HashMap::new(),
        }
    }

    /// Start tracking a peer whose channel just opened.
    pub fn track(&mut self, peer: &PeerId, now: Instant) {
        self.last_seen.insert(peer.clone(), now);
    }

    /// Record inbound traffic. Untracked peers are ignored.
    pub fn touch(&mut self, peer: &PeerId, now: Instant) {
        if let Some(seen) = self.last_seen.get_mut(peer) {
            *seen = now;
        }
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.last_seen.remove(peer);
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }

    /// Peers silent for longer than the timeout, sorted for stable output.
    pub fn expired(&self, now: Instant) -> Vec<PeerId> {
        let mut dead: Vec<PeerId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > self.timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        dead.sort();
        dead
    }

    pub fn last_seen(&self, peer: &PeerId) -> Option<Instant> {
        self.last_seen.get(peer).copied()
    }

    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}
