//! Signaling collaborator.
//!
//! Peers never talk to each other before a channel is open, so room records,
//! announcements and offer/answer/candidate messages travel through an
//! external publish/subscribe store scoped by room code. The core only sees
//! the [`SignalingChannel`] trait; [`MemorySignaling`] is an in-process
//! implementation used by tests and single-machine setups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use plansync_shared::crypto::{AuthCredential, Salt};
use plansync_shared::protocol::{PeerAnnouncement, SignalMessage};
use plansync_shared::types::{PeerId, RoomCode};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Room already exists: {0}")]
    RoomExists(RoomCode),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomCode),

    #[error("Signaling backend unavailable: {0}")]
    Unavailable(String),
}

/// Session record created by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub code: RoomCode,
    pub host: PeerId,
    pub salt: Salt,
    /// The host's auth credential; joiners must derive the same value
    pub verifier: AuthCredential,
    pub created_at: DateTime<Utc>,
}

/// Additions delivered to room subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    PeerAnnounced(PeerAnnouncement),
    PeerLeft(PeerId),
    Signal(SignalMessage),
    RoomClosed,
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn create_room(&self, record: RoomRecord) -> Result<(), SignalingError>;

    async fn get_room(&self, code: &RoomCode) -> Result<Option<RoomRecord>, SignalingError>;

    /// Append a peer to the room's peer list.
    async fn announce(
        &self,
        code: &RoomCode,
        announcement: PeerAnnouncement,
    ) -> Result<(), SignalingError>;

    /// Append an offer/answer/candidate sub-record.
    async fn publish(&self, message: SignalMessage) -> Result<(), SignalingError>;

    /// Deliver everything already in the room, then every later addition.
    async fn subscribe(
        &self,
        code: &RoomCode,
    ) -> Result<mpsc::UnboundedReceiver<SignalEvent>, SignalingError>;

    /// Remove a peer's traces; when the host leaves the room is closed.
    async fn leave(&self, code: &RoomCode, peer: &PeerId) -> Result<(), SignalingError>;
}

struct RoomEntry {
    record: RoomRecord,
    history: Vec<SignalEvent>,
    subscribers: Vec<mpsc::UnboundedSender<SignalEvent>>,
}

impl RoomEntry {
    fn push(&mut self, event: SignalEvent, redeliver: bool) {
        self.subscribers.retain(|tx| {
            let mut ok = tx.send(event.clone()).is_ok();
            if ok && redeliver {
                ok = tx.send(event.clone()).is_ok();
            }
            ok
        });
        self.history.push(event);
    }
}

/// In-process signaling store with near-real-time fan-out.
#[derive(Clone, Default)]
pub struct MemorySignaling {
    rooms: Arc<Mutex<HashMap<RoomCode, RoomEntry>>>,
    redeliver: bool,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that delivers every live event twice, like a backend that
    /// retries notifications.
    pub fn with_redelivery() -> Self {
        Self {
            rooms: Arc::default(),
            redeliver: true,
        }
    }

    pub fn room_count(&self) -> usize {
        self.lock().map(|rooms| rooms.len()).unwrap_or(0)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<RoomCode, RoomEntry>>, SignalingError> {
        self.rooms
            .lock()
            .map_err(|e| SignalingError::Unavailable(format!("lock poisoned: {e}")))
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn create_room(&self, record: RoomRecord) -> Result<(), SignalingError> {
        let mut rooms = self.lock()?;
        if rooms.contains_key(&record.code) {
            return Err(SignalingError::RoomExists(record.code));
        }
        debug!(room = %record.code, host = %record.host.short(), "Room record created");
        rooms.insert(
            record.code.clone(),
            RoomEntry {
                record,
                history: Vec::new(),
                subscribers: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_room(&self, code: &RoomCode) -> Result<Option<RoomRecord>, SignalingError> {
        Ok(self.lock()?.get(code).map(|entry| entry.record.clone()))
    }

    async fn announce(
        &self,
        code: &RoomCode,
        announcement: PeerAnnouncement,
    ) -> Result<(), SignalingError> {
        let mut rooms = self.lock()?;
        let entry = rooms
            .get_mut(code)
            .ok_or_else(|| SignalingError::RoomNotFound(code.clone()))?;
        entry.push(SignalEvent::PeerAnnounced(announcement), self.redeliver);
        Ok(())
    }

    async fn publish(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let mut rooms = self.lock()?;
        let code = message.room.clone();
        let entry = rooms
            .get_mut(&code)
            .ok_or(SignalingError::RoomNotFound(code))?;
        entry.push(SignalEvent::Signal(message), self.redeliver);
        Ok(())
    }

    async fn subscribe(
        &self,
        code: &RoomCode,
    ) -> Result<mpsc::UnboundedReceiver<SignalEvent>, SignalingError> {
        let mut rooms = self.lock()?;
        let entry = rooms
            .get_mut(code)
            .ok_or_else(|| SignalingError::RoomNotFound(code.clone()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for event in &entry.history {
            let _ = tx.send(event.clone());
        }
        entry.subscribers.push(tx);
        Ok(rx)
    }

    async fn leave(&self, code: &RoomCode, peer: &PeerId) -> Result<(), SignalingError> {
        let mut rooms = self.lock()?;
        let Some(entry) = rooms.get_mut(code) else {
            return Ok(());
        };

        if entry.record.host == *peer {
            debug!(room = %code, "Host left, closing room");
            for tx in &entry.subscribers {
                let _ = tx.send(SignalEvent::RoomClosed);
            }
            rooms.remove(code);
            return Ok(());
        }

        // Drop the peer's announcements and any signaling addressed to or from
        // it so a later rejoin starts from a clean slate.
        entry.history.retain(|event| match event {
            SignalEvent::PeerAnnounced(a) => a.peer != *peer,
            SignalEvent::Signal(m) => m.sender != *peer && m.target != *peer,
            _ => true,
        });
        entry.push(SignalEvent::PeerLeft(peer.clone()), false);
        Ok(())
    }
}
