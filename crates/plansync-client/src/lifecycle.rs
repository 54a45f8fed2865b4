//! Room lifecycle: which room we are in, in what role, and the derived
//! status.
//!
//! Every create/join/leave advances the epoch. Work started under an older
//! epoch reports back tagged with it and is discarded.

use tokio::sync::watch;
use tracing::{debug, info};

use plansync_shared::crypto::{derive_room_keys_with_rounds, Salt};
use plansync_shared::{PeerId, Role, RoomCode, RoomKeys, SyncStatus};

use crate::error::SyncError;

/// Run PBKDF2 on the blocking pool so the caller's loop keeps turning.
pub async fn derive_keys(
    room_id: &str,
    password: &str,
    salt: Salt,
    rounds: u32,
) -> Result<RoomKeys, SyncError> {
    let room_id = room_id.to_string();
    let password = password.to_string();
    let started = std::time::Instant::now();

    let keys = tokio::task::spawn_blocking(move || {
        derive_room_keys_with_rounds(&room_id, &password, &salt, rounds)
    })
    .await
    .map_err(|_| SyncError::Cancelled)??;

    debug!(
        rounds,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Derived room keys"
    );
    Ok(keys)
}

/// An authenticated room.
#[derive(Debug, Clone)]
pub struct RoomContext {
    pub code: RoomCode,
    pub role: Role,
    pub host: PeerId,
    pub keys: RoomKeys,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Authenticating,
    Active(RoomContext),
}

#[derive(Debug)]
pub struct Lifecycle {
    epoch: u64,
    phase: Phase,
    status_tx: watch::Sender<SyncStatus>,
}

impl Lifecycle {
    pub fn new() -> (Self, watch::Receiver<SyncStatus>) {
        let (status_tx, status_rx) = watch::channel(SyncStatus::Disconnected);
        (
            Self {
                epoch: 0,
                phase: Phase::Idle,
                status_tx,
            },
            status_rx,
        )
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_tx.borrow()
    }

    pub fn room(&self) -> Option<&RoomContext> {
        match &self.phase {
            Phase::Active(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    /// Start a create or join. Returns the epoch its results must carry.
    pub fn begin(&mut self) -> u64 {
        self.epoch += 1;
        self.phase = Phase::Authenticating;
        self.epoch
    }

    /// Install the authenticated room. False if `epoch` is stale.
    pub fn authenticated(&mut self, epoch: u64, ctx: RoomContext) -> bool {
        if !self.is_current(epoch) || !matches!(self.phase, Phase::Authenticating) {
            return false;
        }
        info!(room = %ctx.code, role = ?ctx.role, "Room authenticated");
        self.phase = Phase::Active(ctx);
        true
    }

    /// Abandon a create or join that failed. False if `epoch` is stale.
    pub fn failed(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.phase = Phase::Idle;
        true
    }

    /// Leave whatever room is active or pending. The keys go with the
    /// returned context.
    pub fn leave(&mut self) -> Option<RoomContext> {
        self.epoch += 1;
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Active(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Recompute the status from the number of open channels. Returns the
    /// new status if it changed.
    pub fn refresh(&mut self, open_peers: usize) -> Option<SyncStatus> {
        let next = match &self.phase {
            Phase::Idle => SyncStatus::Disconnected,
            Phase::Authenticating => SyncStatus::Connecting,
            Phase::Active(_) if open_peers > 0 => SyncStatus::Connected,
            Phase::Active(_) => SyncStatus::Connecting,
        };
        if next == self.status() {
            return None;
        }
        info!(from = %self.status(), to = %next, "Sync status changed");
        self.status_tx.send_replace(next);
        Some(next)
    }
}
