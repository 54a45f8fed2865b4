use plansync_shared::{ConnectionMode, PeerId, SyncStatus};

/// Notifications sent *from* the sync session to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotification {
    /// The session status changed.
    StatusChanged(SyncStatus),
    /// A data channel to a peer opened.
    PeerConnected { peer: PeerId, mode: ConnectionMode },
    /// A peer's channel closed, failed or timed out.
    PeerDisconnected { peer: PeerId },
    /// A remote snapshot replaced the local task list.
    RemoteApplied { from: PeerId, tasks: usize },
    /// The room password did not match.
    AuthenticationFailed,
    /// A snapshot from `from` could not be decrypted. Local records are kept
    /// and a placeholder record marks the failure.
    DecryptionFailed { from: PeerId },
    /// A non-fatal transport problem; the heartbeat recovers from these.
    TransportError { peer: Option<PeerId>, message: String },
}
