use thiserror::Error;

use plansync_net::{SignalingError, TransportError};
use plansync_shared::{CryptoError, RoomCode};

use crate::relay::RelayError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Authentication failed: wrong room password")]
    AuthenticationFailed,

    #[error("Room not found: {0}")]
    RoomNotFound(RoomCode),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Superseded by a newer room operation")]
    Cancelled,

    #[error("Sync session has shut down")]
    SessionClosed,
}
