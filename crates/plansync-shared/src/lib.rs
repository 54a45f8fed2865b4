// Types, crypto and wire formats shared by the sync client and relay server.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use crypto::{AuthCredential, Ciphertext, DataKey, RoomKeys, Salt};
pub use error::{CryptoError, PlansyncError, ProtocolError};
pub use protocol::{PeerAnnouncement, RelayEvent, RelayRecord, SignalKind, SignalMessage, WireMessage};
pub use types::{ClassColors, ConnectionMode, PeerId, Role, RoomCode, SyncStatus, TaskId, TaskRecord};
