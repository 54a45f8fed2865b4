// Peer-to-peer plumbing: signaling, links, framing and liveness.

pub mod framing;
pub mod link;
pub mod liveness;
pub mod peers;
pub mod signaling;
pub mod transport;

pub use framing::{encode_frames, split_frames, FramingError, Reassembler};
pub use link::{
    LinkEvent, LinkEventKind, MemoryNetwork, PeerConnector, PeerLink, TransportError,
    DEFAULT_MAX_MESSAGE_SIZE,
};
pub use liveness::LivenessTracker;
pub use peers::{ConnectionInfo, PeerState, PeerTracker};
pub use signaling::{MemorySignaling, RoomRecord, SignalEvent, SignalingChannel, SignalingError};
pub use transport::{CloseReason, TransportEvent, TransportSession};
