//! Peer links: one bidirectional data channel to one remote replica.
//!
//! A link is negotiated with an offer/answer/candidate handshake and then
//! reports everything that happens to it as a [`LinkEvent`] on the channel
//! it was created with. [`MemoryNetwork`] provides in-process links with a
//! hard message size ceiling and a per-peer offline switch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use plansync_shared::types::PeerId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Session description rejected: {0}")]
    Description(String),

    #[error("Candidate rejected: {0}")]
    Candidate(String),

    #[error("Channel is not open")]
    ChannelClosed,

    #[error("Message of {size} bytes exceeds channel limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("No link to peer {0}")]
    UnknownPeer(PeerId),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    /// The remote end of the link
    pub peer: PeerId,
    /// Local identifier of the link instance; events from replaced links are stale
    pub link_id: u64,
    pub kind: LinkEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    /// A local reachability candidate to publish to the remote
    LocalCandidate(String),
    /// The data channel is usable
    Open,
    /// A text frame from the remote
    Message(String),
    /// The channel was closed by either side
    Closed,
    /// Negotiation or connectivity failed
    Failed(String),
}

#[async_trait]
pub trait PeerLink: Send {
    /// Initiator: produce the local offer.
    async fn create_offer(&mut self) -> Result<String, TransportError>;

    /// Responder: apply the remote offer and produce the answer.
    async fn accept_offer(&mut self, offer: &str) -> Result<String, TransportError>;

    /// Initiator: apply the remote answer.
    async fn accept_answer(&mut self, answer: &str) -> Result<(), TransportError>;

    async fn add_candidate(&mut self, candidate: &str) -> Result<(), TransportError>;

    fn send(&self, frame: &str) -> Result<(), TransportError>;

    fn close(&mut self);
}

pub trait PeerConnector: Send + Sync {
    /// Create an idle link to `remote`; its events go to `events`.
    fn connect(
        &self,
        local: &PeerId,
        remote: &PeerId,
        link_id: u64,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Box<dyn PeerLink>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

const OFFER_PREFIX: &str = "mem-offer:";
const ANSWER_PREFIX: &str = "mem-answer:";

/// Default ceiling, in line with what browsers accept on a data channel.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Clone)]
struct Endpoint {
    peer: PeerId,
    link_id: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
}

struct Negotiation {
    offerer: Endpoint,
    answerer: Option<Endpoint>,
}

struct NetworkInner {
    negotiations: HashMap<String, Negotiation>,
    offline: HashSet<PeerId>,
    relay_only: bool,
    max_message_size: usize,
    next_port: u16,
}

/// Shared in-process "network" that memory links negotiate through.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                negotiations: HashMap::new(),
                offline: HashSet::new(),
                relay_only: false,
                max_message_size,
                next_port: 50_000,
            })),
        }
    }

    /// Take a peer off the network: its frames are dropped and new
    /// negotiations involving it fail.
    pub fn set_offline(&self, peer: &PeerId, offline: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            if offline {
                inner.offline.insert(peer.clone());
            } else {
                inner.offline.remove(peer);
            }
        }
    }

    /// Advertise relay candidates instead of host candidates.
    pub fn set_relay_only(&self, relay_only: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.relay_only = relay_only;
        }
    }

    /// Offers published but not yet answered and accepted.
    pub fn pending_negotiations(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.negotiations.len())
            .unwrap_or(0)
    }

    fn is_offline(&self, peer: &PeerId) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.offline.contains(peer))
            .unwrap_or(true)
    }

    fn max_message_size(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.max_message_size)
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }

    fn candidate_for(&self, token: &str) -> String {
        let (port, typ) = match self.inner.lock() {
            Ok(mut inner) => {
                inner.next_port = inner.next_port.wrapping_add(1).max(50_000);
                let typ = if inner.relay_only { "relay" } else { "host" };
                (inner.next_port, typ)
            }
            Err(_) => (0, "host"),
        };
        format!("candidate:{token} 1 udp 2122260223 127.0.0.1 {port} typ {typ}")
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerConnector for MemoryNetwork {
    fn connect(
        &self,
        local: &PeerId,
        remote: &PeerId,
        link_id: u64,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Box<dyn PeerLink> {
        Box::new(MemoryLink {
            network: self.clone(),
            local: Endpoint {
                peer: local.clone(),
                link_id,
                events,
            },
            remote_peer: remote.clone(),
            remote: None,
            token: None,
            applied_candidates: HashSet::new(),
            open: false,
            closed: false,
        })
    }
}

pub struct MemoryLink {
    network: MemoryNetwork,
    local: Endpoint,
    remote_peer: PeerId,
    remote: Option<Endpoint>,
    token: Option<String>,
    applied_candidates: HashSet<String>,
    open: bool,
    closed: bool,
}

impl MemoryLink {
    fn emit(&self, kind: LinkEventKind) {
        let _ = self.local.events.send(LinkEvent {
            peer: self.remote_peer.clone(),
            link_id: self.local.link_id,
            kind,
        });
    }

    fn emit_local_candidate(&self, token: &str) {
        let candidate = self.network.candidate_for(token);
        self.emit(LinkEventKind::LocalCandidate(candidate));
    }

    // Open once the remote description is known and at least one remote
    // candidate has been applied.
    fn maybe_open(&mut self) {
        if !self.open && !self.closed && self.remote.is_some() && !self.applied_candidates.is_empty()
        {
            self.open = true;
            debug!(remote = %self.remote_peer.short(), "Memory link open");
            self.emit(LinkEventKind::Open);
        }
    }

    fn fail(&mut self, reason: &str) {
        if !self.closed {
            self.closed = true;
            self.open = false;
            self.emit(LinkEventKind::Failed(reason.to_string()));
        }
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&mut self) -> Result<String, TransportError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        {
            let mut inner = self
                .network
                .inner
                .lock()
                .map_err(|e| TransportError::Unavailable(e.to_string()))?;
            inner.negotiations.insert(
                token.clone(),
                Negotiation {
                    offerer: self.local.clone(),
                    answerer: None,
                },
            );
        }
        self.token = Some(token.clone());
        self.emit_local_candidate(&token);
        Ok(format!("{OFFER_PREFIX}{token}"))
    }

    async fn accept_offer(&mut self, offer: &str) -> Result<String, TransportError> {
        let token = offer
            .strip_prefix(OFFER_PREFIX)
            .ok_or_else(|| TransportError::Description(format!("not an offer: {offer}")))?
            .to_string();

        let offerer = {
            let mut inner = self
                .network
                .inner
                .lock()
                .map_err(|e| TransportError::Unavailable(e.to_string()))?;
            let negotiation = inner
                .negotiations
                .get_mut(&token)
                .ok_or_else(|| TransportError::Description(format!("unknown offer {token}")))?;
            negotiation.answerer = Some(self.local.clone());
            negotiation.offerer.clone()
        };

        self.remote = Some(offerer);
        self.token = Some(token.clone());
        self.emit_local_candidate(&token);
        self.maybe_open();
        Ok(format!("{ANSWER_PREFIX}{token}"))
    }

    async fn accept_answer(&mut self, answer: &str) -> Result<(), TransportError> {
        let token = answer
            .strip_prefix(ANSWER_PREFIX)
            .ok_or_else(|| TransportError::Description(format!("not an answer: {answer}")))?;
        if self.token.as_deref() != Some(token) {
            return Err(TransportError::Description(format!(
                "answer for a different offer: {token}"
            )));
        }

        // Both ends know each other now; the rendezvous entry is done.
        let answerer = {
            let mut inner = self
                .network
                .inner
                .lock()
                .map_err(|e| TransportError::Unavailable(e.to_string()))?;
            let answered = inner
                .negotiations
                .get(token)
                .and_then(|n| n.answerer.clone())
                .ok_or_else(|| TransportError::Description("offer was never answered".into()))?;
            inner.negotiations.remove(token);
            answered
        };

        self.remote = Some(answerer);
        self.maybe_open();
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &str) -> Result<(), TransportError> {
        let token = candidate
            .strip_prefix("candidate:")
            .and_then(|rest| rest.split_whitespace().next())
            .ok_or_else(|| TransportError::Candidate(format!("malformed: {candidate}")))?;

        if self.token.as_deref() != Some(token) {
            return Err(TransportError::Candidate(format!(
                "candidate for another session: {token}"
            )));
        }
        if !self.applied_candidates.insert(candidate.to_string()) {
            return Err(TransportError::Candidate("duplicate candidate".into()));
        }

        if self.network.is_offline(&self.local.peer) || self.network.is_offline(&self.remote_peer) {
            self.fail("remote unreachable");
            return Ok(());
        }

        self.maybe_open();
        Ok(())
    }

    fn send(&self, frame: &str) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ChannelClosed);
        }
        let max = self.network.max_message_size();
        if frame.len() > max {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                max,
            });
        }
        let Some(remote) = &self.remote else {
            return Err(TransportError::ChannelClosed);
        };

        // Offline peers lose frames silently, like a dead NAT binding.
        if self.network.is_offline(&self.local.peer) || self.network.is_offline(&remote.peer) {
            return Ok(());
        }

        remote
            .events
            .send(LinkEvent {
                peer: self.local.peer.clone(),
                link_id: remote.link_id,
                kind: LinkEventKind::Message(frame.to_string()),
            })
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.open = false;

        if let Some(remote) = &self.remote {
            let _ = remote.events.send(LinkEvent {
                peer: self.local.peer.clone(),
                link_id: remote.link_id,
                kind: LinkEventKind::Closed,
            });
        }
        if let Some(token) = &self.token {
            if let Ok(mut inner) = self.network.inner.lock() {
                inner.negotiations.remove(token);
            }
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        a: Box<dyn PeerLink>,
        b: Box<dyn PeerLink>,
        a_rx: mpsc::UnboundedReceiver<LinkEvent>,
        b_rx: mpsc::UnboundedReceiver<LinkEvent>,
    }

    fn candidates(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LinkEventKind::LocalCandidate(c) = event.kind {
                out.push(c);
            }
        }
        out
    }

    async fn negotiate(network: &MemoryNetwork) -> Pair {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let pa = PeerId::new("a");
        let pb = PeerId::new("b");
        let mut a = network.connect(&pa, &pb, 1, a_tx);
        let mut b = network.connect(&pb, &pa, 7, b_tx);

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.accept_answer(&answer).await.unwrap();

        let from_a = candidates(&mut a_rx);
        let from_b = candidates(&mut b_rx);
        for c in from_a {
            b.add_candidate(&c).await.unwrap();
        }
        for c in from_b {
            a.add_candidate(&c).await.unwrap();
        }
        Pair { a, b, a_rx, b_rx }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEventKind> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.kind);
        }
        out
    }

    #[tokio::test]
    async fn test_handshake_opens_both_sides() {
        let network = MemoryNetwork::new();
        let mut pair = negotiate(&network).await;

        assert!(drain(&mut pair.a_rx).contains(&LinkEventKind::Open));
        assert!(drain(&mut pair.b_rx).contains(&LinkEventKind::Open));

        pair.a.send("hello").unwrap();
        let event = pair.b_rx.recv().await.unwrap();
        assert_eq!(event.peer, PeerId::new("a"));
        assert_eq!(event.link_id, 7);
        assert_eq!(event.kind, LinkEventKind::Message("hello".into()));
    }

    #[tokio::test]
    async fn test_duplicate_candidate_rejected() {
        let network = MemoryNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let mut a = network.connect(&PeerId::new("a"), &PeerId::new("b"), 1, a_tx);
        let mut b = network.connect(&PeerId::new("b"), &PeerId::new("a"), 2, b_tx);

        let offer = a.create_offer().await.unwrap();
        b.accept_offer(&offer).await.unwrap();
        let c = candidates(&mut a_rx).remove(0);

        assert!(b.add_candidate(&c).await.is_ok());
        assert!(matches!(
            b.add_candidate(&c).await,
            Err(TransportError::Candidate(_))
        ));
    }

    #[tokio::test]
    async fn test_send_enforces_size_ceiling() {
        let network = MemoryNetwork::with_max_message_size(8);
        let pair = negotiate(&network).await;

        assert!(pair.a.send("12345678").is_ok());
        assert_eq!(
            pair.a.send("123456789"),
            Err(TransportError::MessageTooLarge { size: 9, max: 8 })
        );
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = network.connect(&PeerId::new("a"), &PeerId::new("b"), 1, tx);
        assert_eq!(link.send("x"), Err(TransportError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_close_notifies_remote() {
        let network = MemoryNetwork::new();
        let mut pair = negotiate(&network).await;
        drain(&mut pair.b_rx);

        pair.a.close();
        assert_eq!(pair.b_rx.recv().await.unwrap().kind, LinkEventKind::Closed);
        assert_eq!(pair.a.send("late"), Err(TransportError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_negotiations_are_released() {
        let network = MemoryNetwork::new();
        let _pair = negotiate(&network).await;
        assert_eq!(network.pending_negotiations(), 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut abandoned = network.connect(&PeerId::new("a"), &PeerId::new("c"), 3, tx);
        abandoned.create_offer().await.unwrap();
        assert_eq!(network.pending_negotiations(), 1);

        drop(abandoned);
        assert_eq!(network.pending_negotiations(), 0);
    }

    #[tokio::test]
    async fn test_offline_peer_drops_frames() {
        let network = MemoryNetwork::new();
        let mut pair = negotiate(&network).await;
        drain(&mut pair.b_rx);

        network.set_offline(&PeerId::new("b"), true);
        pair.a.send("lost").unwrap();
        assert!(pair.b_rx.try_recv().is_err());

        network.set_offline(&PeerId::new("b"), false);
        pair.a.send("found").unwrap();
        assert_eq!(
            pair.b_rx.recv().await.unwrap().kind,
            LinkEventKind::Message("found".into())
        );
    }

    #[tokio::test]
    async fn test_relay_candidates() {
        let network = MemoryNetwork::new();
        network.set_relay_only(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = network.connect(&PeerId::new("a"), &PeerId::new("b"), 1, tx);
        link.create_offer().await.unwrap();
        assert!(candidates(&mut rx)[0].ends_with("typ relay"));
    }
}
