//! Transport session: one negotiated link per remote peer within a room.
//!
//! The session turns inbound signaling messages and link events into
//! [`TransportEvent`]s for its owner. It never publishes to signaling
//! itself; outbound offers, answers and candidates are returned as
//! `TransportEvent::Publish` so the owner can hand them to a non-blocking
//! pump.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use plansync_shared::protocol::{SignalKind, SignalMessage};
use plansync_shared::types::{ConnectionMode, PeerId, RoomCode};

use crate::link::{LinkEvent, LinkEventKind, PeerConnector, PeerLink, TransportError};
use crate::peers::PeerTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote closed the channel
    Remote,
    /// The remote sent a hangup through signaling
    Hangup,
    /// A new negotiation with the same peer superseded the link
    Replaced,
    /// Negotiation or connectivity failed
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Signaling message to publish
    Publish(SignalMessage),
    /// A channel became usable
    Opened { peer: PeerId, mode: ConnectionMode },
    /// A text frame arrived on an open channel
    Frame { peer: PeerId, data: String },
    /// A previously tracked link is gone
    Closed { peer: PeerId, reason: CloseReason },
}

// Frames held for a link whose remote end opened first.
const MAX_EARLY_FRAMES: usize = 1024;

struct LinkSlot {
    link: Box<dyn PeerLink>,
    link_id: u64,
    remote_described: bool,
    relayed: bool,
    early_frames: Vec<String>,
}

pub struct TransportSession {
    local: PeerId,
    room: RoomCode,
    connector: Arc<dyn PeerConnector>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    links: HashMap<PeerId, LinkSlot>,
    tracker: PeerTracker,
    seen_signals: HashSet<String>,
    pending_candidates: HashMap<PeerId, Vec<String>>,
    next_link_id: u64,
}

impl TransportSession {
    pub fn new(
        local: PeerId,
        room: RoomCode,
        connector: Arc<dyn PeerConnector>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            local,
            room,
            connector,
            link_events,
            links: HashMap::new(),
            tracker: PeerTracker::new(),
            seen_signals: HashSet::new(),
            pending_candidates: HashMap::new(),
            next_link_id: 1,
        }
    }

    /// Continue link numbering from a previous session so events from its
    /// links can never be mistaken for ours.
    pub fn starting_link_id(mut self, first: u64) -> Self {
        self.next_link_id = first.max(1);
        self
    }

    pub fn next_link_id(&self) -> u64 {
        self.next_link_id
    }

    pub fn room(&self) -> &RoomCode {
        &self.room
    }

    pub fn tracker(&self) -> &PeerTracker {
        &self.tracker
    }

    pub fn has_link(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        self.tracker.open_peers()
    }

    /// Start negotiating with `remote` as the initiator. Any existing link to
    /// that peer is replaced.
    pub async fn initiate(
        &mut self,
        remote: &PeerId,
    ) -> Result<(SignalMessage, Option<TransportEvent>), TransportError> {
        let replaced = self.replace_slot(remote);

        let offer = {
            let slot = self
                .links
                .get_mut(remote)
                .ok_or_else(|| TransportError::UnknownPeer(remote.clone()))?;
            slot.link.create_offer().await
        };

        match offer {
            Ok(sdp) => {
                debug!(remote = %remote.short(), "Created offer");
                Ok((self.signal_to(remote, SignalKind::Offer(sdp)), replaced))
            }
            Err(e) => {
                self.drop_slot(remote);
                Err(e)
            }
        }
    }

    /// Apply an inbound signaling message. Messages for another room or
    /// another recipient are ignored; link errors are logged and swallowed.
    pub async fn handle_signal(&mut self, message: SignalMessage) -> Vec<TransportEvent> {
        if message.room != self.room {
            debug!(room = %message.room, active = %self.room, "Ignoring signal for stale room");
            return Vec::new();
        }
        if message.target != self.local || message.sender == self.local {
            return Vec::new();
        }

        // Offers, answers and candidates carry negotiation tokens, so an
        // identical copy is a redelivery. Hangups carry nothing and may repeat.
        if !matches!(message.kind, SignalKind::Hangup) {
            let key = match signal_key(&message) {
                Ok(key) => key,
                Err(e) => {
                    warn!(sender = %message.sender.short(), error = %e, "Dropping unserializable signal");
                    return Vec::new();
                }
            };
            if !self.seen_signals.insert(key) {
                debug!(sender = %message.sender.short(), "Skipping redelivered signal");
                return Vec::new();
            }
        }

        let remote = message.sender.clone();
        let mut events = Vec::new();

        match &message.kind {
            SignalKind::Offer(sdp) => {
                if let Some(event) = self.replace_slot(&remote) {
                    events.push(event);
                }
                let answer = match self.links.get_mut(&remote) {
                    Some(slot) => slot.link.accept_offer(sdp).await,
                    None => return events,
                };
                match answer {
                    Ok(answer) => {
                        debug!(remote = %remote.short(), "Answering offer");
                        self.mark_described(&remote).await;
                        events.push(TransportEvent::Publish(
                            self.signal_to(&remote, SignalKind::Answer(answer)),
                        ));
                    }
                    Err(e) => {
                        warn!(remote = %remote.short(), error = %e, "Failed to accept offer");
                        self.drop_slot(&remote);
                    }
                }
            }

            SignalKind::Answer(sdp) => {
                let result = match self.links.get_mut(&remote) {
                    Some(slot) => slot.link.accept_answer(sdp).await,
                    None => {
                        debug!(remote = %remote.short(), "Answer without a pending offer");
                        return events;
                    }
                };
                match result {
                    Ok(()) => self.mark_described(&remote).await,
                    Err(e) => warn!(remote = %remote.short(), error = %e, "Failed to apply answer"),
                }
            }

            SignalKind::Candidate(candidate) => {
                let ready = self
                    .links
                    .get(&remote)
                    .map(|slot| slot.remote_described)
                    .unwrap_or(false);
                if ready {
                    self.apply_candidate(&remote, candidate).await;
                } else {
                    self.pending_candidates
                        .entry(remote.clone())
                        .or_default()
                        .push(candidate.clone());
                }
            }

            SignalKind::Hangup => {
                if self.drop_slot(&remote) {
                    events.push(TransportEvent::Closed {
                        peer: remote,
                        reason: CloseReason::Hangup,
                    });
                }
            }
        }

        events
    }

    /// Translate a raw link event. Events from links that were replaced or
    /// already closed are dropped. Frames that arrive before the local end
    /// reports open are held and delivered right after `Opened`.
    pub fn handle_link_event(&mut self, event: LinkEvent) -> Vec<TransportEvent> {
        let current = self
            .links
            .get(&event.peer)
            .map(|slot| slot.link_id == event.link_id)
            .unwrap_or(false);
        if !current {
            debug!(peer = %event.peer.short(), link = event.link_id, "Dropping stale link event");
            return Vec::new();
        }

        match event.kind {
            LinkEventKind::LocalCandidate(candidate) => {
                if let Some(slot) = self.links.get_mut(&event.peer) {
                    slot.relayed |= is_relay_candidate(&candidate);
                }
                vec![TransportEvent::Publish(
                    self.signal_to(&event.peer, SignalKind::Candidate(candidate)),
                )]
            }
            LinkEventKind::Open => {
                let (relayed, early) = match self.links.get_mut(&event.peer) {
                    Some(slot) => (slot.relayed, std::mem::take(&mut slot.early_frames)),
                    None => (false, Vec::new()),
                };
                self.tracker.on_open(&event.peer, relayed);

                let mut events = vec![TransportEvent::Opened {
                    mode: self.tracker.connection_mode(&event.peer),
                    peer: event.peer.clone(),
                }];
                events.extend(early.into_iter().map(|data| TransportEvent::Frame {
                    peer: event.peer.clone(),
                    data,
                }));
                events
            }
            LinkEventKind::Message(data) => {
                if self.tracker.is_open(&event.peer) {
                    return vec![TransportEvent::Frame {
                        peer: event.peer,
                        data,
                    }];
                }
                if let Some(slot) = self.links.get_mut(&event.peer) {
                    if slot.early_frames.len() < MAX_EARLY_FRAMES {
                        slot.early_frames.push(data);
                    } else {
                        warn!(peer = %event.peer.short(), "Too many frames before open, dropping");
                    }
                }
                Vec::new()
            }
            LinkEventKind::Closed => {
                self.drop_slot(&event.peer);
                vec![TransportEvent::Closed {
                    peer: event.peer,
                    reason: CloseReason::Remote,
                }]
            }
            LinkEventKind::Failed(reason) => {
                warn!(peer = %event.peer.short(), reason = %reason, "Peer link failed");
                self.drop_slot(&event.peer);
                vec![TransportEvent::Closed {
                    peer: event.peer,
                    reason: CloseReason::Failed(reason),
                }]
            }
        }
    }

    pub fn send(&self, peer: &PeerId, frame: &str) -> Result<(), TransportError> {
        let slot = self
            .links
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        slot.link.send(frame)
    }

    /// Send `frames` in order to every open peer except `except`. Returns the
    /// peers that received the whole sequence.
    pub fn broadcast(&self, frames: &[String], except: Option<&PeerId>) -> Vec<PeerId> {
        let mut reached = Vec::new();
        'peers: for peer in self.tracker.open_peers() {
            if Some(&peer) == except {
                continue;
            }
            for frame in frames {
                if let Err(e) = self.send(&peer, frame) {
                    warn!(peer = %peer.short(), error = %e, "Send failed");
                    continue 'peers;
                }
            }
            reached.push(peer);
        }
        reached
    }

    /// Close one peer. Returns the hangup to publish if a link existed.
    pub fn close_peer(&mut self, peer: &PeerId) -> Option<SignalMessage> {
        if self.drop_slot(peer) {
            Some(self.signal_to(peer, SignalKind::Hangup))
        } else {
            None
        }
    }

    /// Close every link and forget all negotiation state.
    pub fn close_all(&mut self) -> Vec<PeerId> {
        let peers: Vec<PeerId> = self.links.keys().cloned().collect();
        for peer in &peers {
            self.drop_slot(peer);
        }
        self.tracker.clear();
        self.seen_signals.clear();
        self.pending_candidates.clear();
        peers
    }

    fn signal_to(&self, target: &PeerId, kind: SignalKind) -> SignalMessage {
        SignalMessage {
            room: self.room.clone(),
            sender: self.local.clone(),
            target: target.clone(),
            kind,
        }
    }

    // Install a fresh link for `remote`. Reports the old link if it was open.
    fn replace_slot(&mut self, remote: &PeerId) -> Option<TransportEvent> {
        let was_open = self.tracker.is_open(remote);
        self.drop_slot(remote);

        let link_id = self.next_link_id;
        self.next_link_id += 1;
        let link = self
            .connector
            .connect(&self.local, remote, link_id, self.link_events.clone());
        self.links.insert(
            remote.clone(),
            LinkSlot {
                link,
                link_id,
                remote_described: false,
                relayed: false,
                early_frames: Vec::new(),
            },
        );
        self.tracker.on_negotiating(remote);

        was_open.then(|| TransportEvent::Closed {
            peer: remote.clone(),
            reason: CloseReason::Replaced,
        })
    }

    fn drop_slot(&mut self, peer: &PeerId) -> bool {
        self.tracker.on_closed(peer);
        match self.links.remove(peer) {
            Some(mut slot) => {
                slot.link.close();
                true
            }
            None => false,
        }
    }

    async fn mark_described(&mut self, remote: &PeerId) {
        if let Some(slot) = self.links.get_mut(remote) {
            slot.remote_described = true;
        }
        let pending = self.pending_candidates.remove(remote).unwrap_or_default();
        for candidate in pending {
            self.apply_candidate(remote, &candidate).await;
        }
    }

    async fn apply_candidate(&mut self, remote: &PeerId, candidate: &str) {
        let Some(slot) = self.links.get_mut(remote) else {
            return;
        };
        match slot.link.add_candidate(candidate).await {
            Ok(()) => slot.relayed |= is_relay_candidate(candidate),
            Err(e) => warn!(remote = %remote.short(), error = %e, "Failed to apply candidate"),
        }
    }
}

// Seen-set key: digest of the serialized signal message.
fn signal_key(message: &SignalMessage) -> Result<String, serde_json::Error> {
    let serialized = serde_json::to_vec(message)?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

fn is_relay_candidate(candidate: &str) -> bool {
    candidate.contains(" typ relay")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryNetwork;

    struct Side {
        session: TransportSession,
        rx: mpsc::UnboundedReceiver<LinkEvent>,
    }

    fn side(network: &MemoryNetwork, name: &str) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        Side {
            session: TransportSession::new(
                PeerId::new(name),
                RoomCode::parse("AB12CD").unwrap(),
                Arc::new(network.clone()),
                tx,
            ),
            rx,
        }
    }

    /// Route signaling and link events between sides until nothing moves.
    async fn settle(sides: &mut [Side], mut outbox: Vec<SignalMessage>) -> Vec<TransportEvent> {
        let mut seen = Vec::new();
        for _ in 0..32 {
            let mut progressed = false;
            for message in std::mem::take(&mut outbox) {
                progressed = true;
                let Some(target) = sides.iter_mut().find(|s| s.session.local == message.target)
                else {
                    continue;
                };
                for event in target.session.handle_signal(message).await {
                    match event {
                        TransportEvent::Publish(m) => outbox.push(m),
                        other => seen.push(other),
                    }
                }
            }
            for s in sides.iter_mut() {
                while let Ok(raw) = s.rx.try_recv() {
                    progressed = true;
                    for event in s.session.handle_link_event(raw) {
                        match event {
                            TransportEvent::Publish(m) => outbox.push(m),
                            other => seen.push(other),
                        }
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        seen
    }

    async fn connected_pair(network: &MemoryNetwork) -> Vec<Side> {
        let mut sides = vec![side(network, "host"), side(network, "guest")];
        let (offer, _) = sides[0].session.initiate(&PeerId::new("guest")).await.unwrap();
        settle(&mut sides, vec![offer]).await;
        sides
    }

    fn first_publish(s: &mut Side) -> SignalMessage {
        match s.session.handle_link_event(s.rx.try_recv().unwrap()).pop() {
            Some(TransportEvent::Publish(m)) => m,
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offer_answer_candidates_open_both() {
        let network = MemoryNetwork::new();
        let mut sides = vec![side(&network, "host"), side(&network, "guest")];

        let (offer, replaced) = sides[0].session.initiate(&PeerId::new("guest")).await.unwrap();
        assert!(replaced.is_none());
        let events = settle(&mut sides, vec![offer]).await;

        let opened = events
            .iter()
            .filter(|e| matches!(e, TransportEvent::Opened { .. }))
            .count();
        assert_eq!(opened, 2);
        assert_eq!(sides[0].session.open_peers(), vec![PeerId::new("guest")]);
        assert_eq!(sides[1].session.open_peers(), vec![PeerId::new("host")]);
    }

    #[tokio::test]
    async fn test_frames_flow_after_open() {
        let network = MemoryNetwork::new();
        let mut sides = connected_pair(&network).await;

        sides[0].session.send(&PeerId::new("guest"), "hi").unwrap();
        let raw = sides[1].rx.recv().await.unwrap();
        assert_eq!(
            sides[1].session.handle_link_event(raw),
            vec![TransportEvent::Frame {
                peer: PeerId::new("host"),
                data: "hi".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_frames_before_local_open_are_held() {
        let network = MemoryNetwork::new();
        let mut host = side(&network, "host");
        let mut guest = side(&network, "guest");

        let (offer, _) = host.session.initiate(&PeerId::new("guest")).await.unwrap();
        let host_candidate = first_publish(&mut host);
        let answer = match guest.session.handle_signal(offer).await.pop() {
            Some(TransportEvent::Publish(m)) => m,
            other => panic!("expected answer, got {other:?}"),
        };
        let guest_candidate = first_publish(&mut guest);

        // The host opens and sends before the guest has seen its candidate.
        host.session.handle_signal(answer).await;
        host.session.handle_signal(guest_candidate).await;
        let opened = host.session.handle_link_event(host.rx.try_recv().unwrap());
        assert!(matches!(opened[..], [TransportEvent::Opened { .. }]));
        host.session.send(&PeerId::new("guest"), "snapshot").unwrap();

        let early = guest.rx.try_recv().unwrap();
        assert!(guest.session.handle_link_event(early).is_empty());

        guest.session.handle_signal(host_candidate).await;
        let events = guest.session.handle_link_event(guest.rx.try_recv().unwrap());
        assert_eq!(
            events,
            vec![
                TransportEvent::Opened {
                    peer: PeerId::new("host"),
                    mode: ConnectionMode::Direct
                },
                TransportEvent::Frame {
                    peer: PeerId::new("host"),
                    data: "snapshot".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_redelivered_signals_not_reapplied() {
        let network = MemoryNetwork::new();
        let mut host = side(&network, "host");
        let mut guest = side(&network, "guest");

        let (offer, _) = host.session.initiate(&PeerId::new("guest")).await.unwrap();
        let candidate = first_publish(&mut host);

        assert_eq!(guest.session.handle_signal(offer.clone()).await.len(), 1);
        let link_id = guest.session.links[&PeerId::new("host")].link_id;
        guest.session.handle_signal(candidate.clone()).await;

        // Redelivery is a silent no-op rather than a rejected re-apply.
        assert!(guest.session.handle_signal(candidate).await.is_empty());
        assert!(guest.session.handle_signal(offer).await.is_empty());
        assert_eq!(guest.session.links[&PeerId::new("host")].link_id, link_id);
        assert_eq!(guest.session.seen_signals.len(), 2);
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered() {
        let network = MemoryNetwork::new();
        let mut sides = vec![side(&network, "host"), side(&network, "guest")];

        let (offer, _) = sides[0].session.initiate(&PeerId::new("guest")).await.unwrap();
        let candidate = first_publish(&mut sides[0]);

        // Candidate overtakes the offer.
        sides[1].session.handle_signal(candidate).await;
        assert_eq!(sides[1].session.pending_candidates.len(), 1);

        let events = settle(&mut sides, vec![offer]).await;
        assert!(sides[1].session.pending_candidates.is_empty());
        assert!(events.iter().any(|e| matches!(e, TransportEvent::Opened { .. })));
        assert_eq!(sides[1].session.open_peers(), vec![PeerId::new("host")]);
    }

    #[tokio::test]
    async fn test_signal_for_other_room_or_peer_ignored() {
        let network = MemoryNetwork::new();
        let mut guest = side(&network, "guest");

        let stale = SignalMessage {
            room: RoomCode::parse("ZZ99ZZ").unwrap(),
            sender: PeerId::new("host"),
            target: PeerId::new("guest"),
            kind: SignalKind::Offer("mem-offer:x".into()),
        };
        assert!(guest.session.handle_signal(stale).await.is_empty());

        let misaddressed = SignalMessage {
            room: RoomCode::parse("AB12CD").unwrap(),
            sender: PeerId::new("host"),
            target: PeerId::new("someone-else"),
            kind: SignalKind::Offer("mem-offer:x".into()),
        };
        assert!(guest.session.handle_signal(misaddressed).await.is_empty());
        assert!(!guest.session.has_link(&PeerId::new("host")));
    }

    #[tokio::test]
    async fn test_bad_offer_is_swallowed() {
        let network = MemoryNetwork::new();
        let mut guest = side(&network, "guest");
        let bogus = SignalMessage {
            room: RoomCode::parse("AB12CD").unwrap(),
            sender: PeerId::new("host"),
            target: PeerId::new("guest"),
            kind: SignalKind::Offer("garbage".into()),
        };
        assert!(guest.session.handle_signal(bogus).await.is_empty());
        assert!(!guest.session.has_link(&PeerId::new("host")));
    }

    #[tokio::test]
    async fn test_concurrent_negotiations_are_independent() {
        let network = MemoryNetwork::new();
        let mut sides = vec![
            side(&network, "host"),
            side(&network, "g1"),
            side(&network, "g2"),
        ];

        // Both offers are outstanding before either is answered.
        let (o1, _) = sides[0].session.initiate(&PeerId::new("g1")).await.unwrap();
        let (o2, _) = sides[0].session.initiate(&PeerId::new("g2")).await.unwrap();
        settle(&mut sides, vec![o2, o1]).await;

        assert_eq!(
            sides[0].session.open_peers(),
            vec![PeerId::new("g1"), PeerId::new("g2")]
        );
        assert_eq!(sides[1].session.open_peers(), vec![PeerId::new("host")]);
        assert_eq!(sides[2].session.open_peers(), vec![PeerId::new("host")]);
    }

    #[tokio::test]
    async fn test_remote_close_and_hangup() {
        let network = MemoryNetwork::new();
        let mut sides = connected_pair(&network).await;

        let hangup = sides[1].session.close_peer(&PeerId::new("host")).unwrap();
        assert_eq!(hangup.kind, SignalKind::Hangup);
        assert!(sides[1].session.open_peers().is_empty());

        let raw = sides[0].rx.recv().await.unwrap();
        assert_eq!(
            sides[0].session.handle_link_event(raw),
            vec![TransportEvent::Closed {
                peer: PeerId::new("guest"),
                reason: CloseReason::Remote
            }]
        );
        // A hangup for a link that is already gone produces nothing.
        assert!(sides[0].session.handle_signal(hangup).await.is_empty());
    }

    #[tokio::test]
    async fn test_reinitiate_replaces_open_link() {
        let network = MemoryNetwork::new();
        let mut sides = connected_pair(&network).await;

        let (_, replaced) = sides[0].session.initiate(&PeerId::new("guest")).await.unwrap();
        assert_eq!(
            replaced,
            Some(TransportEvent::Closed {
                peer: PeerId::new("guest"),
                reason: CloseReason::Replaced
            })
        );
        assert!(sides[0].session.open_peers().is_empty());
        assert!(sides[0].session.has_link(&PeerId::new("guest")));
    }

    #[tokio::test]
    async fn test_events_from_replaced_link_are_stale() {
        let network = MemoryNetwork::new();
        let mut sides = connected_pair(&network).await;
        let old_id = sides[0].session.links[&PeerId::new("guest")].link_id;

        sides[0].session.initiate(&PeerId::new("guest")).await.unwrap();
        let stale = LinkEvent {
            peer: PeerId::new("guest"),
            link_id: old_id,
            kind: LinkEventKind::Message("late".into()),
        };
        assert!(sides[0].session.handle_link_event(stale).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_peer() {
        let network = MemoryNetwork::new();
        let mut sides = vec![
            side(&network, "host"),
            side(&network, "g1"),
            side(&network, "g2"),
        ];
        let (o1, _) = sides[0].session.initiate(&PeerId::new("g1")).await.unwrap();
        let (o2, _) = sides[0].session.initiate(&PeerId::new("g2")).await.unwrap();
        settle(&mut sides, vec![o1, o2]).await;

        let reached = sides[0]
            .session
            .broadcast(&["a".to_string(), "b".to_string()], Some(&PeerId::new("g1")));
        assert_eq!(reached, vec![PeerId::new("g2")]);
        assert!(sides[1].rx.try_recv().is_err());
        assert_eq!(
            sides[2].rx.recv().await.unwrap().kind,
            LinkEventKind::Message("a".into())
        );
    }

    #[tokio::test]
    async fn test_link_ids_continue_across_sessions() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = TransportSession::new(
            PeerId::new("host"),
            RoomCode::parse("AB12CD").unwrap(),
            Arc::new(network.clone()),
            tx,
        )
        .starting_link_id(40);
        session.initiate(&PeerId::new("guest")).await.unwrap();
        assert_eq!(session.links[&PeerId::new("guest")].link_id, 40);
        assert_eq!(session.next_link_id(), 41);
    }

    #[tokio::test]
    async fn test_relayed_mode_detected() {
        let network = MemoryNetwork::new();
        network.set_relay_only(true);
        let sides = connected_pair(&network).await;
        assert_eq!(
            sides[0].session.tracker().connection_mode(&PeerId::new("guest")),
            ConnectionMode::Relayed
        );
    }

    #[tokio::test]
    async fn test_close_all_clears_everything() {
        let network = MemoryNetwork::new();
        let mut sides = connected_pair(&network).await;

        let closed = sides[0].session.close_all();
        assert_eq!(closed, vec![PeerId::new("guest")]);
        assert!(sides[0].session.seen_signals.is_empty());
        assert_eq!(sides[0].session.tracker().peer_count(), 0);
    }

    #[test]
    fn test_signal_keys_distinguish_messages() {
        let offer = |payload: &str| SignalMessage {
            room: RoomCode::parse("AB12CD").unwrap(),
            sender: PeerId::new("host"),
            target: PeerId::new("guest"),
            kind: SignalKind::Offer(payload.into()),
        };
        let a = signal_key(&offer("mem-offer:a")).unwrap();
        assert_eq!(a, signal_key(&offer("mem-offer:a")).unwrap());
        assert_ne!(a, signal_key(&offer("mem-offer:b")).unwrap());
        assert_eq!(a.len(), 64);
    }
}
