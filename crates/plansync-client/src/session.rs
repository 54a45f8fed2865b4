//! Sync session actor.
//!
//! The session runs in a dedicated tokio task. The application talks to it
//! through a [`SyncHandle`] and hears back through [`SyncNotification`]s.
//! Everything that can suspend (signaling calls, key derivation) runs in
//! spawned tasks that report back over an internal channel tagged with the
//! epoch they were started under.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use plansync_net::{
    encode_frames, split_frames, CloseReason, LinkEvent, LivenessTracker, PeerConnector,
    Reassembler, RoomRecord, SignalEvent, SignalingChannel, SignalingError, TransportEvent,
    TransportSession,
};
use plansync_shared::crypto::{decrypt_json, encrypt_json, Salt};
use plansync_shared::{
    ClassColors, PeerAnnouncement, PeerId, PlansyncError, Role, RoomCode, SignalMessage,
    SyncStatus, TaskId, TaskRecord, WireMessage,
};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::SyncNotification;
use crate::lifecycle::{derive_keys, Lifecycle, RoomContext};
use crate::reconcile::TaskStore;

type RoomReply = oneshot::Sender<Result<RoomCode, SyncError>>;

// Attempts at finding an unused room code before giving up.
const CREATE_ATTEMPTS: usize = 4;

// ---------------------------------------------------------------------------
// Command / snapshot types
// ---------------------------------------------------------------------------

/// Commands sent *into* the session task.
#[derive(Debug)]
enum Command {
    CreateRoom {
        password: String,
        reply: RoomReply,
    },
    JoinRoom {
        code: RoomCode,
        password: String,
        reply: RoomReply,
    },
    Leave(oneshot::Sender<()>),
    ReplaceTasks(Vec<TaskRecord>),
    UpsertTask(TaskRecord),
    DeleteTask(TaskId),
    SetClassColors(ClassColors),
    Snapshot(oneshot::Sender<Snapshot>),
    Stats(oneshot::Sender<SyncStats>),
    Shutdown,
}

/// Results of spawned work, reported back to the session task.
enum Internal {
    RoomReady {
        epoch: u64,
        result: Result<(RoomContext, mpsc::UnboundedReceiver<SignalEvent>), SyncError>,
        reply: RoomReply,
    },
    Signal {
        epoch: u64,
        event: SignalEvent,
    },
}

/// Signaling writes, performed in order by the pump task.
enum Outbound {
    Signal(SignalMessage),
    Announce(RoomCode, PeerAnnouncement),
}

/// The replicated state as the session currently holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tasks: Vec<TaskRecord>,
    pub class_colors: ClassColors,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub room: Option<RoomCode>,
    pub role: Option<Role>,
    pub open_peers: Vec<PeerId>,
    pub relayed_peers: usize,
    pub tasks: usize,
    /// Snapshots broadcast because of a local change
    pub broadcasts: u64,
    /// Local changes held back by the settle window
    pub suppressed: u64,
    /// Peer snapshots the host relayed to the rest of the room
    pub forwarded: u64,
    /// Remote snapshots applied
    pub remote_applied: u64,
    /// Peers with a partially received chunked message
    pub pending_chunks: usize,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    /// Create a room as host. Resolves once the room exists and is
    /// authenticated; peers connect afterwards.
    pub async fn create_room(&self, password: &str) -> Result<RoomCode, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateRoom {
            password: password.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Join an existing room. Fails with `AuthenticationFailed` on a wrong
    /// password and `RoomNotFound` for an unknown code.
    pub async fn join_room(&self, code: &RoomCode, password: &str) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::JoinRoom {
            code: code.clone(),
            password: password.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?.map(|_| ())
    }

    /// Leave the current room. Peers are closed before this returns.
    pub async fn leave(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Leave(reply)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn replace_tasks(&self, tasks: Vec<TaskRecord>) -> Result<(), SyncError> {
        self.send(Command::ReplaceTasks(tasks)).await
    }

    pub async fn upsert_task(&self, task: TaskRecord) -> Result<(), SyncError> {
        self.send(Command::UpsertTask(task)).await
    }

    pub async fn delete_task(&self, id: TaskId) -> Result<(), SyncError> {
        self.send(Command::DeleteTask(id)).await
    }

    pub async fn set_class_colors(&self, class_colors: ClassColors) -> Result<(), SyncError> {
        self.send(Command::SetClassColors(class_colors)).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn stats(&self) -> Result<SyncStats, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) -> Result<(), SyncError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }
}

/// Spawn the sync session in a background tokio task.
///
/// Returns the handle for driving it and the receiver for its
/// notifications.
pub fn spawn_session(
    config: SyncConfig,
    local_peer: PeerId,
    signaling: Arc<dyn SignalingChannel>,
    connector: Arc<dyn PeerConnector>,
) -> (SyncHandle, mpsc::Receiver<SyncNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SyncNotification>(256);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<Internal>();
    let (link_tx, link_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let (lifecycle, status_rx) = Lifecycle::new();

    let session = Session {
        store: TaskStore::new(config.settle_window),
        liveness: LivenessTracker::new(config.heartbeat_timeout),
        config,
        local: local_peer,
        signaling,
        connector,
        lifecycle,
        transport: None,
        reassembler: Reassembler::new(),
        seen_nonces: HashSet::new(),
        next_link_id: 1,
        internal_tx,
        link_tx,
        notif_tx,
        forwarder: None,
        pump: None,
        stats: SyncStats::default(),
    };

    tokio::spawn(session.run(cmd_rx, internal_rx, link_rx));

    (SyncHandle { cmd_tx, status_rx }, notif_rx)
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Pump {
    tx: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

struct Session {
    config: SyncConfig,
    local: PeerId,
    signaling: Arc<dyn SignalingChannel>,
    connector: Arc<dyn PeerConnector>,
    lifecycle: Lifecycle,
    store: TaskStore,
    transport: Option<TransportSession>,
    reassembler: Reassembler,
    liveness: LivenessTracker,
    /// Announcement nonces the host has acted on
    seen_nonces: HashSet<String>,
    next_link_id: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    notif_tx: mpsc::Sender<SyncNotification>,
    forwarder: Option<JoinHandle<()>>,
    pump: Option<Pump>,
    stats: SyncStats,
}

impl Session {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(peer = %self.local.short(), "Sync session started");

        loop {
            tokio::select! {
                // --- Application commands ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) => {
                            info!("Sync session shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("Command channel closed, shutting down sync session");
                            break;
                        }
                    }
                }

                // --- Completions of spawned work ---
                Some(internal) = internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }

                // --- Link events ---
                Some(event) = link_rx.recv() => {
                    self.handle_link_event(event);
                }

                // --- Heartbeat ---
                _ = heartbeat.tick() => {
                    self.on_heartbeat();
                }
            }
        }

        self.leave_room();
        info!("Sync session terminated");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::CreateRoom { password, reply } => self.start_create(password, reply),
            Command::JoinRoom {
                code,
                password,
                reply,
            } => self.start_join(code, password, reply),
            Command::Leave(reply) => {
                self.leave_room();
                let _ = reply.send(());
            }
            Command::ReplaceTasks(tasks) => {
                let changed = self.store.replace_tasks(tasks).changed;
                self.local_changed(changed);
            }
            Command::UpsertTask(task) => {
                let changed = self.store.upsert(task).changed;
                self.local_changed(changed);
            }
            Command::DeleteTask(id) => {
                let changed = self.store.delete(&id).changed;
                self.local_changed(changed);
            }
            Command::SetClassColors(colors) => {
                let changed = self.store.set_class_colors(colors).changed;
                self.local_changed(changed);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Snapshot {
                    tasks: self.store.tasks().to_vec(),
                    class_colors: self.store.class_colors().clone(),
                });
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.current_stats());
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    // -- Room setup --

    fn start_create(&mut self, password: String, reply: RoomReply) {
        self.leave_room();
        let epoch = self.lifecycle.begin();
        self.refresh_status();

        let signaling = self.signaling.clone();
        let internal_tx = self.internal_tx.clone();
        let local = self.local.clone();
        let rounds = self.config.kdf_iterations;

        tokio::spawn(async move {
            let result = create_room(signaling, local, password, rounds).await;
            let _ = internal_tx.send(Internal::RoomReady {
                epoch,
                result,
                reply,
            });
        });
    }

    fn start_join(&mut self, code: RoomCode, password: String, reply: RoomReply) {
        self.leave_room();
        let epoch = self.lifecycle.begin();
        self.refresh_status();

        let signaling = self.signaling.clone();
        let internal_tx = self.internal_tx.clone();
        let rounds = self.config.kdf_iterations;

        tokio::spawn(async move {
            let result = join_room(signaling, code, password, rounds).await;
            let _ = internal_tx.send(Internal::RoomReady {
                epoch,
                result,
                reply,
            });
        });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::RoomReady {
                epoch,
                result,
                reply,
            } => self.on_room_ready(epoch, result, reply),

            Internal::Signal { epoch, event } => {
                if !self.lifecycle.is_current(epoch) {
                    debug!(epoch, "Dropping signal from a previous room");
                    return;
                }
                self.handle_signal_event(event).await;
            }
        }
    }

    fn on_room_ready(
        &mut self,
        epoch: u64,
        result: Result<(RoomContext, mpsc::UnboundedReceiver<SignalEvent>), SyncError>,
        reply: RoomReply,
    ) {
        if !self.lifecycle.is_current(epoch) {
            debug!(epoch, "Discarding superseded room setup");
            if let Ok((ctx, _)) = result {
                if ctx.role == Role::Host {
                    self.spawn_signaling_leave(ctx.code);
                }
            }
            let _ = reply.send(Err(SyncError::Cancelled));
            return;
        }

        let (ctx, events) = match result {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "Room setup failed");
                self.lifecycle.failed(epoch);
                self.refresh_status();
                if e == SyncError::AuthenticationFailed {
                    self.notify(SyncNotification::AuthenticationFailed);
                }
                let _ = reply.send(Err(e));
                return;
            }
        };

        let code = ctx.code.clone();
        let role = ctx.role;
        let announcement = PeerAnnouncement::new(self.local.clone(), ctx.keys.auth.clone());

        if !self.lifecycle.authenticated(epoch, ctx) {
            let _ = reply.send(Err(SyncError::Cancelled));
            return;
        }

        self.transport = Some(
            TransportSession::new(
                self.local.clone(),
                code.clone(),
                self.connector.clone(),
                self.link_tx.clone(),
            )
            .starting_link_id(self.next_link_id),
        );
        self.spawn_forwarder(epoch, events);
        self.spawn_pump();

        if role == Role::Peer {
            self.queue(Outbound::Announce(code.clone(), announcement));
        }

        self.refresh_status();
        let _ = reply.send(Ok(code));
    }

    fn spawn_forwarder(&mut self, epoch: u64, mut events: mpsc::UnboundedReceiver<SignalEvent>) {
        let internal_tx = self.internal_tx.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if internal_tx.send(Internal::Signal { epoch, event }).is_err() {
                    break;
                }
            }
            debug!(epoch, "Signaling subscription ended");
        }));
    }

    fn spawn_pump(&mut self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let signaling = self.signaling.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let result = match item {
                    Outbound::Signal(message) => signaling.publish(message).await,
                    Outbound::Announce(code, announcement) => {
                        signaling.announce(&code, announcement).await
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "Signaling write failed");
                }
            }
        });
        self.pump = Some(Pump { tx, task });
    }

    fn spawn_signaling_leave(&self, code: RoomCode) {
        let signaling = self.signaling.clone();
        let local = self.local.clone();
        tokio::spawn(async move {
            if let Err(e) = signaling.leave(&code, &local).await {
                debug!(room = %code, error = %e, "Signaling leave failed");
            }
        });
    }

    fn queue(&self, item: Outbound) {
        if let Some(pump) = &self.pump {
            let _ = pump.tx.send(item);
        }
    }

    /// Synchronously tear down the room: close every peer, forget all
    /// tracking, drop the key.
    fn leave_room(&mut self) {
        if self.lifecycle.is_idle() && self.transport.is_none() {
            return;
        }

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(pump) = self.pump.take() {
            pump.task.abort();
        }

        if let Some(mut transport) = self.transport.take() {
            for peer in transport.close_all() {
                if self.liveness.last_seen(&peer).is_some() {
                    self.notify(SyncNotification::PeerDisconnected { peer });
                }
            }
            self.next_link_id = transport.next_link_id();
        }
        self.liveness.clear();
        self.reassembler.clear();
        self.seen_nonces.clear();

        if let Some(ctx) = self.lifecycle.leave() {
            info!(room = %ctx.code, "Left room");
            self.spawn_signaling_leave(ctx.code);
        }
        self.refresh_status();
    }

    // -- Signaling --

    async fn handle_signal_event(&mut self, event: SignalEvent) {
        let Some(ctx) = self.lifecycle.room() else {
            return;
        };
        let role = ctx.role;

        match event {
            SignalEvent::PeerAnnounced(announcement) => {
                if role != Role::Host || announcement.peer == self.local {
                    return;
                }
                if !ctx.keys.auth.matches(announcement.auth.as_str()) {
                    warn!(peer = %announcement.peer.short(), "Ignoring announcement with a bad credential");
                    return;
                }
                if !self.seen_nonces.insert(announcement.nonce.clone()) {
                    debug!(peer = %announcement.peer.short(), "Ignoring redelivered announcement");
                    return;
                }
                self.initiate(&announcement.peer).await;
            }

            SignalEvent::PeerLeft(peer) => {
                let closed = self
                    .transport
                    .as_mut()
                    .and_then(|t| t.close_peer(&peer))
                    .is_some();
                if closed {
                    info!(peer = %peer.short(), "Peer left the room");
                    self.on_peer_closed(&peer);
                }
            }

            SignalEvent::Signal(message) => {
                let events = match self.transport.as_mut() {
                    Some(transport) => transport.handle_signal(message).await,
                    None => return,
                };
                for event in events {
                    self.handle_transport_event(event);
                }
            }

            SignalEvent::RoomClosed => {
                if role == Role::Peer {
                    info!("Host closed the room");
                    self.leave_room();
                }
            }
        }
    }

    async fn initiate(&mut self, remote: &PeerId) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.initiate(remote).await {
            Ok((offer, replaced)) => {
                if let Some(event) = replaced {
                    self.handle_transport_event(event);
                }
                debug!(peer = %remote.short(), "Sending offer");
                self.queue(Outbound::Signal(offer));
            }
            Err(e) => {
                warn!(peer = %remote.short(), error = %e, "Could not start negotiation");
                self.notify(SyncNotification::TransportError {
                    peer: Some(remote.clone()),
                    message: e.to_string(),
                });
            }
        }
    }

    // -- Transport --

    fn handle_link_event(&mut self, event: LinkEvent) {
        let translated = match self.transport.as_mut() {
            Some(transport) => transport.handle_link_event(event),
            None => return,
        };
        for event in translated {
            self.handle_transport_event(event);
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Publish(message) => self.queue(Outbound::Signal(message)),

            TransportEvent::Opened { peer, mode } => {
                info!(peer = %peer.short(), mode = ?mode, "Peer channel open");
                self.liveness.track(&peer, Instant::now());
                self.notify(SyncNotification::PeerConnected {
                    peer: peer.clone(),
                    mode,
                });
                self.refresh_status();

                let is_host = self.lifecycle.room().map(|c| c.role) == Some(Role::Host);
                if is_host {
                    self.send_snapshot_to(&peer);
                }
            }

            TransportEvent::Frame { peer, data } => self.handle_frame(&peer, data),

            TransportEvent::Closed { peer, reason } => {
                match &reason {
                    CloseReason::Failed(why) => {
                        self.notify(SyncNotification::TransportError {
                            peer: Some(peer.clone()),
                            message: why.clone(),
                        });
                    }
                    other => debug!(peer = %peer.short(), reason = ?other, "Peer link closed"),
                }
                self.on_peer_closed(&peer);
            }
        }
    }

    fn on_peer_closed(&mut self, peer: &PeerId) {
        let was_open = self.liveness.last_seen(peer).is_some();
        self.liveness.forget(peer);
        self.reassembler.discard(peer);
        if was_open {
            self.notify(SyncNotification::PeerDisconnected { peer: peer.clone() });
        }
        self.refresh_status();
    }

    fn handle_frame(&mut self, peer: &PeerId, data: String) {
        self.liveness.touch(peer, Instant::now());

        let message = match WireMessage::from_json(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "Dropping malformed frame");
                return;
            }
        };

        match message {
            WireMessage::Ping => self.send_frames(peer, &[pong_frame()]),
            WireMessage::Pong => {}
            WireMessage::Chunk { index, total, data } => {
                match self.reassembler.accept(peer, index, total, data) {
                    Ok(Some(text)) => self.handle_envelope(peer, &text),
                    Ok(None) => {}
                    Err(e) => warn!(peer = %peer.short(), error = %e, "Discarding chunked message"),
                }
            }
            WireMessage::SyncUpdate { .. } => self.handle_envelope(peer, &data),
        }
    }

    /// A complete SYNC_UPDATE, as text.
    fn handle_envelope(&mut self, peer: &PeerId, text: &str) {
        let Some(ctx) = self.lifecycle.room() else {
            return;
        };
        let is_host = ctx.role == Role::Host;

        let (tasks, colors) = match decode_snapshot(ctx, text) {
            Ok(decoded) => decoded,
            Err(PlansyncError::Crypto(e)) => {
                warn!(peer = %peer.short(), error = %e, "Could not decrypt snapshot");
                self.store.mark_undecryptable(peer, Instant::now());
                self.notify(SyncNotification::DecryptionFailed { from: peer.clone() });
                return;
            }
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "Dropping invalid snapshot");
                return;
            }
        };

        let count = self.store.apply_snapshot(tasks, colors, Instant::now());
        self.stats.remote_applied += 1;
        debug!(peer = %peer.short(), tasks = count, "Applied remote snapshot");
        self.notify(SyncNotification::RemoteApplied {
            from: peer.clone(),
            tasks: count,
        });

        if is_host {
            self.forward(peer, text);
        }
    }

    // Hub: relay a peer's envelope as-is to everyone else.
    fn forward(&mut self, from: &PeerId, text: &str) {
        let Some(transport) = &self.transport else {
            return;
        };
        let frames = match split_frames(text, self.config.chunk_size) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "Could not frame snapshot for forwarding");
                return;
            }
        };
        let reached = transport.broadcast(&frames, Some(from));
        if !reached.is_empty() {
            self.stats.forwarded += 1;
            debug!(from = %from.short(), peers = reached.len(), "Forwarded snapshot");
        }
    }

    // -- Outbound --

    fn local_changed(&mut self, changed: bool) {
        if self.lifecycle.room().is_none() {
            return;
        }
        if !self.store.should_broadcast(changed, Instant::now()) {
            if changed {
                self.stats.suppressed += 1;
                debug!("Local change inside settle window, not broadcasting");
            }
            return;
        }

        let Some(frames) = self.snapshot_frames() else {
            return;
        };
        self.stats.broadcasts += 1;
        if let Some(transport) = &self.transport {
            let reached = transport.broadcast(&frames, None);
            debug!(peers = reached.len(), frames = frames.len(), "Broadcast snapshot");
        }
    }

    fn send_snapshot_to(&mut self, peer: &PeerId) {
        if let Some(frames) = self.snapshot_frames() {
            debug!(peer = %peer.short(), frames = frames.len(), "Sending initial snapshot");
            self.send_frames(peer, &frames);
        }
    }

    fn snapshot_frames(&self) -> Option<Vec<String>> {
        let ctx = self.lifecycle.room()?;
        match encode_snapshot(ctx, &self.store, self.config.chunk_size) {
            Ok(frames) => Some(frames),
            Err(e) => {
                warn!(error = %e, "Could not encode snapshot");
                None
            }
        }
    }

    fn send_frames(&mut self, peer: &PeerId, frames: &[String]) {
        let Some(transport) = &self.transport else {
            return;
        };
        for frame in frames {
            if let Err(e) = transport.send(peer, frame) {
                warn!(peer = %peer.short(), error = %e, "Send failed");
                self.notify(SyncNotification::TransportError {
                    peer: Some(peer.clone()),
                    message: e.to_string(),
                });
                return;
            }
        }
    }

    // -- Heartbeat --

    fn on_heartbeat(&mut self) {
        let Some(ctx) = self.lifecycle.room() else {
            return;
        };
        let role = ctx.role;
        let host = ctx.host.clone();
        let code = ctx.code.clone();
        let auth = ctx.keys.auth.clone();

        for peer in self.liveness.expired(Instant::now()) {
            warn!(peer = %peer.short(), "Peer heartbeat timed out");
            let hangup = self.transport.as_mut().and_then(|t| t.close_peer(&peer));
            if let Some(hangup) = hangup {
                self.queue(Outbound::Signal(hangup));
            }
            self.on_peer_closed(&peer);
        }

        if let Some(transport) = &self.transport {
            transport.broadcast(&[ping_frame()], None);

            if role == Role::Peer && !transport.has_link(&host) {
                debug!(host = %host.short(), "No link to host, announcing again");
                self.queue(Outbound::Announce(
                    code,
                    PeerAnnouncement::new(self.local.clone(), auth),
                ));
            }
        }
    }

    // -- Status & notifications --

    fn refresh_status(&mut self) {
        let open = self
            .transport
            .as_ref()
            .map(|t| t.tracker().open_count())
            .unwrap_or(0);
        if let Some(status) = self.lifecycle.refresh(open) {
            self.notify(SyncNotification::StatusChanged(status));
        }
    }

    fn notify(&self, notification: SyncNotification) {
        if let Err(e) = self.notif_tx.try_send(notification) {
            debug!(error = %e, "Notification dropped");
        }
    }

    fn current_stats(&self) -> SyncStats {
        let ctx = self.lifecycle.room();
        SyncStats {
            room: ctx.map(|c| c.code.clone()),
            role: ctx.map(|c| c.role),
            open_peers: self
                .transport
                .as_ref()
                .map(|t| t.open_peers())
                .unwrap_or_default(),
            relayed_peers: self
                .transport
                .as_ref()
                .map(|t| t.tracker().relayed_count())
                .unwrap_or(0),
            tasks: self.store.len(),
            pending_chunks: self.reassembler.pending_peers(),
            ..self.stats.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Spawned room setup
// ---------------------------------------------------------------------------

async fn create_room(
    signaling: Arc<dyn SignalingChannel>,
    local: PeerId,
    password: String,
    rounds: u32,
) -> Result<(RoomContext, mpsc::UnboundedReceiver<SignalEvent>), SyncError> {
    let salt = Salt::generate();

    for _ in 0..CREATE_ATTEMPTS {
        let code = RoomCode::generate();
        let keys = derive_keys(code.as_str(), &password, salt, rounds).await?;
        let record = RoomRecord {
            code: code.clone(),
            host: local.clone(),
            salt,
            verifier: keys.auth.clone(),
            created_at: chrono::Utc::now(),
        };

        match signaling.create_room(record).await {
            Ok(()) => {}
            Err(SignalingError::RoomExists(taken)) => {
                debug!(room = %taken, "Room code taken, generating another");
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        let events = signaling.subscribe(&code).await?;
        info!(room = %code, "Room created");
        let ctx = RoomContext {
            code,
            role: Role::Host,
            host: local,
            keys,
        };
        return Ok((ctx, events));
    }

    Err(SyncError::Signaling(SignalingError::Unavailable(
        "no free room code".into(),
    )))
}

async fn join_room(
    signaling: Arc<dyn SignalingChannel>,
    code: RoomCode,
    password: String,
    rounds: u32,
) -> Result<(RoomContext, mpsc::UnboundedReceiver<SignalEvent>), SyncError> {
    let record = signaling
        .get_room(&code)
        .await?
        .ok_or_else(|| SyncError::RoomNotFound(code.clone()))?;

    let keys = derive_keys(code.as_str(), &password, record.salt, rounds).await?;
    if !record.verifier.matches(keys.auth.as_str()) {
        warn!(room = %code, "Room password rejected");
        return Err(SyncError::AuthenticationFailed);
    }

    let events = signaling.subscribe(&code).await?;
    info!(room = %code, host = %record.host.short(), "Joined room");
    Ok((
        RoomContext {
            code,
            role: Role::Peer,
            host: record.host,
            keys,
        },
        events,
    ))
}

// ---------------------------------------------------------------------------
// Envelope helpers
// ---------------------------------------------------------------------------

fn encode_snapshot(
    ctx: &RoomContext,
    store: &TaskStore,
    chunk_size: usize,
) -> Result<Vec<String>, PlansyncError> {
    let message = WireMessage::SyncUpdate {
        events: encrypt_json(&ctx.keys.data, &store.shareable_tasks())?,
        class_colors: encrypt_json(&ctx.keys.data, store.class_colors())?,
        timestamp: chrono::Utc::now().timestamp_millis(),
    };
    encode_frames(&message, chunk_size).map_err(|e| match e {
        plansync_net::FramingError::Serialization(e) => PlansyncError::Serialization(e),
        other => PlansyncError::Protocol(plansync_shared::ProtocolError::Malformed(
            other.to_string(),
        )),
    })
}

fn decode_snapshot(
    ctx: &RoomContext,
    text: &str,
) -> Result<(Vec<TaskRecord>, ClassColors), PlansyncError> {
    match WireMessage::from_json(text)? {
        WireMessage::SyncUpdate {
            events,
            class_colors,
            ..
        } => {
            let tasks: Vec<TaskRecord> = decrypt_json(&ctx.keys.data, &events)?;
            let colors: ClassColors = decrypt_json(&ctx.keys.data, &class_colors)?;
            Ok((tasks, colors))
        }
        other => Err(PlansyncError::Protocol(
            plansync_shared::ProtocolError::Malformed(format!(
                "expected SYNC_UPDATE, got {other:?}"
            )),
        )),
    }
}

fn ping_frame() -> String {
    r#"{"type":"PING"}"#.to_string()
}

fn pong_frame() -> String {
    r#"{"type":"PONG"}"#.to_string()
}
