//! In-memory room registry.
//!
//! A room holds its salt, the verifier claimed by the first login, the
//! bearer tokens issued for it, its records and a broadcast channel that
//! pushes every write to the room's live subscribers. Records are kept
//! exactly as the client sealed them; nothing here can read a task.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use plansync_shared::crypto::{AuthCredential, Salt};
use plansync_shared::protocol::{InitResponse, LoginRequest, LoginResponse};
use plansync_shared::{RelayEvent, RelayRecord, TaskId};

use crate::error::ServerError;

const MAX_ROOM_ID_LEN: usize = 64;

/// Logins beyond this evict the room's oldest token.
pub const MAX_TOKENS_PER_ROOM: usize = 64;

/// Pushed changes buffered per subscriber before it lags.
const CHANGE_BUFFER: usize = 256;

/// A write, tagged with the token that made it so its author can skip it.
#[derive(Debug, Clone)]
pub struct RoomChange {
    pub origin: String,
    pub event: RelayEvent,
}

#[derive(Debug)]
struct Room {
    salt: Salt,
    verifier: Option<AuthCredential>,
    tokens: VecDeque<String>,
    records: Vec<RelayRecord>,
    changes: broadcast::Sender<RoomChange>,
    last_active: Instant,
}

impl Room {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            salt: Salt::generate(),
            verifier: None,
            tokens: VecDeque::new(),
            records: Vec::new(),
            changes,
            last_active: Instant::now(),
        }
    }

    fn issue_token(&mut self) -> String {
        let token = Uuid::new_v4().to_string();
        if self.tokens.len() >= MAX_TOKENS_PER_ROOM {
            self.tokens.pop_front();
        }
        self.tokens.push_back(token.clone());
        token
    }

    fn publish(&self, origin: &str, event: RelayEvent) {
        // No receivers is the common case.
        let _ = self.changes.send(RoomChange {
            origin: origin.to_string(),
            event,
        });
    }

    fn idle(&self, now: Instant, max_idle: Duration) -> bool {
        self.records.is_empty()
            && self.changes.receiver_count() == 0
            && now.duration_since(self.last_active) > max_idle
    }
}

#[derive(Clone)]
pub struct RoomStore {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    max_records: usize,
}

impl RoomStore {
    /// `max_records` caps each room (0 = unlimited).
    pub fn new(max_records: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            max_records,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Return the room's salt, minting the room on first use.
    pub async fn init(&self, room_id: &str) -> Result<InitResponse, ServerError> {
        validate_room_id(room_id)?;

        let mut rooms = self.rooms.write().await;
        let is_new = !rooms.contains_key(room_id);
        let room = rooms.entry(room_id.to_string()).or_insert_with(Room::new);
        room.last_active = Instant::now();
        if is_new {
            info!(room = %room_id, "Room initialized");
        }

        Ok(InitResponse {
            salt: room.salt.to_hex(),
            is_new,
        })
    }

    /// Check the auth hash and issue a bearer token. The first login claims
    /// the room.
    pub async fn login(
        &self,
        room_id: &str,
        request: &LoginRequest,
    ) -> Result<LoginResponse, ServerError> {
        if request.auth_hash.is_empty() || hex::decode(&request.auth_hash).is_err() {
            return Err(ServerError::BadRequest("authHash must be hex".into()));
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| ServerError::RoomNotFound(room_id.to_string()))?;

        if room.salt.to_hex() != request.salt.to_ascii_lowercase() {
            return Err(ServerError::BadRequest("Salt does not match room".into()));
        }

        match &room.verifier {
            Some(verifier) if !verifier.matches(&request.auth_hash.to_ascii_lowercase()) => {
                warn!(room = %room_id, "Login rejected");
                return Err(ServerError::Unauthorized);
            }
            Some(_) => {}
            None => {
                info!(room = %room_id, "Room claimed by first login");
                room.verifier = Some(AuthCredential::from_hex(request.auth_hash.clone()));
            }
        }

        let token = room.issue_token();
        room.last_active = Instant::now();
        debug!(room = %room_id, sessions = room.tokens.len(), "Issued relay token");
        Ok(LoginResponse { token })
    }

    pub async fn records(&self, room_id: &str, token: &str) -> Result<Vec<RelayRecord>, ServerError> {
        let rooms = self.rooms.read().await;
        let room = authorize(&rooms, room_id, token)?;
        Ok(room.records.clone())
    }

    /// Insert or replace in place.
    pub async fn save(
        &self,
        room_id: &str,
        token: &str,
        record: RelayRecord,
    ) -> Result<(), ServerError> {
        self.save_all(room_id, token, vec![record]).await.map(|_| ())
    }

    /// Save several records under one lock. All or nothing: a batch that
    /// would overflow the room is rejected whole. Returns the room size.
    pub async fn save_all(
        &self,
        room_id: &str,
        token: &str,
        records: Vec<RelayRecord>,
    ) -> Result<usize, ServerError> {
        let mut rooms = self.rooms.write().await;
        let room = authorize_mut(&mut rooms, room_id, token)?;

        let fresh: HashSet<&TaskId> = records
            .iter()
            .map(|r| &r.id)
            .filter(|id| !room.records.iter().any(|existing| &existing.id == *id))
            .collect();
        if self.max_records > 0 && room.records.len() + fresh.len() > self.max_records {
            return Err(ServerError::RoomFull {
                max: self.max_records,
            });
        }

        for record in records {
            match room.records.iter_mut().find(|r| r.id == record.id) {
                Some(slot) => *slot = record.clone(),
                None => room.records.push(record.clone()),
            }
            room.publish(token, RelayEvent::Saved { record });
        }
        room.last_active = Instant::now();
        Ok(room.records.len())
    }

    /// Idempotent. Returns whether a record was removed.
    pub async fn delete(&self, room_id: &str, token: &str, id: &TaskId) -> Result<bool, ServerError> {
        let mut rooms = self.rooms.write().await;
        let room = authorize_mut(&mut rooms, room_id, token)?;
        let before = room.records.len();
        room.records.retain(|r| &r.id != id);
        room.last_active = Instant::now();

        let removed = room.records.len() != before;
        if removed {
            room.publish(token, RelayEvent::Deleted { id: id.clone() });
        }
        Ok(removed)
    }

    /// Live feed of the room's writes.
    pub async fn subscribe(
        &self,
        room_id: &str,
        token: &str,
    ) -> Result<broadcast::Receiver<RoomChange>, ServerError> {
        let rooms = self.rooms.read().await;
        let room = authorize(&rooms, room_id, token)?;
        Ok(room.changes.subscribe())
    }

    /// Drop rooms that hold no records, have no subscribers and have seen
    /// no activity for `max_idle`. Returns how many were removed.
    pub async fn purge_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, room| !room.idle(now, max_idle));
        before - rooms.len()
    }
}

fn authorize<'a>(
    rooms: &'a HashMap<String, Room>,
    room_id: &str,
    token: &str,
) -> Result<&'a Room, ServerError> {
    let room = rooms
        .get(room_id)
        .ok_or_else(|| ServerError::RoomNotFound(room_id.to_string()))?;
    if !room.tokens.iter().any(|t| t == token) {
        return Err(ServerError::Unauthorized);
    }
    Ok(room)
}

fn authorize_mut<'a>(
    rooms: &'a mut HashMap<String, Room>,
    room_id: &str,
    token: &str,
) -> Result<&'a mut Room, ServerError> {
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| ServerError::RoomNotFound(room_id.to_string()))?;
    if !room.tokens.iter().any(|t| t == token) {
        return Err(ServerError::Unauthorized);
    }
    Ok(room)
}

fn validate_room_id(room_id: &str) -> Result<(), ServerError> {
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(ServerError::BadRequest(format!("Invalid room id: {room_id:?}")));
    }
    Ok(())
}
