//! Relay path: tasks stored on an authentication/relay backend instead of
//! travelling peer to peer.
//!
//! Every record is encrypted on its own with the room data key. Local
//! writes are applied optimistically and rolled back if the backend call
//! fails.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use plansync_shared::crypto::{decrypt_json, encrypt_json, Salt};
use plansync_shared::protocol::{InitResponse, LoginRequest, LoginResponse};
use plansync_shared::{RelayEvent, RelayRecord, RoomKeys, TaskId, TaskRecord};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::lifecycle::derive_keys;
use crate::reconcile::{RemoteChange, TaskStore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay rejected the credentials")]
    Unauthorized,

    #[error("Not found on relay")]
    NotFound,

    #[error("Relay returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Relay unreachable: {0}")]
    Network(String),

    #[error("Invalid relay response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait RelayBackend: Send + Sync {
    /// Fetch or mint the room salt.
    async fn init(&self, room: &str) -> Result<InitResponse, RelayError>;

    async fn login(&self, room: &str, request: LoginRequest) -> Result<LoginResponse, RelayError>;

    async fn fetch(&self, room: &str, token: &str) -> Result<Vec<RelayRecord>, RelayError>;

    async fn save(&self, room: &str, token: &str, record: RelayRecord) -> Result<(), RelayError>;

    async fn delete(&self, room: &str, token: &str, id: &TaskId) -> Result<(), RelayError>;

    async fn bulk_save(
        &self,
        room: &str,
        token: &str,
        records: Vec<RelayRecord>,
    ) -> Result<(), RelayError>;

    /// Feed of writes other sessions make to the room. The receiver yields
    /// `None` once the backend drops the feed.
    async fn subscribe(&self, room: &str, token: &str) -> Result<mpsc::Receiver<RelayChange>, RelayError>;
}

/// A change pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayChange {
    Saved(RelayRecord),
    Deleted(TaskId),
}

impl From<RelayEvent> for RelayChange {
    fn from(event: RelayEvent) -> Self {
        match event {
            RelayEvent::Saved { record } => RelayChange::Saved(record),
            RelayEvent::Deleted { id } => RelayChange::Deleted(id),
        }
    }
}

pub struct RelaySession<B: RelayBackend> {
    backend: B,
    room_id: String,
    token: String,
    keys: RoomKeys,
    store: TaskStore,
}

impl<B: RelayBackend> RelaySession<B> {
    /// Initialize the room, authenticate and load its records.
    pub async fn connect(
        backend: B,
        room_id: &str,
        password: &str,
        config: &SyncConfig,
    ) -> Result<Self, SyncError> {
        let init = backend.init(room_id).await?;
        let salt = Salt::from_hex(&init.salt)?;
        let keys = derive_keys(room_id, password, salt, config.kdf_iterations).await?;

        let login = backend
            .login(
                room_id,
                LoginRequest {
                    auth_hash: keys.auth.as_str().to_string(),
                    salt: init.salt.clone(),
                },
            )
            .await
            .map_err(|e| match e {
                RelayError::Unauthorized => SyncError::AuthenticationFailed,
                other => SyncError::Relay(other),
            })?;

        info!(room = %room_id, new_room = init.is_new, "Relay session authenticated");

        let mut session = Self {
            backend,
            room_id: room_id.to_string(),
            token: login.token,
            keys,
            store: TaskStore::new(config.settle_window),
        };
        session.refresh().await?;
        Ok(session)
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        self.store.tasks()
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Reload everything from the backend. Returns the task count.
    pub async fn refresh(&mut self) -> Result<usize, SyncError> {
        let records = self.backend.fetch(&self.room_id, &self.token).await?;
        let tasks: Vec<TaskRecord> = records.iter().map(|r| self.open_record(r)).collect();
        let colors = self.store.class_colors().clone();
        let count = self.store.apply_snapshot(tasks, colors, Instant::now());
        debug!(room = %self.room_id, count, "Relay records loaded");
        Ok(count)
    }

    /// Open the backend's change feed. Apply what arrives with
    /// [`apply_remote`](Self::apply_remote); once the feed ends, `refresh`
    /// and subscribe again.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<RelayChange>, SyncError> {
        Ok(self.backend.subscribe(&self.room_id, &self.token).await?)
    }

    /// Wait for the next pushed change and apply it. `None` once the feed
    /// ends.
    pub async fn apply_next(&mut self, changes: &mut mpsc::Receiver<RelayChange>) -> Option<bool> {
        let change = changes.recv().await?;
        Some(self.apply_remote(change))
    }

    /// Apply a change pushed by the backend. Returns whether anything changed.
    pub fn apply_remote(&mut self, change: RelayChange) -> bool {
        let change = match change {
            RelayChange::Saved(record) => RemoteChange::Upsert(self.open_record(&record)),
            RelayChange::Deleted(id) => RemoteChange::Delete(id),
        };
        self.store.apply_change(change, Instant::now())
    }

    pub async fn save_task(&mut self, task: TaskRecord) -> Result<(), SyncError> {
        let record = self.seal(&task)?;
        let id = task.id.clone();
        let mutation = self.store.upsert(task);

        if let Err(e) = self.backend.save(&self.room_id, &self.token, record).await {
            warn!(task = %id, error = %e, "Relay save failed, rolling back");
            self.store.restore(&id, mutation.previous);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn delete_task(&mut self, id: &TaskId) -> Result<(), SyncError> {
        let mutation = self.store.delete(id);

        if let Err(e) = self.backend.delete(&self.room_id, &self.token, id).await {
            warn!(task = %id, error = %e, "Relay delete failed, rolling back");
            if let Some(removed) = mutation.previous {
                self.store.reinsert(removed);
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn bulk_save(&mut self, tasks: Vec<TaskRecord>) -> Result<(), SyncError> {
        let records = tasks
            .iter()
            .map(|t| self.seal(t))
            .collect::<Result<Vec<_>, _>>()?;

        let mut undo = Vec::with_capacity(tasks.len());
        for task in tasks {
            let id = task.id.clone();
            undo.push((id, self.store.upsert(task).previous));
        }

        if let Err(e) = self
            .backend
            .bulk_save(&self.room_id, &self.token, records)
            .await
        {
            warn!(count = undo.len(), error = %e, "Relay bulk save failed, rolling back");
            for (id, previous) in undo.into_iter().rev() {
                self.store.restore(&id, previous);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn seal(&self, task: &TaskRecord) -> Result<RelayRecord, SyncError> {
        Ok(RelayRecord {
            id: task.id.clone(),
            payload: encrypt_json(&self.keys.data, task)?,
            updated_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    // Records that fail to decrypt stay visible as placeholders.
    fn open_record(&self, record: &RelayRecord) -> TaskRecord {
        match decrypt_json::<TaskRecord>(&self.keys.data, &record.payload) {
            Ok(mut task) => {
                task.id = record.id.clone();
                task
            }
            Err(e) => {
                warn!(task = %record.id, error = %e, "Could not decrypt relay record");
                TaskRecord::undecryptable(record.id.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use plansync_shared::constants::UNDECRYPTABLE_TITLE;
    use plansync_shared::crypto::encrypt;

    const ROOM: &str = "study-group";

    #[derive(Default)]
    struct State {
        salt: Option<Salt>,
        verifier: Option<String>,
        records: HashMap<TaskId, RelayRecord>,
        subscribers: Vec<mpsc::Sender<RelayChange>>,
        fail_writes: bool,
    }

    impl State {
        fn push(&mut self, change: RelayChange) {
            self.subscribers.retain(|tx| tx.try_send(change.clone()).is_ok());
        }
    }

    #[derive(Clone, Default)]
    struct FakeRelay {
        state: Arc<Mutex<State>>,
    }

    impl FakeRelay {
        fn fail_writes(&self, fail: bool) {
            self.state.lock().unwrap().fail_writes = fail;
        }

        fn write_guard(&self) -> Result<std::sync::MutexGuard<'_, State>, RelayError> {
            let state = self.state.lock().unwrap();
            if state.fail_writes {
                return Err(RelayError::Network("connection reset".into()));
            }
            Ok(state)
        }
    }

    #[async_trait]
    impl RelayBackend for FakeRelay {
        async fn init(&self, _room: &str) -> Result<InitResponse, RelayError> {
            let mut state = self.state.lock().unwrap();
            let is_new = state.salt.is_none();
            let salt = *state.salt.get_or_insert_with(Salt::generate);
            Ok(InitResponse {
                salt: salt.to_hex(),
                is_new,
            })
        }

        async fn login(&self, _room: &str, request: LoginRequest) -> Result<LoginResponse, RelayError> {
            let mut state = self.state.lock().unwrap();
            let verifier = state
                .verifier
                .get_or_insert_with(|| request.auth_hash.clone());
            if *verifier != request.auth_hash {
                return Err(RelayError::Unauthorized);
            }
            Ok(LoginResponse {
                token: "token".into(),
            })
        }

        async fn fetch(&self, _room: &str, _token: &str) -> Result<Vec<RelayRecord>, RelayError> {
            let state = self.state.lock().unwrap();
            let mut records: Vec<RelayRecord> = state.records.values().cloned().collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(records)
        }

        async fn save(&self, _room: &str, _token: &str, record: RelayRecord) -> Result<(), RelayError> {
            let mut state = self.write_guard()?;
            state.records.insert(record.id.clone(), record.clone());
            state.push(RelayChange::Saved(record));
            Ok(())
        }

        async fn delete(&self, _room: &str, _token: &str, id: &TaskId) -> Result<(), RelayError> {
            let mut state = self.write_guard()?;
            if state.records.remove(id).is_some() {
                state.push(RelayChange::Deleted(id.clone()));
            }
            Ok(())
        }

        async fn bulk_save(
            &self,
            _room: &str,
            _token: &str,
            records: Vec<RelayRecord>,
        ) -> Result<(), RelayError> {
            let mut state = self.write_guard()?;
            for record in records {
                state.records.insert(record.id.clone(), record.clone());
                state.push(RelayChange::Saved(record));
            }
            Ok(())
        }

        async fn subscribe(&self, _room: &str, _token: &str) -> Result<mpsc::Receiver<RelayChange>, RelayError> {
            let (tx, rx) = mpsc::channel(64);
            self.state.lock().unwrap().subscribers.push(tx);
            Ok(rx)
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            kdf_iterations: 1_000,
            ..SyncConfig::default()
        }
    }

    fn task(id: &str, title: &str) -> TaskRecord {
        TaskRecord::with_id(TaskId::new(id), title)
    }

    #[tokio::test]
    async fn test_save_then_reconnect_sees_records() {
        let relay = FakeRelay::default();
        let mut session = RelaySession::connect(relay.clone(), ROOM, "pw", &config()).await.unwrap();
        session.save_task(task("a", "Essay")).await.unwrap();
        session.save_task(task("b", "Lab")).await.unwrap();

        let other = RelaySession::connect(relay.clone(), ROOM, "pw", &config()).await.unwrap();
        let titles: Vec<&str> = other.tasks().iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Essay", "Lab"]);

        // The backend only ever holds ciphertext.
        let stored = relay.state.lock().unwrap().records[&TaskId::new("a")].clone();
        assert!(!stored.payload.data.contains("Essay"));
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let relay = FakeRelay::default();
        RelaySession::connect(relay.clone(), ROOM, "right", &config()).await.unwrap();

        let result = RelaySession::connect(relay, ROOM, "wrong", &config()).await;
        assert_eq!(result.err(), Some(SyncError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back() {
        let relay = FakeRelay::default();
        let mut session = RelaySession::connect(relay.clone(), ROOM, "pw", &config()).await.unwrap();
        session.save_task(task("a", "v1")).await.unwrap();

        relay.fail_writes(true);
        let err = session.save_task(task("a", "v2")).await.unwrap_err();
        assert!(matches!(err, SyncError::Relay(RelayError::Network(_))));
        assert_eq!(session.tasks()[0].title, "v1");

        assert!(session.save_task(task("new", "x")).await.is_err());
        assert_eq!(session.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_and_bulk_roll_back() {
        let relay = FakeRelay::default();
        let mut session = RelaySession::connect(relay.clone(), ROOM, "pw", &config()).await.unwrap();
        session
            .bulk_save(vec![task("a", "A"), task("b", "B")])
            .await
            .unwrap();

        relay.fail_writes(true);
        assert!(session.delete_task(&TaskId::new("a")).await.is_err());
        assert!(session
            .bulk_save(vec![task("b", "B2"), task("c", "C")])
            .await
            .is_err());

        let titles: Vec<&str> = session.tasks().iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let relay = FakeRelay::default();
        let mut session = RelaySession::connect(relay, ROOM, "pw", &config()).await.unwrap();
        session.save_task(task("a", "A")).await.unwrap();
        session.delete_task(&TaskId::new("a")).await.unwrap();
        session.delete_task(&TaskId::new("a")).await.unwrap();
        assert!(session.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_undecryptable_record_becomes_placeholder() {
        let relay = FakeRelay::default();
        let mut session = RelaySession::connect(relay.clone(), ROOM, "pw", &config()).await.unwrap();

        let foreign_key = plansync_shared::crypto::derive_room_keys_with_rounds(
            "elsewhere",
            "other",
            &Salt::generate(),
            1,
        )
        .unwrap();
        relay.state.lock().unwrap().records.insert(
            TaskId::new("x"),
            RelayRecord {
                id: TaskId::new("x"),
                payload: encrypt(&foreign_key.data, b"{}").unwrap(),
                updated_at: 0,
            },
        );

        session.refresh().await.unwrap();
        assert_eq!(session.tasks().len(), 1);
        assert_eq!(session.tasks()[0].id, TaskId::new("x"));
        assert_eq!(session.tasks()[0].title, UNDECRYPTABLE_TITLE);
    }

    #[tokio::test]
    async fn test_pushed_changes_apply() {
        let relay = FakeRelay::default();
        let mut writer = RelaySession::connect(relay.clone(), ROOM, "pw", &config()).await.unwrap();
        let mut reader = RelaySession::connect(relay.clone(), ROOM, "pw", &config()).await.unwrap();
        let mut changes = reader.subscribe().await.unwrap();

        writer.save_task(task("a", "A")).await.unwrap();
        assert_eq!(reader.apply_next(&mut changes).await, Some(true));
        assert_eq!(reader.tasks()[0].title, "A");
        assert!(reader.store().settling(Instant::now()));

        writer.delete_task(&TaskId::new("a")).await.unwrap();
        assert_eq!(reader.apply_next(&mut changes).await, Some(true));
        assert!(reader.tasks().is_empty());

        // A repeated delete is not pushed and would change nothing anyway.
        writer.delete_task(&TaskId::new("a")).await.unwrap();
        assert!(changes.try_recv().is_err());
        assert!(!reader.apply_remote(RelayChange::Deleted(TaskId::new("a"))));
    }
}
