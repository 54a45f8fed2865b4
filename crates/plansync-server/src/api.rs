use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, Method},
    middleware,
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use plansync_shared::protocol::{InitResponse, LoginRequest, LoginResponse};
use plansync_shared::{RelayRecord, TaskId};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::rooms::{RoomChange, RoomStore};

#[derive(Clone)]
pub struct AppState {
    pub rooms: RoomStore,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            rooms: RoomStore::new(config.max_records_per_room),
            rate_limiter: RateLimiter::from_config(&config),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/rooms/:room/init", post(room_init))
        .route("/rooms/:room/login", post(room_login))
        .route("/rooms/:room/events", get(list_events))
        .route("/rooms/:room/stream", get(stream_events))
        .route("/rooms/:room/events/bulk", post(bulk_save_events))
        .route("/rooms/:room/events/:id", put(save_event).delete(delete_event))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    rooms: usize,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct SavedResponse {
    saved: usize,
}

#[derive(Serialize)]
struct DeletedResponse {
    deleted: bool,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        rooms: state.rooms.room_count().await,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn room_init(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Result<Json<InitResponse>, ServerError> {
    state.rooms.init(&room).await.map(Json)
}

async fn room_login(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ServerError> {
    state.rooms.login(&room, &request).await.map(Json)
}

async fn list_events(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Result<Json<Vec<RelayRecord>>, ServerError> {
    let token = bearer_token(&headers)?;
    state.rooms.records(&room, token).await.map(Json)
}

async fn save_event(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((room, id)): Path<(String, String)>,
    Json(record): Json<RelayRecord>,
) -> Result<Json<SavedResponse>, ServerError> {
    let token = bearer_token(&headers)?;
    if record.id.as_str() != id {
        return Err(ServerError::BadRequest(format!(
            "Record id {} does not match path {id}",
            record.id
        )));
    }

    state.rooms.save(&room, token, record).await?;
    debug!(room = %room, task = %id, "Record saved");
    Ok(Json(SavedResponse { saved: 1 }))
}

async fn delete_event(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((room, id)): Path<(String, String)>,
) -> Result<Json<DeletedResponse>, ServerError> {
    let token = bearer_token(&headers)?;
    let deleted = state.rooms.delete(&room, token, &TaskId::new(id)).await?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn bulk_save_events(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(records): Json<Vec<RelayRecord>>,
) -> Result<Json<SavedResponse>, ServerError> {
    let token = bearer_token(&headers)?;
    let saved = records.len();
    let total = state.rooms.save_all(&room, token, records).await?;
    debug!(room = %room, saved, total, "Bulk save");
    Ok(Json(SavedResponse { saved }))
}

/// Upgrade to a WebSocket that pushes other sessions' writes as
/// `RelayEvent` JSON text frames.
async fn stream_events(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Result<Response, ServerError> {
    let token = bearer_token(&headers)?.to_string();
    let changes = state.rooms.subscribe(&room, &token).await?;
    debug!(room = %room, "Change stream opened");
    Ok(ws.on_upgrade(move |socket| push_changes(socket, room, token, changes)))
}

async fn push_changes(
    mut socket: WebSocket,
    room: String,
    token: String,
    mut changes: broadcast::Receiver<RoomChange>,
) {
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) if change.origin == token => {}
                Ok(change) => {
                    let text = match change.event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(room = %room, error = %e, "Could not encode change");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // The client refetches after the stream ends.
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(room = %room, missed, "Subscriber fell behind, closing stream");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(room = %room, "Change stream closed");
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ServerError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ServerError::Unauthorized)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
