//! # plansync-server
//!
//! Authentication and relay backend for rooms that cannot sync peer to peer.
//!
//! - **Room init/login**: mints a per-room salt and checks the client's
//!   derived auth hash; the first login claims the room
//! - **Encrypted record storage**: one opaque ciphertext per task, never
//!   decrypted here
//! - **Change push**: a WebSocket per session streams other sessions' writes
//! - **REST API** (axum) with per-IP rate limiting, CORS and request tracing

pub mod api;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod rooms;

pub use api::{build_router, serve, AppState};
pub use config::ServerConfig;
pub use error::ServerError;
pub use rate_limit::RateLimiter;
pub use rooms::{RoomChange, RoomStore};
