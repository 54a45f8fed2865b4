//! [`RelayBackend`] over HTTP, talking to `plansync-server`. Pushed changes
//! arrive over a WebSocket on `/rooms/:room/stream`.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use plansync_shared::protocol::{InitResponse, LoginRequest, LoginResponse};
use plansync_shared::{RelayEvent, RelayRecord, TaskId};

use crate::config::SyncConfig;
use crate::relay::{RelayBackend, RelayChange, RelayError};

/// Pushed changes buffered before the reader task waits on the application.
const CHANGE_BUFFER: usize = 256;

type ChangeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: Client,
    base_url: String,
}

impl HttpRelay {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// The configured relay, if `relay_url` is set.
    pub fn from_config(config: &SyncConfig) -> Option<Self> {
        config.relay_url.as_deref().map(Self::new)
    }

    fn url(&self, room: &str, path: &str) -> String {
        format!("{}/rooms/{}{}", self.base_url, room, path)
    }

    fn stream_url(&self, room: &str) -> Result<String, RelayError> {
        let url = self.url(room, "/stream");
        if let Some(rest) = url.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = url.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(RelayError::Network(format!("unsupported relay url {url}")))
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RelayError> {
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        debug!(status = status.as_u16(), "Relay request rejected");
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RelayError::Unauthorized,
            StatusCode::NOT_FOUND => RelayError::NotFound,
            _ => RelayError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            },
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RelayError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| RelayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RelayBackend for HttpRelay {
    async fn init(&self, room: &str) -> Result<InitResponse, RelayError> {
        self.send_json(self.client.post(self.url(room, "/init"))).await
    }

    async fn login(&self, room: &str, request: LoginRequest) -> Result<LoginResponse, RelayError> {
        self.send_json(self.client.post(self.url(room, "/login")).json(&request))
            .await
    }

    async fn fetch(&self, room: &str, token: &str) -> Result<Vec<RelayRecord>, RelayError> {
        self.send_json(self.client.get(self.url(room, "/events")).bearer_auth(token))
            .await
    }

    async fn save(&self, room: &str, token: &str, record: RelayRecord) -> Result<(), RelayError> {
        let url = self.url(room, &format!("/events/{}", record.id));
        self.send(self.client.put(url).bearer_auth(token).json(&record))
            .await
            .map(|_| ())
    }

    async fn delete(&self, room: &str, token: &str, id: &TaskId) -> Result<(), RelayError> {
        let url = self.url(room, &format!("/events/{id}"));
        self.send(self.client.delete(url).bearer_auth(token))
            .await
            .map(|_| ())
    }

    async fn bulk_save(
        &self,
        room: &str,
        token: &str,
        records: Vec<RelayRecord>,
    ) -> Result<(), RelayError> {
        let url = self.url(room, "/events/bulk");
        self.send(self.client.post(url).bearer_auth(token).json(&records))
            .await
            .map(|_| ())
    }

    async fn subscribe(&self, room: &str, token: &str) -> Result<mpsc::Receiver<RelayChange>, RelayError> {
        let mut request = self
            .stream_url(room)?
            .into_client_request()
            .map_err(|e| RelayError::Network(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| RelayError::Network(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (socket, _) = connect_async(request).await.map_err(handshake_error)?;
        debug!(room = %room, "Subscribed to relay changes");

        let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
        tokio::spawn(forward_changes(socket, tx, room.to_string()));
        Ok(rx)
    }
}

fn handshake_error(e: tungstenite::Error) -> RelayError {
    match e {
        tungstenite::Error::Http(response) => match response.status().as_u16() {
            401 | 403 => RelayError::Unauthorized,
            404 => RelayError::NotFound,
            status => RelayError::Http {
                status,
                message: String::from_utf8_lossy(response.body().as_deref().unwrap_or_default())
                    .into_owned(),
            },
        },
        other => RelayError::Network(other.to_string()),
    }
}

// Runs until the server ends the stream or the receiver is dropped.
async fn forward_changes(mut socket: ChangeSocket, tx: mpsc::Sender<RelayChange>, room: String) {
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => match RelayEvent::from_json(&text) {
                    Ok(event) => {
                        if tx.send(event.into()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(room = %room, error = %e, "Ignoring malformed relay change"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(room = %room, error = %e, "Relay change stream failed");
                    break;
                }
            },
        }
    }
    let _ = socket.close(None).await;
    debug!(room = %room, "Relay change stream ended");
}
