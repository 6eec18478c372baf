//! WebSocket live-editing endpoint.
//!
//! Architecture:
//! ```text
//!  TCP accept ──► handshake gate ──────────────► upgrade ──► RoomManager::register
//!                 │ Origin allow-list     → 403                 │
//!                 │ token (Bearer/?token) → 401                 ├── read pump ──► MessageRouter
//!                 │ ?page_id=<uuid>       → 400                 │                   │
//!                 │ page exists           → 404                 │                   ├── Repository
//!                 │ project access        → 403                 │                   └── broadcast
//!                 ▼                                             └── write pump ◄── client queue
//!              refused before upgrade, no client created
//! ```
//!
//! The gate runs inside the tungstenite header callback, so a rejected
//! request never becomes a WebSocket and never reaches the hub. An accepted
//! connection is bound to one page for its whole life.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use uuid::Uuid;

use crate::access::{AccessControl, AccessError, OriginPolicy, UserId};
use crate::hub::RoomManager;
use crate::router::MessageRouter;
use crate::storage::Repository;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Browser origins allowed to upgrade; `"*"` admits any. Requests
    /// without an `Origin` header are always admitted.
    pub allowed_origins: Vec<String>,
    /// Outbound messages buffered per client before fan-out drops
    pub queue_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Largest accepted inbound message, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            allowed_origins: Vec::new(),
            queue_capacity: 256,
            heartbeat_interval_secs: 30,
            max_message_size: 16 << 20,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Handshake Gate ──────────────────────────────────────────────────────────

/// Identity and page bound to an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub user_id: UserId,
    pub document_id: Uuid,
}

/// Pre-upgrade checks. Every refusal is an HTTP error response.
pub struct HandshakeGate {
    origins: OriginPolicy,
    access: Arc<dyn AccessControl>,
    repo: Arc<dyn Repository>,
}

impl HandshakeGate {
    pub fn new(origins: OriginPolicy, access: Arc<dyn AccessControl>, repo: Arc<dyn Repository>) -> Self {
        Self { origins, access, repo }
    }

    pub fn check(&self, request: &Request) -> Result<Grant, ErrorResponse> {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .map(|value| value.to_str().unwrap_or_default());
        if !self.origins.permits(origin) {
            return Err(refuse(StatusCode::FORBIDDEN, "origin not allowed"));
        }

        let query = QueryParams::from_request(request);

        let token = bearer_token(request)
            .or(query.token)
            .ok_or_else(|| refuse(StatusCode::UNAUTHORIZED, "missing access token"))?;
        let user_id = self.access.authenticate(&token).map_err(|e| match e {
            AccessError::InvalidToken => refuse(StatusCode::UNAUTHORIZED, "invalid access token"),
            AccessError::Backend(reason) => {
                log::error!("Access backend failed during authentication: {reason}");
                refuse(StatusCode::INTERNAL_SERVER_ERROR, "access check unavailable")
            }
        })?;

        let document_id = query
            .page_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| refuse(StatusCode::BAD_REQUEST, "missing or invalid page_id"))?;

        let document = match self.repo.get_document(document_id) {
            Ok(Some(doc)) => doc,
            Ok(None) => return Err(refuse(StatusCode::NOT_FOUND, "page not found")),
            Err(e) => {
                log::error!("Failed to load page {document_id} for handshake: {e}");
                return Err(refuse(StatusCode::INTERNAL_SERVER_ERROR, "page lookup failed"));
            }
        };

        match self.access.can_access_project(&user_id, document.project_id) {
            Ok(true) => Ok(Grant { user_id, document_id }),
            Ok(false) => Err(refuse(StatusCode::FORBIDDEN, "no access to this page")),
            Err(e) => {
                log::error!("Access backend failed for project {}: {e}", document.project_id);
                Err(refuse(StatusCode::INTERNAL_SERVER_ERROR, "access check unavailable"))
            }
        }
    }
}

#[derive(Default)]
struct QueryParams {
    token: Option<String>,
    page_id: Option<String>,
}

impl QueryParams {
    fn from_request(request: &Request) -> Self {
        let mut params = Self::default();
        if let Some(query) = request.uri().query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "token" => params.token = Some(value.into_owned()),
                    "page_id" => params.page_id = Some(value.into_owned()),
                    _ => {}
                }
            }
        }
        params
    }
}

fn bearer_token(request: &Request) -> Option<String> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn refuse(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

// ─── Server ──────────────────────────────────────────────────────────────────

struct Shared {
    gate: HandshakeGate,
    hub: Arc<RoomManager>,
    router: Arc<MessageRouter>,
    stats: AtomicServerStats,
    ws_config: WebSocketConfig,
}

/// The live-editing server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, repo: Arc<dyn Repository>, access: Arc<dyn AccessControl>) -> Self {
        let hub = Arc::new(RoomManager::new(config.queue_capacity, config.heartbeat()));
        let router = Arc::new(MessageRouter::new(repo.clone(), hub.clone()));
        let gate = HandshakeGate::new(OriginPolicy::new(&config.allowed_origins), access, repo);
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(config.max_message_size))
            .max_frame_size(Some(config.max_message_size));

        Self {
            config,
            shared: Arc::new(Shared {
                gate,
                hub,
                router,
                stats: AtomicServerStats::default(),
                ws_config,
            }),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// close every live client.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Sync server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        shared.handle_connection(stream, addr).await;
                    });
                }
            }
        }

        self.shared.hub.close_all().await;
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        let hub = self.shared.hub.stats().await;
        let stats = &self.shared.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: stats.rejected_handshakes.load(Ordering::Relaxed),
            total_messages: hub.frames_received,
            total_bytes: hub.bytes_received,
            active_rooms: hub.rooms,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get room manager reference.
    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.shared.hub
    }
}

impl Shared {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut grant = None;
        let callback = |request: &Request, response: Response| match self.gate.check(request) {
            Ok(g) => {
                grant = Some(g);
                Ok(response)
            }
            Err(refusal) => {
                log::info!("Refused upgrade from {addr}: {}", refusal.status());
                Err(refusal)
            }
        };

        let handshake =
            tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(self.ws_config)).await;
        let (socket, grant) = match (handshake, grant) {
            (Ok(socket), Some(grant)) => (socket, grant),
            (Ok(_), None) => return,
            (Err(e), _) => {
                self.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                log::debug!("Handshake with {addr} failed: {e}");
                return;
            }
        };

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "WebSocket connection from {addr}: user {} on page {}",
            grant.user_id,
            grant.document_id
        );

        let (client, queue) = self.hub.new_client(grant.user_id, grant.document_id);
        if let Some(pumps) = self.hub.register(client, queue, socket, self.router.clone()).await {
            pumps.join().await;
        }

        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection from {addr} closed");
    }
}
