//! Shared helpers: a live server on a free port and raw WebSocket clients.

#![allow(dead_code)]

use folio_collab::access::StaticAccess;
use folio_collab::protocol::Envelope;
use folio_collab::server::{ServerConfig, SyncServer};
use folio_collab::storage::{DocumentRecord, DocumentStore, Repository, StoreConfig};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// A running server backed by a temporary store.
///
/// Users: `alice`, `bob`, `carol` belong to `project`; `mallory` belongs to
/// nothing. Each user's token is `t-<name>`.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<SyncServer>,
    pub store: Arc<DocumentStore>,
    pub project: Uuid,
    shutdown: Option<oneshot::Sender<()>>,
    _dir: TempDir,
}

pub async fn start_test_server() -> TestServer {
    start_with(ServerConfig::default()).await
}

pub async fn start_with(mut config: ServerConfig) -> TestServer {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let project = Uuid::new_v4();

    let mut access = StaticAccess::new();
    for user in ["alice", "bob", "carol"] {
        access = access.with_token(format!("t-{user}"), user).with_grant(user, project);
    }
    access = access.with_token("t-mallory", "mallory");

    config.bind_addr = "127.0.0.1:0".to_string();
    let server = Arc::new(SyncServer::new(config, store.clone(), Arc::new(access)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let serving = server.clone();
    tokio::spawn(async move {
        serving
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        server,
        store,
        project,
        shutdown: Some(tx),
        _dir: dir,
    }
}

impl TestServer {
    /// Create a page in the shared project.
    pub fn page(&self, title: &str) -> DocumentRecord {
        let doc = DocumentRecord::new(self.project, title);
        self.store.put_document(&doc).unwrap();
        doc
    }

    pub fn url(&self, token: &str, page: Uuid) -> String {
        format!("ws://{}/ws?page_id={page}&token={token}", self.addr)
    }

    /// Connect with the token in the query string.
    pub async fn connect(&self, token: &str, page: Uuid) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(self.url(token, page)).await.unwrap();
        ws
    }

    /// Connect with an `Authorization: Bearer` header.
    pub async fn connect_bearer(&self, token: &str, page: Uuid) -> Result<Ws, WsError> {
        let mut request = format!("ws://{}/ws?page_id={page}", self.addr)
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        tokio_tungstenite::connect_async(request).await.map(|(ws, _)| ws)
    }

    /// Attempt an upgrade that should be refused; returns the HTTP status.
    pub async fn refused_status(&self, url: &str, origin: Option<&str>) -> u16 {
        let mut request = url.into_client_request().unwrap();
        if let Some(origin) = origin {
            request
                .headers_mut()
                .insert("Origin", HeaderValue::from_str(origin).unwrap());
        }
        match tokio_tungstenite::connect_async(request).await {
            Err(WsError::Http(response)) => response.status().as_u16(),
            Err(e) => panic!("expected an HTTP refusal, got {e}"),
            Ok(_) => panic!("upgrade unexpectedly accepted"),
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub async fn send(ws: &mut Ws, envelope: &Envelope) {
    ws.send(Message::text(envelope.encode().unwrap())).await.unwrap();
}

pub async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::text(text.to_string())).await.unwrap();
}

/// Next text frame, skipping control frames.
pub async fn recv_text(ws: &mut Ws) -> String {
    loop {
        match timeout(RECV_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return text.as_str().to_string(),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(Some(Ok(other))) => panic!("unexpected frame: {other:?}"),
            Ok(Some(Err(e))) => panic!("socket error: {e}"),
            Ok(None) => panic!("socket closed"),
            Err(_) => panic!("timed out waiting for a text frame"),
        }
    }
}

pub async fn recv(ws: &mut Ws) -> Envelope {
    Envelope::decode(&recv_text(ws).await).unwrap()
}

/// Assert no text frame arrives within `wait`.
pub async fn assert_silent(ws: &mut Ws, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match timeout(remaining, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected message: {}", text.as_str()),
            Ok(other) => panic!("unexpected socket event: {other:?}"),
        }
    }
}

/// Sync round trip: send `sync_request` and return the decoded deltas.
pub async fn sync(ws: &mut Ws, page: Uuid) -> Vec<Vec<u8>> {
    send(ws, &Envelope::sync_request(page)).await;
    let response = recv(ws).await.sync_response_payload().unwrap();
    response
        .updates
        .iter()
        .map(|u| folio_collab::protocol::decode_bytes(u).unwrap())
        .collect()
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..60 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
