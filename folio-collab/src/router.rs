//! Per-connection message routing.
//!
//! The read pump hands every inbound frame to a [`MessageHandler`] fixed at
//! connection setup. [`MessageRouter`] is the production handler:
//!
//! | inbound        | action                                               | reply / relay                 |
//! |----------------|------------------------------------------------------|-------------------------------|
//! | `sync_request` | load the page's full update log                      | `sync_response` to sender     |
//! | `update`       | append to the update log, author = connection's user | raw frame to rest of room     |
//! | `awareness`    | nothing persisted                                    | raw frame to rest of room     |
//! | anything else  |                                                      | `error` to sender             |
//!
//! Protocol and persistence failures are reported to the sender only and
//! never close the connection.
//!
//! Store calls run on the blocking pool. An update holds its page's
//! sequencer from append to relay, so every member sees relays in log order.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{BroadcastOutcome, ClientHandle, RoomManager};
use crate::protocol::{ClientMessage, Envelope, ErrorCode, SyncRequest, UpdatePayload};
use crate::storage::{Repository, StoreError};

/// Handles frames read from one client's socket.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_text(&self, client: &Arc<ClientHandle>, text: &str);

    /// Binary frames are not part of the protocol.
    async fn handle_binary(&self, client: &Arc<ClientHandle>, data: &[u8]) {
        log::debug!("Client {} sent a {} byte binary frame", client.id, data.len());
        reply_error(client, ErrorCode::InvalidMessage, "binary frames are not supported").await;
    }
}

/// What the router did with one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// A reply was queued for the sender only
    Replied,
    /// The frame was relayed to the rest of the room
    Relayed(BroadcastOutcome),
    /// The sender was sent an `error` envelope
    Rejected(ErrorCode),
}

/// Dispatches envelopes to the update log and the hub.
pub struct MessageRouter {
    repo: Arc<dyn Repository>,
    hub: Arc<RoomManager>,
}

impl MessageRouter {
    pub fn new(repo: Arc<dyn Repository>, hub: Arc<RoomManager>) -> Self {
        Self { repo, hub }
    }

    /// Run a synchronous store call on the blocking pool.
    async fn with_repo<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Repository) -> Result<T, StoreError> + Send + 'static,
    {
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || call(repo.as_ref()))
            .await
            .map_err(|e| StoreError::Database(format!("store task failed: {e}")))?
    }

    /// Route one text frame from `client`.
    pub async fn route(&self, client: &Arc<ClientHandle>, text: &str) -> Routed {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::SyncRequest(req)) => self.on_sync_request(client, req).await,
            Ok(ClientMessage::Update(payload)) => self.on_update(client, payload, text).await,
            Ok(ClientMessage::Awareness(_)) => {
                log::trace!("Awareness from {} on page {}", client.id, client.document_id);
                let outcome = self
                    .hub
                    .broadcast(client.document_id, Message::text(text), client.id)
                    .await;
                Routed::Relayed(outcome)
            }
            Err(e) => {
                log::debug!("Rejected frame from client {}: {e}", client.id);
                let code = e.code();
                reply_error(client, code, e.to_string()).await;
                Routed::Rejected(code)
            }
        }
    }

    async fn on_sync_request(&self, client: &Arc<ClientHandle>, req: SyncRequest) -> Routed {
        if let Some(page_id) = req.page_id {
            if page_id != client.document_id {
                let message = format!("connection is bound to page {}", client.document_id);
                reply_error(client, ErrorCode::PageMismatch, message).await;
                return Routed::Rejected(ErrorCode::PageMismatch);
            }
        }

        let page_id = client.document_id;
        let updates = match self.with_repo(move |repo| repo.list_updates(page_id)).await {
            Ok(updates) => updates,
            Err(e) => {
                log::error!("Failed to load update log for page {}: {e}", client.document_id);
                reply_error(client, ErrorCode::Internal, "failed to load update log").await;
                return Routed::Rejected(ErrorCode::Internal);
            }
        };

        let response = Envelope::sync_response(updates.iter().map(|u| &u.delta));
        log::debug!(
            "Sync for client {} on page {}: {} updates",
            client.id,
            client.document_id,
            updates.len()
        );
        send_envelope(client, &response).await;
        Routed::Replied
    }

    async fn on_update(&self, client: &Arc<ClientHandle>, payload: UpdatePayload, raw: &str) -> Routed {
        let delta = match payload.delta() {
            Ok(delta) if !delta.is_empty() => delta,
            Ok(_) => {
                reply_error(client, ErrorCode::InvalidUpdate, "update is empty").await;
                return Routed::Rejected(ErrorCode::InvalidUpdate);
            }
            Err(e) => {
                reply_error(client, ErrorCode::InvalidUpdate, e.to_string()).await;
                return Routed::Rejected(ErrorCode::InvalidUpdate);
            }
        };

        let sequencer = self.hub.sequencer(client.document_id);
        let _turn = sequencer.lock().await;

        let (page_id, author, size) = (client.document_id, client.user_id.clone(), delta.len());
        match self.with_repo(move |repo| repo.append_update(page_id, &author, &delta)).await {
            Ok(record) => {
                log::debug!(
                    "Persisted update {} ({size} bytes) on page {} from {}",
                    record.id,
                    client.document_id,
                    client.user_id
                );
                let outcome = self
                    .hub
                    .broadcast(client.document_id, Message::text(raw), client.id)
                    .await;
                Routed::Relayed(outcome)
            }
            Err(e) => {
                log::error!("Failed to persist update on page {}: {e}", client.document_id);
                reply_error(client, ErrorCode::PersistenceFailed, "update was not saved").await;
                Routed::Rejected(ErrorCode::PersistenceFailed)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for MessageRouter {
    async fn handle_text(&self, client: &Arc<ClientHandle>, text: &str) {
        self.route(client, text).await;
    }
}

async fn send_envelope(client: &ClientHandle, envelope: &Envelope) {
    match envelope.encode() {
        Ok(text) => {
            if !client.send(Message::text(text)).await {
                log::debug!("Client {} went away before its reply", client.id);
            }
        }
        Err(e) => log::error!("Failed to encode {} reply: {e}", envelope.kind),
    }
}

/// Queue an `error` envelope for `client` only.
pub async fn reply_error(client: &ClientHandle, code: ErrorCode, message: impl Into<String>) {
    send_envelope(client, &Envelope::error(code, message)).await;
}
