//! Integration tests for end-to-end live editing.
//!
//! These tests start a real server over a temporary store and connect raw
//! WebSocket clients, verifying the handshake gate, the sync handshake and
//! update relay.

mod common;

use common::*;
use folio_collab::protocol::{decode_bytes, Envelope, ErrorCode, MessageType};
use folio_collab::server::ServerConfig;
use folio_collab::storage::Repository;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

// ─── Handshake ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_accepts_authorized_client() {
    let server = start_test_server().await;
    let page = server.page("Welcome");

    let mut ws = server.connect("t-alice", page.id).await;
    let updates = sync(&mut ws, page.id).await;
    assert!(updates.is_empty(), "fresh page has an empty log");
}

#[tokio::test]
async fn test_bearer_header_is_accepted() {
    let server = start_test_server().await;
    let page = server.page("Bearer");

    let mut ws = server.connect_bearer("t-bob", page.id).await.unwrap();
    assert!(sync(&mut ws, page.id).await.is_empty());
}

#[tokio::test]
async fn test_handshake_refusals() {
    let server = start_test_server().await;
    let page = server.page("Guarded");
    let addr = server.addr;

    let missing_token = format!("ws://{addr}/ws?page_id={}", page.id);
    assert_eq!(server.refused_status(&missing_token, None).await, 401);

    let bad_token = server.url("t-nobody", page.id);
    assert_eq!(server.refused_status(&bad_token, None).await, 401);

    let missing_page = format!("ws://{addr}/ws?token=t-alice");
    assert_eq!(server.refused_status(&missing_page, None).await, 400);

    let garbage_page = format!("ws://{addr}/ws?token=t-alice&page_id=not-a-uuid");
    assert_eq!(server.refused_status(&garbage_page, None).await, 400);

    let unknown_page = server.url("t-alice", Uuid::new_v4());
    assert_eq!(server.refused_status(&unknown_page, None).await, 404);

    let outsider = server.url("t-mallory", page.id);
    assert_eq!(server.refused_status(&outsider, None).await, 403);

    let srv = server.server.clone();
    assert!(
        eventually(|| {
            let srv = srv.clone();
            async move { srv.stats().await.rejected_handshakes == 6 }
        })
        .await
    );
    assert_eq!(srv.stats().await.active_connections, 0);
}

#[tokio::test]
async fn test_origin_allow_list() {
    let mut config = ServerConfig::default();
    config.allowed_origins = vec!["https://folio.test".to_string()];
    let server = start_with(config).await;
    let page = server.page("Origins");
    let url = server.url("t-alice", page.id);

    assert_eq!(server.refused_status(&url, Some("https://evil.test")).await, 403);

    // Listed origin and non-browser clients without an Origin both pass.
    let (mut ws, _) = {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::http::HeaderValue;
        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static("https://folio.test"));
        tokio_tungstenite::connect_async(request).await.unwrap()
    };
    assert!(sync(&mut ws, page.id).await.is_empty());

    let mut bare = server.connect("t-bob", page.id).await;
    assert!(sync(&mut bare, page.id).await.is_empty());
}

// ─── Sync and relay ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_relay_and_late_join_sync() {
    let server = start_test_server().await;
    let page = server.page("Shared notes");

    let mut alice = server.connect("t-alice", page.id).await;
    let mut bob = server.connect("t-bob", page.id).await;
    sync(&mut alice, page.id).await;
    sync(&mut bob, page.id).await;

    // Alice's update reaches Bob verbatim, never Alice herself.
    let first = Envelope::update(b"delta-one");
    send(&mut alice, &first).await;
    let relayed = recv(&mut bob).await;
    assert_eq!(relayed, first);
    assert_eq!(decode_bytes(&relayed.update_payload().unwrap().update).unwrap(), b"delta-one");
    assert_silent(&mut alice, Duration::from_millis(150)).await;

    send(&mut bob, &Envelope::update(b"delta-two")).await;
    assert_eq!(recv(&mut alice).await, Envelope::update(b"delta-two"));

    // Carol joins late and catches up from the log, in receive order.
    let mut carol = server.connect("t-carol", page.id).await;
    let updates = sync(&mut carol, page.id).await;
    assert_eq!(updates, vec![b"delta-one".to_vec(), b"delta-two".to_vec()]);

    let log = server.store.list_updates(page.id).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].author, "alice");
    assert_eq!(log[1].author, "bob");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = start_test_server().await;
    let page_a = server.page("A");
    let page_b = server.page("B");

    let mut alice = server.connect("t-alice", page_a.id).await;
    let mut bob = server.connect("t-bob", page_b.id).await;
    sync(&mut alice, page_a.id).await;
    sync(&mut bob, page_b.id).await;

    send(&mut alice, &Envelope::update(b"only-a")).await;
    assert_silent(&mut bob, Duration::from_millis(200)).await;

    assert!(sync(&mut bob, page_b.id).await.is_empty());
    assert_eq!(server.store.list_updates(page_a.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_sync_request_without_page_id_uses_bound_page() {
    let server = start_test_server().await;
    let page = server.page("Implicit");
    server.store.append_update(page.id, "alice", b"seed").unwrap();

    let mut ws = server.connect("t-alice", page.id).await;
    send_raw(&mut ws, r#"{"type":"sync_request","payload":{}}"#).await;
    let response = recv(&mut ws).await;
    assert_eq!(response.message_type(), Some(MessageType::SyncResponse));
    let updates = response.sync_response_payload().unwrap().updates;
    assert_eq!(decode_bytes(&updates[0]).unwrap(), b"seed");
}

// ─── Errors keep the connection open ─────────────────────────────────────────

#[tokio::test]
async fn test_error_envelopes_keep_connection_open() {
    let server = start_test_server().await;
    let page = server.page("Errors");
    let mut ws = server.connect("t-alice", page.id).await;
    let mismatch = format!(r#"{{"type":"sync_request","payload":{{"page_id":"{}"}}}}"#, Uuid::new_v4());

    let cases: [(&str, ErrorCode); 5] = [
        ("not json", ErrorCode::InvalidMessage),
        (r#"{"type":"teleport","payload":{}}"#, ErrorCode::UnknownType),
        (r#"{"type":"update","payload":{"update":"%%%"}}"#, ErrorCode::InvalidUpdate),
        (r#"{"type":"update","payload":{"update":""}}"#, ErrorCode::InvalidUpdate),
        (&mismatch, ErrorCode::PageMismatch),
    ];

    for (text, expected) in cases {
        send_raw(&mut ws, text).await;
        let reply = recv(&mut ws).await;
        assert_eq!(reply.message_type(), Some(MessageType::Error), "for {text}");
        assert_eq!(reply.error_payload().unwrap().code, expected, "for {text}");
    }

    // Still usable afterwards and nothing was persisted.
    assert!(sync(&mut ws, page.id).await.is_empty());
}

#[tokio::test]
async fn test_binary_frames_are_rejected() {
    let server = start_test_server().await;
    let page = server.page("Binary");
    let mut ws = server.connect("t-alice", page.id).await;

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    let reply = recv(&mut ws).await;
    assert_eq!(reply.error_payload().unwrap().code, ErrorCode::InvalidMessage);
}

#[tokio::test]
async fn test_ping_pong() {
    let server = start_test_server().await;
    let page = server.page("Ping");
    let mut ws = server.connect("t-alice", page.id).await;
    sync(&mut ws, page.id).await;

    ws.send(Message::Ping(b"hb".to_vec().into())).await.unwrap();
    let pong = timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Pong(payload))) => return payload.to_vec(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(pong, b"hb");
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stats_and_disconnect_cleanup() {
    let server = start_test_server().await;
    let page = server.page("Stats");

    let mut alice = server.connect("t-alice", page.id).await;
    let mut bob = server.connect("t-bob", page.id).await;
    sync(&mut alice, page.id).await;
    sync(&mut bob, page.id).await;

    let hub = server.server.room_manager().clone();
    assert_eq!(hub.member_count(page.id).await, 2);

    let stats = server.server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.active_rooms, 1);
    assert!(stats.total_messages >= 2);
    assert!(stats.total_bytes > 0);

    let page_id = page.id;
    alice.close(None).await.unwrap();
    assert!(
        eventually(|| {
            let hub = hub.clone();
            async move { hub.member_count(page_id).await == 1 }
        })
        .await
    );

    drop(bob);
    assert!(
        eventually(|| {
            let hub = hub.clone();
            async move { hub.room_count().await == 0 }
        })
        .await
    );

    let srv = server.server.clone();
    assert!(
        eventually(|| {
            let srv = srv.clone();
            async move { srv.stats().await.active_connections == 0 }
        })
        .await
    );
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let mut server = start_test_server().await;
    let page = server.page("Shutdown");
    let mut ws = server.connect("t-alice", page.id).await;
    sync(&mut ws, page.id).await;

    server.shutdown();

    let closed = timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}
