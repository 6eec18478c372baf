//! Connection hub: per-page rooms, client pumps and best-effort fan-out.
//!
//! ```text
//!                   ┌───────────── RoomManager ─────────────┐
//!                   │ Mutex<page_id → { client_id → handle }>│
//!                   └───────────────────────────────────────┘
//!                        │ broadcast(room, msg, sender)
//!        try_send ┌──────┴──────┬─────────────┐
//!                 ▼             ▼             ▼
//!            [queue A]     [queue B]     [queue C]     bounded mpsc per client
//!                 │             │             │
//!           write pump    write pump    write pump     sole socket writer
//!                 │             │             │
//!              socket A      socket B      socket C
//!                 │             │             │
//!            read pump     read pump     read pump      → MessageHandler
//! ```
//!
//! One manager-wide lock serializes join, unregister and broadcast. Nothing
//! awaits on a socket, the database or the engine while it is held: fan-out
//! only does non-blocking `try_send` into each client's queue, and a full
//! queue drops the message for that client alone.
//!
//! Writers that must persist and then relay in the same order take the
//! page's [`RoomManager::sequencer`] first. It is separate from the
//! membership lock, so joins and awareness relays never wait on the store.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::router::MessageHandler;

// ─── Client ──────────────────────────────────────────────────────────────────

/// A live connection bound to one page.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: Uuid,
    pub user_id: String,
    pub document_id: Uuid,
    outbound: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
}

/// Receiving side of a client's outbound queue, drained by the write pump.
#[derive(Debug)]
pub struct ClientQueue {
    rx: mpsc::Receiver<Message>,
    closed: watch::Receiver<bool>,
}

impl ClientHandle {
    pub fn new(
        user_id: impl Into<String>,
        document_id: Uuid,
        capacity: usize,
    ) -> (Arc<Self>, ClientQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            document_id,
            outbound: tx,
            closed: closed_tx,
        });
        (
            handle,
            ClientQueue {
                rx,
                closed: closed_rx,
            },
        )
    }

    /// Queue a direct reply, waiting for room in the queue.
    ///
    /// Returns `false` if the client is already gone.
    pub async fn send(&self, msg: Message) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.send(msg).await.is_ok()
    }

    /// Non-blocking enqueue used by fan-out.
    pub fn try_deliver(&self, msg: Message) -> Result<(), TrySendError<Message>> {
        self.outbound.try_send(msg)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Signal both pumps to stop. Idempotent.
    fn close(&self) {
        self.closed.send_replace(true);
    }
}

impl ClientQueue {
    /// Next queued outbound message, or `None` once the client is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            msg = self.rx.recv() => msg,
            _ = wait_closed(&mut self.closed) => None,
        }
    }

    /// Next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as closed.
    let _ = closed.wait_for(|closed| *closed).await;
}

// ─── Stats ───────────────────────────────────────────────────────────────────

/// Hub counters, read as a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub rooms: usize,
    pub clients: usize,
}

/// Atomic counters so fan-out never takes a second lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
}

/// Result of one [`RoomManager::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

/// Join handles of a registered client's two pumps.
pub struct Pumps {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl Pumps {
    /// Wait until both pumps have exited.
    pub async fn join(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

// ─── Room Manager ────────────────────────────────────────────────────────────

/// Room manager: page id → live clients.
pub struct RoomManager {
    rooms: Mutex<HashMap<Uuid, HashMap<Uuid, Arc<ClientHandle>>>>,
    /// Per-page ordering locks, alive only while someone holds them
    sequencers: std::sync::Mutex<HashMap<Uuid, Weak<Mutex<()>>>>,
    queue_capacity: usize,
    heartbeat: Duration,
    stats: AtomicBroadcastStats,
}

impl RoomManager {
    /// `queue_capacity` bounds each client's outbound queue; `heartbeat` is
    /// the ping period of the write pump.
    pub fn new(queue_capacity: usize, heartbeat: Duration) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            sequencers: std::sync::Mutex::new(HashMap::new()),
            queue_capacity,
            heartbeat,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// A fresh client handle sized with this hub's queue capacity.
    pub fn new_client(&self, user_id: impl Into<String>, document_id: Uuid) -> (Arc<ClientHandle>, ClientQueue) {
        ClientHandle::new(user_id, document_id, self.queue_capacity)
    }

    /// Add `client` to the room of its page. Returns `false` if it was
    /// already a member.
    pub async fn join(&self, client: &Arc<ClientHandle>) -> bool {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(client.document_id).or_default();
        if room.contains_key(&client.id) {
            return false;
        }
        room.insert(client.id, client.clone());
        log::info!(
            "Client {} ({}) joined page {} ({} in room)",
            client.id,
            client.user_id,
            client.document_id,
            room.len()
        );
        true
    }

    /// Join the room and start the client's read and write pumps.
    ///
    /// Returns `None` without touching the socket if the client is already
    /// registered.
    pub async fn register<S, H>(
        self: &Arc<Self>,
        client: Arc<ClientHandle>,
        queue: ClientQueue,
        socket: WebSocketStream<S>,
        handler: Arc<H>,
    ) -> Option<Pumps>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        H: MessageHandler + ?Sized + 'static,
    {
        if !self.join(&client).await {
            log::debug!("Client {} already registered", client.id);
            return None;
        }

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_pump(self.clone(), client.clone(), sink, queue, self.heartbeat));
        let reader = tokio::spawn(read_pump(self.clone(), client, stream, handler));
        Some(Pumps { reader, writer })
    }

    /// Remove `client` from its room, dropping the room once empty, and
    /// signal its pumps to close the socket. Safe to call repeatedly.
    pub async fn unregister(&self, client: &ClientHandle) -> bool {
        let removed = {
            let mut rooms = self.rooms.lock().await;
            match rooms.get_mut(&client.document_id) {
                Some(room) => {
                    let removed = room.remove(&client.id).is_some();
                    if room.is_empty() {
                        rooms.remove(&client.document_id);
                        log::info!("Room {} removed (empty)", client.document_id);
                    }
                    removed
                }
                None => false,
            }
        };
        client.close();
        if removed {
            log::info!("Client {} left page {}", client.id, client.document_id);
        }
        removed
    }

    /// Unregister every client in every room. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let clients: Vec<Arc<ClientHandle>> = {
            let mut rooms = self.rooms.lock().await;
            rooms.drain().flat_map(|(_, members)| members.into_values()).collect()
        };
        for client in &clients {
            client.close();
        }
        if !clients.is_empty() {
            log::info!("Closed {} client connections", clients.len());
        }
        clients.len()
    }

    /// Enqueue `msg` for every member of `room` except `sender`.
    ///
    /// A member whose queue is full (or already closed) misses this message;
    /// nobody else is affected.
    pub async fn broadcast(&self, room: Uuid, msg: Message, sender: Uuid) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let rooms = self.rooms.lock().await;
        let Some(members) = rooms.get(&room) else {
            return outcome;
        };

        for (id, member) in members {
            if *id == sender {
                continue;
            }
            match member.try_deliver(msg.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    log::warn!("Outbound queue full for client {id} on page {room}; message dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    outcome.dropped += 1;
                    log::debug!("Client {id} closed before delivery on page {room}");
                }
            }
        }
        drop(rooms);

        self.stats
            .messages_sent
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.stats
            .messages_dropped
            .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        outcome
    }

    /// The ordering lock of `room`. Every caller holding a clone at the
    /// same time gets the same lock.
    pub fn sequencer(&self, room: Uuid) -> Arc<Mutex<()>> {
        let mut sequencers = self.sequencers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = sequencers.get(&room).and_then(Weak::upgrade) {
            return lock;
        }
        sequencers.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        sequencers.insert(room, Arc::downgrade(&lock));
        lock
    }

    /// Get the number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Number of clients connected to `room`.
    pub async fn member_count(&self, room: Uuid) -> usize {
        self.rooms.lock().await.get(&room).map_or(0, HashMap::len)
    }

    pub async fn is_member(&self, room: Uuid, client_id: Uuid) -> bool {
        self.rooms
            .lock()
            .await
            .get(&room)
            .is_some_and(|members| members.contains_key(&client_id))
    }

    /// Get all page ids with at least one live client.
    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.lock().await.keys().copied().collect()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub async fn stats(&self) -> BroadcastStats {
        let (rooms, clients) = {
            let rooms = self.rooms.lock().await;
            (rooms.len(), rooms.values().map(HashMap::len).sum())
        };
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            rooms,
            clients,
        }
    }

    fn record_frame(&self, len: usize) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }
}

// ─── Pumps ───────────────────────────────────────────────────────────────────

/// Sole reader of the socket. Hands frames to the handler in arrival order.
async fn read_pump<S, H>(
    hub: Arc<RoomManager>,
    client: Arc<ClientHandle>,
    mut stream: SplitStream<WebSocketStream<S>>,
    handler: Arc<H>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: MessageHandler + ?Sized + 'static,
{
    let mut closed = client.closed.subscribe();
    loop {
        tokio::select! {
            _ = wait_closed(&mut closed) => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    hub.record_frame(text.len());
                    handler.handle_text(&client, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    hub.record_frame(data.len());
                    handler.handle_binary(&client, &data).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = client.try_deliver(Message::Pong(data));
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("Client {} closed the connection", client.id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Read error for client {}: {e}", client.id);
                    break;
                }
            },
        }
    }
    hub.unregister(&client).await;
}

/// Sole writer of the socket: drains the queue and sends heartbeats.
async fn write_pump<S>(
    hub: Arc<RoomManager>,
    client: Arc<ClientHandle>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut queue: ClientQueue,
    heartbeat: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let period = heartbeat.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = queue.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        log::warn!("Write to client {} failed: {e}", client.id);
                        break;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    log::debug!("Heartbeat to client {} failed: {e}", client.id);
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    hub.unregister(&client).await;
}
