use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use courier_core::events::ChatEvent;
use courier_core::identity::Identity;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Unique socket client identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fan-out rooms a socket joins at handshake, mirroring its recipient keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Room {
    /// Shared by every manager-class connection; receives all events.
    Managers,
    User(i64),
    /// Lowercased email identity.
    Email(String),
}

impl Room {
    /// Rooms for a verified identity: managers share one room, everyone else
    /// joins a room per addressable key.
    pub fn for_identity(identity: &Identity) -> Vec<Room> {
        if identity.role.is_manager_class() {
            return vec![Room::Managers];
        }
        let mut rooms = vec![Room::User(identity.user_id.as_i64())];
        if let Some(email) = &identity.email {
            rooms.push(Room::Email(email.trim().to_ascii_lowercase()));
        }
        rooms
    }

    /// Rooms one event is delivered to. The managers room sees every event;
    /// addressed recipients get their own rooms on top.
    pub fn targets(event: &ChatEvent) -> Vec<Room> {
        let mut rooms = vec![Room::Managers];
        if let Some(user_id) = event.recipient_user_id {
            rooms.push(Room::User(user_id.as_i64()));
        }
        if let Some(email) = &event.recipient_email {
            rooms.push(Room::Email(email.to_ascii_lowercase()));
        }
        rooms
    }
}

/// A connected socket client. Room membership is fixed at handshake and torn
/// down with the connection.
pub struct SocketClient {
    pub id: ClientId,
    pub rooms: Vec<Room>,
    tx: mpsc::Sender<ChatEvent>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl SocketClient {
    fn new(id: ClientId, rooms: Vec<Room>, tx: mpsc::Sender<ChatEvent>) -> Self {
        Self {
            id,
            rooms,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected socket clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<SocketClient>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new client in its rooms; returns its id and the queue the
    /// connection's writer drains.
    pub fn register(&self, rooms: Vec<Room>) -> (ClientId, mpsc::Receiver<ChatEvent>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Arc::new(SocketClient::new(id.clone(), rooms, tx));
        self.clients.insert(id.clone(), client);
        (id, rx)
    }

    /// Remove a client by id.
    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Enqueue an event for every connected client with at least one room in
    /// `targets`. Each matching client is enqueued once even when several of
    /// its rooms match; a full queue drops the event for that client only.
    pub fn deliver(&self, targets: &[Room], event: &ChatEvent) {
        for entry in self.clients.iter() {
            let client = entry.value();
            if !client.is_connected() {
                continue;
            }
            if !client.rooms.iter().any(|room| targets.contains(room)) {
                continue;
            }
            match client.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        client_id = %client.id,
                        event_id = %event.id,
                        "send queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that haven't responded to pings within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        let removed = dead.len();
        for id in dead {
            self.unregister(&id);
            tracing::info!(client_id = %id, "cleaned up dead client");
        }
        removed
    }

    fn get(&self, id: &ClientId) -> Option<Arc<SocketClient>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }
}

#[derive(Serialize)]
struct WireFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a ChatEvent,
}

/// One `chat:event` wire frame.
pub fn frame(event: &ChatEvent) -> Option<String> {
    serde_json::to_string(&WireFrame {
        kind: "chat:event",
        data: event,
    })
    .ok()
}

/// Handle an upgraded socket: flush the backlog, then pump the room queue,
/// pinging on the heartbeat interval. The client queue was opened before the
/// backlog query, so events published during replay wait in the queue; the
/// replay floor drops the ones the backlog already covered.
pub async fn handle_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<ChatEvent>,
    registry: Arc<ClientRegistry>,
    backlog: Vec<ChatEvent>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: backlog first, then queued room traffic + periodic ping.
    let writer_cid = client_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let floor = backlog.last().map(|event| event.id);

        let mut open = true;
        for event in &backlog {
            let Some(text) = frame(event) else { continue };
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                open = false;
                break;
            }
        }

        if open {
            let mut ping_interval = tokio::time::interval(heartbeat_interval);
            ping_interval.tick().await; // consume first immediate tick

            loop {
                tokio::select! {
                    queued = rx.recv() => {
                        match queued {
                            Some(event) => {
                                if floor.is_some_and(|floor| event.id <= floor) {
                                    continue;
                                }
                                let Some(text) = frame(&event) else { continue };
                                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ping_interval.tick() => {
                        if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                            break;
                        }
                        tracing::trace!(client_id = %writer_cid, "sent ping");
                    }
                }
            }
        }

        if let Some(client) = writer_registry.get(&writer_cid) {
            client.connected.store(false, Ordering::Relaxed);
        }
    });

    // Reader task: track pongs for liveness; the protocol is push-only, so
    // inbound text is ignored.
    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Pong(_) => {
                    if let Some(client) = reader_registry.get(&reader_cid) {
                        client.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Text(text) => {
                    tracing::debug!(
                        client_id = %reader_cid,
                        len = text.len(),
                        "ignoring inbound socket message"
                    );
                }
                WsMessage::Ping(_) => {} // axum answers pongs automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&client_id);
    tracing::info!(client_id = %client_id, "socket client disconnected");
}

/// Start a background task that periodically reaps dead clients.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed = removed, "dead client cleanup");
            }
        }
    })
}
