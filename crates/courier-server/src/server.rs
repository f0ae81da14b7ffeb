use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use courier_core::bus::EventBus;
use courier_core::events::ChatEvent;
use courier_core::filter::RecipientFilter;
use courier_core::identity::{Identity, TokenVerifier};
use courier_core::ids::EventId;
use courier_store::conversations::ConversationRepo;
use courier_store::event_log::{EventLog, DEFAULT_QUERY_LIMIT};
use courier_store::Database;

use crate::auth;
use crate::bridge;
use crate::emitter::EventEmitter;
use crate::error::ChannelError;
use crate::socket::{self, ClientRegistry, Room};
use crate::sse;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub backlog_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9400,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            backlog_limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub event_log: Arc<EventLog>,
    pub conversations: Arc<ConversationRepo>,
    pub bus: Arc<EventBus>,
    pub emitter: Arc<EventEmitter>,
    pub registry: Arc<ClientRegistry>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub heartbeat_interval: Duration,
    pub backlog_limit: u32,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/events", get(events_handler))
        .route("/events/stream", get(sse::global_stream))
        .route("/events/stream/{conversation_id}", get(sse::conversation_stream))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the background
/// tasks and the bridge's bus subscription alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    verifier: Arc<dyn TokenVerifier>,
) -> Result<ServerHandle, std::io::Error> {
    let event_log = Arc::new(EventLog::new(db.clone()));
    let conversations = Arc::new(ConversationRepo::new(db));
    let bus = EventBus::new();
    let emitter = Arc::new(EventEmitter::new(Arc::clone(&event_log), Arc::clone(&bus)));
    let registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let (bridge_subscription, bridge_handle) = bridge::start(Arc::clone(&registry), &bus);

    let cleanup_handle = socket::start_cleanup_task(
        Arc::clone(&registry),
        Duration::from_secs(60),
    );

    let state = AppState {
        event_log,
        conversations,
        bus,
        emitter: Arc::clone(&emitter),
        registry,
        verifier,
        heartbeat_interval: config.heartbeat_interval,
        backlog_limit: config.backlog_limit,
    };

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "courier server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        emitter,
        _server: server_handle,
        _bridge: bridge_handle,
        _bridge_subscription: bridge_subscription,
        _cleanup: cleanup_handle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive. The emitter
/// is the write path the owning domain services call.
pub struct ServerHandle {
    pub port: u16,
    pub emitter: Arc<EventEmitter>,
    _server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
    _bridge_subscription: courier_core::bus::Subscription,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// Health check HTTP endpoint: reports whether the event log is reachable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.event_log.count() {
        Ok(events) => (
            axum::http::StatusCode::OK,
            Json(serde_json::json!({ "status": "healthy", "events": events })),
        ),
        Err(err) => {
            tracing::error!(error = %err, "health check failed");
            (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable" })),
            )
        }
    }
}

/// Polling twin of the stream endpoints: the caller's filtered backlog as
/// one JSON page. `after` is the cursor, `limit` is clamped by the store.
async fn events_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<ChatEvent>>, ChannelError> {
    let identity = auth::authenticate(state.verifier.as_ref(), &headers, &query)?;
    let filter = RecipientFilter::for_identity(&identity);

    let cursor = query
        .get("after")
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|id| *id > 0)
        .map(EventId::new);
    let limit = query
        .get("limit")
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(state.backlog_limit);

    state
        .event_log
        .query(&filter, cursor, limit)
        .map(Json)
        .map_err(|err| ChannelError::StoreUnavailable(err.to_string()))
}

/// Socket endpoint. The token (and optional cursor) arrive in the query
/// string or headers; verification failure rejects the handshake before the
/// upgrade completes.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ChannelError> {
    let identity = auth::authenticate(state.verifier.as_ref(), &headers, &query)?;
    let cursor = sse::parse_cursor(&headers, &query);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, identity, cursor)))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    identity: Identity,
    cursor: Option<EventId>,
) {
    let rooms = Room::for_identity(&identity);
    let (client_id, rx) = state.registry.register(rooms);
    tracing::info!(client_id = %client_id, user_id = %identity.user_id, "socket client connected");

    // The room queue is already open, so anything published while the
    // backlog query runs waits in it instead of being lost.
    let backlog = match cursor {
        Some(cursor) => {
            let filter = RecipientFilter::for_identity(&identity);
            match state
                .event_log
                .query(&filter, Some(cursor), state.backlog_limit)
            {
                Ok(events) => events,
                Err(err) => {
                    tracing::warn!(
                        client_id = %client_id,
                        error = %err,
                        "socket backlog query failed, joining live only"
                    );
                    Vec::new()
                }
            }
        }
        None => Vec::new(),
    };

    socket::handle_connection(
        socket,
        client_id,
        rx,
        Arc::clone(&state.registry),
        backlog,
        state.heartbeat_interval,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use courier_core::identity::Role;
    use courier_core::ids::{ConversationId, UserId};
    use futures::StreamExt;
    use serde_json::json;

    fn verifier() -> Arc<StaticTokenVerifier> {
        Arc::new(
            StaticTokenVerifier::new()
                .with(
                    "manager-token",
                    Identity {
                        user_id: UserId::new(1),
                        role: Role::Admin,
                        email: None,
                    },
                )
                .with(
                    "customer-token",
                    Identity {
                        user_id: UserId::new(2),
                        role: Role::Customer,
                        email: Some("cust@example.com".into()),
                    },
                )
                .with(
                    "other-token",
                    Identity {
                        user_id: UserId::new(3),
                        role: Role::Customer,
                        email: Some("other@example.com".into()),
                    },
                ),
        )
    }

    async fn start_test_server() -> (ServerHandle, Database) {
        let db = Database::in_memory().unwrap();
        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };
        let handle = start(config, db.clone(), verifier()).await.unwrap();
        (handle, db)
    }

    async fn read_until(
        body: &mut (impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin),
        needle: &str,
    ) -> String {
        let mut buf = String::new();
        while !buf.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .expect("timed out waiting for sse frames")
                .expect("stream ended early")
                .expect("stream error");
            buf.push_str(&String::from_utf8_lossy(&chunk));
        }
        buf
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (handle, _db) = start_test_server().await;
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn events_endpoint_authenticates_and_filters() {
        let (handle, _db) = start_test_server().await;
        let base = format!("http://127.0.0.1:{}", handle.port);

        let resp = reqwest::get(format!("{base}/events")).await.unwrap();
        assert_eq!(resp.status(), 401);

        handle.emitter.emit_new_message(
            ConversationId::new(1),
            Some("cust@example.com"),
            json!({"text": "m1"}),
        );
        handle
            .emitter
            .emit_notification(Some(UserId::new(9)), None, json!({"title": "restock"}));

        let resp = reqwest::get(format!("{base}/events?token=manager-token"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let all: Vec<serde_json::Value> = resp.json().await.unwrap();
        assert_eq!(all.len(), 2);

        let mine: Vec<serde_json::Value> =
            reqwest::get(format!("{base}/events?token=customer-token"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0]["payload"]["text"], "m1");

        let first_id = all[0]["id"].as_i64().unwrap();
        let after: Vec<serde_json::Value> =
            reqwest::get(format!("{base}/events?token=manager-token&after={first_id}"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(after.len(), 1);
        assert!(after[0]["id"].as_i64().unwrap() > first_id);
    }

    #[tokio::test]
    async fn conversation_stream_authorization() {
        let (handle, db) = start_test_server().await;
        let repo = ConversationRepo::new(db);
        let conversation = repo.create("cust@example.com", Some("late delivery")).unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);

        let resp = reqwest::get(format!("{base}/events/stream/{}", conversation.id))
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = reqwest::get(format!(
            "{base}/events/stream/{}?token=other-token",
            conversation.id
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 403);

        let resp = reqwest::get(format!("{base}/events/stream/9999?token=manager-token"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = reqwest::get(format!(
            "{base}/events/stream/{}?token=customer-token",
            conversation.id
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn sse_stream_replays_backlog_after_cursor() {
        let (handle, _db) = start_test_server().await;
        let base = format!("http://127.0.0.1:{}", handle.port);
        let conversation = ConversationId::new(1);

        for text in ["m1", "m2", "m3"] {
            handle.emitter.emit_new_message(
                conversation,
                Some("cust@example.com"),
                json!({"text": text}),
            );
        }

        let all: Vec<serde_json::Value> =
            reqwest::get(format!("{base}/events?token=customer-token"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        let first_id = all[0]["id"].as_i64().unwrap();

        let resp = reqwest::get(format!(
            "{base}/events/stream?token=customer-token&lastEventId={first_id}"
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);

        let mut body = resp.bytes_stream();
        let buf = read_until(&mut body, "m3").await;

        // backlog excludes the event the cursor points at, in ascending order
        assert!(!buf.contains("m1"));
        let m2 = buf.find("m2").unwrap();
        let m3 = buf.find("m3").unwrap();
        assert!(m2 < m3);
    }

    #[tokio::test]
    async fn sse_stream_delivers_live_events() {
        let (handle, _db) = start_test_server().await;
        let base = format!("http://127.0.0.1:{}", handle.port);

        let resp = reqwest::get(format!("{base}/events/stream?token=manager-token"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let mut body = resp.bytes_stream();

        handle
            .emitter
            .emit_notification(None, None, json!({"title": "fresh"}));

        let buf = read_until(&mut body, "fresh").await;
        assert!(buf.contains("notification"));
    }
}
