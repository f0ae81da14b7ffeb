use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, Sse};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};

use courier_core::events::ChatEvent;
use courier_core::filter::RecipientFilter;
use courier_core::ids::{ConversationId, EventId};
use courier_store::StoreError;

use crate::auth;
use crate::error::ChannelError;
use crate::server::AppState;

pub type EventStream = Sse<BoxStream<'static, Result<SseEvent, Infallible>>>;

/// Replay cursor from the `Last-Event-Id` header or the `lastEventId` query
/// parameter. Anything that is not a positive integer means "no cursor" —
/// never a hard error.
pub fn parse_cursor(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<EventId> {
    let raw = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .or_else(|| query.get("lastEventId").map(String::as_str))?;
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Some(EventId::new(id)),
        _ => None,
    }
}

/// Global stream: managers get every event, everyone else their own.
pub async fn global_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<EventStream, ChannelError> {
    let identity = auth::authenticate(state.verifier.as_ref(), &headers, &query)?;
    let filter = RecipientFilter::for_identity(&identity);
    let cursor = parse_cursor(&headers, &query);
    tracing::info!(user_id = %identity.user_id, ?filter, "sse stream opened");
    Ok(open_stream(&state, filter, cursor))
}

/// Conversation-scoped stream: the conversation must exist, and the caller
/// must be manager-class or the conversation's own customer.
pub async fn conversation_stream(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<EventStream, ChannelError> {
    let identity = auth::authenticate(state.verifier.as_ref(), &headers, &query)?;
    let conversation_id = ConversationId::new(conversation_id);

    let conversation = state
        .conversations
        .get(conversation_id)
        .map_err(|err| match err {
            StoreError::NotFound(_) => ChannelError::NotFound(conversation_id.as_i64()),
            other => ChannelError::StoreUnavailable(other.to_string()),
        })?;

    let authorized = identity.role.is_manager_class()
        || identity
            .email
            .as_deref()
            .is_some_and(|email| email.eq_ignore_ascii_case(&conversation.customer_email));
    if !authorized {
        return Err(ChannelError::Forbidden);
    }

    let cursor = parse_cursor(&headers, &query);
    tracing::info!(
        user_id = %identity.user_id,
        conversation_id = %conversation_id,
        "sse conversation stream opened"
    );
    Ok(open_stream(
        &state,
        RecipientFilter::ByConversation(conversation_id),
        cursor,
    ))
}

/// Build the per-connection stream: backlog strictly first, then live events
/// and heartbeats. The bus subscription is taken before the backlog query so
/// nothing published in between is lost; live items at or below the replay
/// floor are dropped by id so the boundary does not duplicate either.
fn open_stream(state: &AppState, filter: RecipientFilter, cursor: Option<EventId>) -> EventStream {
    let (subscription, rx) = state.bus.subscribe(filter.clone());

    let backlog = match cursor {
        Some(cursor) => {
            match state
                .event_log
                .query(&filter, Some(cursor), state.backlog_limit)
            {
                Ok(events) => events,
                Err(err) => {
                    tracing::warn!(error = %err, "backlog query failed, streaming live only");
                    Vec::new()
                }
            }
        }
        None => Vec::new(),
    };

    let floor = backlog.last().map(|event| event.id).or(cursor);

    let initial = stream::iter(backlog.into_iter().filter_map(|event| event_frame(&event)));

    let live = ReceiverStream::new(rx).filter_map(move |event: ChatEvent| {
        let _keep = &subscription;
        let frame = if floor.is_some_and(|floor| event.id <= floor) {
            None
        } else {
            event_frame(&event)
        };
        futures::future::ready(frame)
    });

    let heartbeats = IntervalStream::new(tokio::time::interval(state.heartbeat_interval))
        .skip(1)
        .map(|_| heartbeat_frame());

    let frames = initial
        .chain(stream::select(live, heartbeats))
        .map(Ok::<SseEvent, Infallible>)
        .boxed();

    Sse::new(frames)
}

/// Stream item for one event: `id` is the event id, `data` the event itself,
/// so the client's own reconnect cursor advances with every item.
fn event_frame(event: &ChatEvent) -> Option<SseEvent> {
    SseEvent::default()
        .json_data(event)
        .ok()
        .map(|frame| frame.id(event.id.to_string()))
}

/// Liveness ping. Carries no id and is not replayable.
fn heartbeat_frame() -> SseEvent {
    SseEvent::default().data(
        serde_json::json!({
            "type": "heartbeat",
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", value.parse().unwrap());
        headers
    }

    #[test]
    fn cursor_from_header() {
        let cursor = parse_cursor(&headers_with("42"), &HashMap::new());
        assert_eq!(cursor, Some(EventId::new(42)));
    }

    #[test]
    fn cursor_from_query_param() {
        let query = HashMap::from([("lastEventId".to_string(), "7".to_string())]);
        assert_eq!(parse_cursor(&HeaderMap::new(), &query), Some(EventId::new(7)));
    }

    #[test]
    fn header_wins_over_query() {
        let query = HashMap::from([("lastEventId".to_string(), "7".to_string())]);
        assert_eq!(
            parse_cursor(&headers_with("42"), &query),
            Some(EventId::new(42))
        );
    }

    #[test]
    fn malformed_cursor_means_no_cursor() {
        for raw in ["abc", "-3", "0", "1.5", ""] {
            let query = HashMap::from([("lastEventId".to_string(), raw.to_string())]);
            assert_eq!(parse_cursor(&HeaderMap::new(), &query), None, "raw: {raw}");
        }
    }

    #[test]
    fn no_cursor_supplied() {
        assert_eq!(parse_cursor(&HeaderMap::new(), &HashMap::new()), None);
    }
}
