use chrono::Utc;
use tracing::instrument;

use courier_core::events::{ChatEvent, EventKind};
use courier_core::filter::RecipientFilter;
use courier_core::ids::{ConversationId, EventId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Events returned when the caller does not size the query.
pub const DEFAULT_QUERY_LIMIT: u32 = 200;
/// Upper bound on a single query. Larger requests are clamped, never refused.
pub const MAX_QUERY_LIMIT: u32 = 1000;

const SELECT_COLUMNS: &str =
    "SELECT id, kind, conversation_id, recipient_user_id, recipient_email, payload, created_at
     FROM events";

/// The durable, ordered source of truth for delivery. Ids are assigned here
/// and double as the replay cursor; the bus only ever sees events that were
/// appended first.
pub struct EventLog {
    db: Database,
}

impl EventLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one event. The store assigns the id under its own write lock,
    /// so ids are strictly increasing and never reused. Recipient emails are
    /// stored lowercased.
    #[instrument(skip(self, payload), fields(kind = %kind))]
    pub fn append(
        &self,
        kind: EventKind,
        conversation_id: Option<ConversationId>,
        recipient_user_id: Option<UserId>,
        recipient_email: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<ChatEvent, StoreError> {
        let created_at = Utc::now().to_rfc3339();
        let email = recipient_email.map(|e| e.trim().to_ascii_lowercase());

        self.db.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO events (kind, conversation_id, recipient_user_id, recipient_email, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    kind.as_str(),
                    conversation_id.map(|c| c.as_i64()),
                    recipient_user_id.map(|u| u.as_i64()),
                    email.as_deref(),
                    serde_json::to_string(&payload)?,
                    created_at,
                ],
            )?;

            Ok(ChatEvent {
                id: EventId::new(conn.last_insert_rowid()),
                kind,
                conversation_id,
                recipient_user_id,
                recipient_email: email,
                payload,
                created_at,
            })
        })
    }

    /// Events with id greater than `cursor` (all, if none) matching `filter`,
    /// ascending by id, at most `limit`. A limit of 0 means the default;
    /// anything above the hard cap is clamped.
    #[instrument(skip(self))]
    pub fn query(
        &self,
        filter: &RecipientFilter,
        cursor: Option<EventId>,
        limit: u32,
    ) -> Result<Vec<ChatEvent>, StoreError> {
        let limit = match limit {
            0 => DEFAULT_QUERY_LIMIT,
            n => n.min(MAX_QUERY_LIMIT),
        };
        let after = cursor.map(|c| c.as_i64()).unwrap_or(0);

        self.db.with_conn(|conn| {
            let mut out = Vec::new();
            match filter {
                RecipientFilter::ManagerBroadcast => {
                    let mut stmt = conn.prepare(&format!(
                        "{SELECT_COLUMNS} WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![after, limit])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_event(row)?);
                    }
                }
                RecipientFilter::ByUserId(user_id) => {
                    let mut stmt = stmt_with(conn, "recipient_user_id = ?2")?;
                    let mut rows =
                        stmt.query(rusqlite::params![after, user_id.as_i64(), limit])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_event(row)?);
                    }
                }
                RecipientFilter::ByEmail(email) => {
                    let mut stmt = stmt_with(conn, "lower(recipient_email) = lower(?2)")?;
                    let mut rows = stmt.query(rusqlite::params![after, email, limit])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_event(row)?);
                    }
                }
                RecipientFilter::ByConversation(conversation_id) => {
                    let mut stmt = stmt_with(conn, "conversation_id = ?2")?;
                    let mut rows =
                        stmt.query(rusqlite::params![after, conversation_id.as_i64(), limit])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_event(row)?);
                    }
                }
            }
            Ok(out)
        })
    }

    /// Total number of events in the log.
    #[instrument(skip(self))]
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
        })
    }
}

fn stmt_with<'c>(
    conn: &'c rusqlite::Connection,
    clause: &str,
) -> Result<rusqlite::Statement<'c>, StoreError> {
    Ok(conn.prepare(&format!(
        "{SELECT_COLUMNS} WHERE id > ?1 AND {clause} ORDER BY id ASC LIMIT ?3"
    ))?)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<ChatEvent, StoreError> {
    let kind_raw: String = row_helpers::get(row, 1, "events", "kind")?;
    let payload_raw: String = row_helpers::get(row, 5, "events", "payload")?;

    Ok(ChatEvent {
        id: EventId::new(row_helpers::get(row, 0, "events", "id")?),
        kind: row_helpers::parse_enum(&kind_raw, "events", "kind")?,
        conversation_id: row_helpers::get_opt::<i64>(row, 2, "events", "conversation_id")?
            .map(ConversationId::new),
        recipient_user_id: row_helpers::get_opt::<i64>(row, 3, "events", "recipient_user_id")?
            .map(UserId::new),
        recipient_email: row_helpers::get_opt(row, 4, "events", "recipient_email")?,
        payload: row_helpers::parse_json(&payload_raw, "events", "payload")?,
        created_at: row_helpers::get(row, 6, "events", "created_at")?,
    })
}
