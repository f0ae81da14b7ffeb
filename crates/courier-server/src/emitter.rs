use std::sync::Arc;

use courier_core::bus::EventBus;
use courier_core::events::EventKind;
use courier_core::ids::{ConversationId, UserId};
use courier_store::event_log::EventLog;

/// The single write path for domain events: append to the log, then publish
/// live on the bus. An append failure is logged and swallowed so the
/// triggering domain operation (the chat message was already saved) never
/// fails on the notification side-channel. At most one append attempt per
/// call; no retry.
pub struct EventEmitter {
    log: Arc<EventLog>,
    bus: Arc<EventBus>,
}

impl EventEmitter {
    pub fn new(log: Arc<EventLog>, bus: Arc<EventBus>) -> Self {
        Self { log, bus }
    }

    /// A chat message was created in a conversation. Customer recipients are
    /// addressed by email.
    pub fn emit_new_message(
        &self,
        conversation_id: ConversationId,
        recipient_email: Option<&str>,
        message: serde_json::Value,
    ) {
        self.emit(
            EventKind::NewMessage,
            Some(conversation_id),
            None,
            recipient_email,
            message,
        );
    }

    /// Messages in a conversation were read, optionally by a known user.
    pub fn emit_message_read(&self, conversation_id: ConversationId, read_by: Option<UserId>) {
        let payload = serde_json::json!({
            "conversationId": conversation_id,
            "readBy": read_by,
        });
        self.emit(
            EventKind::MessageRead,
            Some(conversation_id),
            None,
            None,
            payload,
        );
    }

    /// An out-of-band notification, addressed to a user id, an email, or —
    /// when neither is given — only the manager broadcast.
    pub fn emit_notification(
        &self,
        recipient_user_id: Option<UserId>,
        recipient_email: Option<&str>,
        notification: serde_json::Value,
    ) {
        self.emit(
            EventKind::Notification,
            None,
            recipient_user_id,
            recipient_email,
            notification,
        );
    }

    fn emit(
        &self,
        kind: EventKind,
        conversation_id: Option<ConversationId>,
        recipient_user_id: Option<UserId>,
        recipient_email: Option<&str>,
        payload: serde_json::Value,
    ) {
        match self.log.append(
            kind,
            conversation_id,
            recipient_user_id,
            recipient_email,
            payload,
        ) {
            Ok(event) => self.bus.publish(&event),
            Err(err) => {
                tracing::error!(kind = %kind, error = %err, "event append failed, live delivery skipped");
            }
        }
    }
}
