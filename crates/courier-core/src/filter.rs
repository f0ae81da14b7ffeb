use crate::events::ChatEvent;
use crate::identity::Identity;
use crate::ids::{ConversationId, UserId};

/// The predicate fixed per connection, determining which live and backlog
/// events that connection receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecipientFilter {
    /// Every event, regardless of addressing. Manager-class connections.
    ManagerBroadcast,
    /// Events addressed to a specific internal user.
    ByUserId(UserId),
    /// Events addressed to an email identity, case-insensitive.
    ByEmail(String),
    /// Every event in one conversation, irrespective of recipient.
    /// Authorization happens once at subscribe time, not per event.
    ByConversation(ConversationId),
}

impl RecipientFilter {
    pub fn by_email(email: impl AsRef<str>) -> Self {
        Self::ByEmail(email.as_ref().trim().to_ascii_lowercase())
    }

    /// Global-stream filter for an authenticated identity: managers get the
    /// broadcast view; everyone else is matched on their email identity when
    /// they have one, otherwise on their user id.
    pub fn for_identity(identity: &Identity) -> Self {
        if identity.role.is_manager_class() {
            return Self::ManagerBroadcast;
        }
        match &identity.email {
            Some(email) => Self::by_email(email),
            None => Self::ByUserId(identity.user_id),
        }
    }

    pub fn matches(&self, event: &ChatEvent) -> bool {
        match self {
            Self::ManagerBroadcast => true,
            Self::ByUserId(user_id) => event.recipient_user_id == Some(*user_id),
            Self::ByEmail(email) => event
                .recipient_email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(email)),
            Self::ByConversation(conversation_id) => {
                event.conversation_id == Some(*conversation_id)
            }
        }
    }
}
