use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use courier_core::ids::ConversationId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A support/supply request thread — the unit the conversation-scoped
/// stream subscribes to. The customer is identified by email.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub customer_email: String,
    pub subject: Option<String>,
    pub created_at: String,
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(customer_email = %customer_email))]
    pub fn create(
        &self,
        customer_email: &str,
        subject: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let email = customer_email.trim().to_ascii_lowercase();
        let created_at = Utc::now().to_rfc3339();

        self.db.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (customer_email, subject, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![email, subject, created_at],
            )?;
            Ok(Conversation {
                id: ConversationId::new(conn.last_insert_rowid()),
                customer_email: email,
                subject: subject.map(str::to_owned),
                created_at,
            })
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, customer_email, subject, created_at FROM conversations WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_i64()])?;
            match rows.next()? {
                Some(row) => Ok(Conversation {
                    id: ConversationId::new(row_helpers::get(row, 0, "conversations", "id")?),
                    customer_email: row_helpers::get(row, 1, "conversations", "customer_email")?,
                    subject: row_helpers::get_opt(row, 2, "conversations", "subject")?,
                    created_at: row_helpers::get(row, 3, "conversations", "created_at")?,
                }),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> ConversationRepo {
        ConversationRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = setup();
        let created = repo.create("Customer@Example.com", Some("missing invoice")).unwrap();
        assert_eq!(created.customer_email, "customer@example.com");

        let fetched = repo.get(created.id).unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.subject.as_deref(), Some("missing invoice"));
    }

    #[test]
    fn get_missing_returns_not_found() {
        let repo = setup();
        let result = repo.get(ConversationId::new(999));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
