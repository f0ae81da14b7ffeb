pub mod conversations;
pub mod database;
pub mod error;
pub mod event_log;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
