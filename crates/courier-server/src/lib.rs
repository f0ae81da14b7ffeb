pub mod auth;
pub mod bridge;
pub mod emitter;
pub mod error;
pub mod server;
pub mod socket;
pub mod sse;

pub use emitter::EventEmitter;
pub use error::ChannelError;
pub use server::{start, AppState, ServerConfig, ServerHandle};
