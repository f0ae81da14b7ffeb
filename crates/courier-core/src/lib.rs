pub mod bus;
pub mod events;
pub mod filter;
pub mod identity;
pub mod ids;

pub use bus::{EventBus, Subscription};
pub use events::{ChatEvent, EventKind};
pub use filter::RecipientFilter;
