//! Identity correlation: map logins to recently observed flows.

pub mod map;
pub mod pending;
pub mod persistence;

pub use map::IdentityMap;
pub use pending::{PendingBuffer, PendingFlow};
pub use persistence::IdentityPersistence;
