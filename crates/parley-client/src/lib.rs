//! Client side of the realtime core: per-room sockets, the cached message
//! views they feed, and the reconciliation rules that keep those views
//! consistent while local optimistic writes and remote events interleave.

pub mod cache;
pub mod command;
pub mod error;
pub mod message_store;
pub mod pending;
pub mod presence;
pub mod realtime;
pub mod reconcile;
pub mod seek;
pub mod session;
pub mod store;

pub use error::SyncError;
pub use message_store::MessageStore;
pub use realtime::RealtimeClient;
pub use store::{StoreConfig, SyncStore};
