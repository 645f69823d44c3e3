//! Session management: per-account registries, call index, outbound queues.

mod store;

pub use store::{AccountSessions, CallInfo, Direction, QueuedMessage, Session, SessionStore};
