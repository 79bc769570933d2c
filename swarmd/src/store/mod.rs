//! Durable state store
//!
//! A rusqlite store behind a channel-based actor. The actor is the single
//! writer; readers go through the same channel, so all transitions for a
//! given entity are totally ordered.

mod db;
mod manager;
mod messages;
mod recovery;

pub use db::{Store, StoreMetrics};
pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
pub use recovery::{RecoveryStats, is_process_alive, recover};
