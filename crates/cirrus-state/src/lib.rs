//! cirrus-state: durable storage behind the Cirrus controller datastore.
//!
//! Defines the [`PersistentStore`] capability the in-memory datastore writes
//! through to, and ships [`StateStore`], an implementation backed by
//! [redb](https://docs.rs/redb) with on-disk and in-memory modes.
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Append-only telemetry and the event log use time-ordered composite keys
//! so range reads come back in insertion order.

pub mod error;
pub mod persistent;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use persistent::PersistentStore;
pub use store::StateStore;
pub use types::*;
