//! # veilbox-store
//!
//! In-memory state for the Veilbox anonymous relay.
//!
//! [`RelayStore`] tracks who is paired with whom, buffers messages for
//! receivers that are not live-paired with their sender, keeps per-user block
//! lists and resolves share-link tokens back to user ids. Every mutation is
//! serialized per user key; nothing takes a store-wide lock for the duration
//! of an operation.
//!
//! State is hydrated from and flushed to a [`SnapshotStore`] by the process
//! that owns the store.

pub mod inbox;
pub mod persistence;
pub mod snapshot;
pub mod store;

mod error;

pub use error::{Result, StoreError};
pub use inbox::InboxSummary;
pub use persistence::{JsonDirStore, MemoryStore, SnapshotStore};
pub use snapshot::{InboxEntry, Snapshot};
pub use store::{RelayStore, StoreStats};
