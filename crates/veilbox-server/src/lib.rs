//! # veilbox-server
//!
//! Process around the Veilbox relay store:
//! - **Dispatch** of platform updates into store operations and transport
//!   actions
//! - **HTTP API** (axum) that accepts updates from the platform bridge and
//!   answers with the actions to perform
//! - **Lifecycle**: snapshot load at start, periodic and manual flushes,
//!   a final flush at shutdown, and sweeping of idle per-user locks

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flush;
