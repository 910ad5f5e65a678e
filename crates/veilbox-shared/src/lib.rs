//! # veilbox-shared
//!
//! Types shared by the Veilbox relay store and server: user and message
//! identifiers, the secret salt, and share-link token derivation.

pub mod constants;
pub mod error;
pub mod token;
pub mod types;

pub use token::{LinkToken, Salt};
pub use types::{MessageRef, UserId};
