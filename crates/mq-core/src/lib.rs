//! mq-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other mq-* crates.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use error::{EncoderFailure, Error, Result};
pub use ids::*;
