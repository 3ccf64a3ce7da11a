//! Error types for the Deckhand library
//!
//! The closed taxonomy lives in `deckhand-ssh`; this module re-exports it
//! as the crate-level error so embedders depend on one type.

pub use deckhand_ssh::{is_connection_loss, ClassifiedError};

/// Result type alias for Deckhand operations
pub type Result<T> = std::result::Result<T, ClassifiedError>;
