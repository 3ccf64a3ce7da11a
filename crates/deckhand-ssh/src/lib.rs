//! # Deckhand SSH Transport
//!
//! SSH transport layer for Deckhand: the classified error taxonomy, the
//! authenticated connection, persistent channel executors for logical
//! command streams, and the bounded ephemeral exec path.

#![warn(missing_docs)]

/// Transport configuration and session establishment
pub mod transport;

/// Channel executor for persistent interactive shells
pub mod channel;

/// Connection management and command routing
pub mod connection;

/// Error taxonomy and classification
pub mod error;

pub use channel::ChannelExecutor;
pub use connection::{Connection, ExecuteOptions};
pub use error::{
    classify, classify_io, classify_message, is_connection_loss, is_connection_loss_message,
    ClassifiedError,
};
pub use transport::TransportConfig;
