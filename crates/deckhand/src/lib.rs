//! # Deckhand
//!
//! Remote-control core for driving a desktop machine's media applications
//! and system volume from a handheld client, over one authenticated SSH
//! session.
//!
//! The core multiplexes independent logical command streams over a single
//! transport, pipelines commands on long-lived interactive shells, and
//! keeps the session usable across flaky networks with a heartbeat-driven
//! lifecycle supervisor. Applications supply opaque command text and parse
//! the returned raw strings themselves.

#![warn(missing_docs)]

pub use deckhand_shell as shell;
pub use deckhand_ssh as ssh;

/// Error types for the Deckhand library
pub mod error;

/// Seam traits between the supervisor and the transport
pub mod link;

/// Lifecycle and heartbeat supervision
pub mod supervisor;

pub use deckhand_ssh::{ExecuteOptions, TransportConfig};
pub use error::{ClassifiedError, Result};
pub use link::{CommandLink, Connector, SshConnector};
pub use supervisor::{
    HeartbeatRecord, LinkEvent, LinkState, Supervisor, SupervisorConfig, HEARTBEAT_CHANNEL,
};
