//! Error taxonomy and classification
//!
//! Every raw transport and OS error is funneled through this module before
//! it leaves the crate; callers never see `russh` or `io` error types.
//! Classification prefers structured signals (error variants, `io::ErrorKind`)
//! and falls back to substring matching over the human-readable description.
//! The substring tables are a documented fragility, not a contract: they are
//! sensitive to library versions and locales and live here, isolated, so a
//! breakage is a one-file fix.

use std::io;

use deckhand_shell::ShellError;
use thiserror::Error;

/// Closed error taxonomy surfaced to callers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassifiedError {
    /// No transport is currently established
    #[error("not connected")]
    NotConnected,

    /// The remote refused the requested channel type
    #[error("invalid channel type")]
    InvalidChannelType,

    /// Authentication was rejected; never retried automatically
    #[error("authentication failed")]
    AuthFailed,

    /// The transport could not be established, or was lost
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// A command or connect attempt exceeded its deadline
    #[error("operation timed out")]
    Timeout,

    /// A logical channel failed mid-command
    #[error("channel error: {0}")]
    ChannelError(String),

    /// An interactive shell never became ready
    #[error("no session")]
    NoSession,
}

/// Reason attached to `ConnectFailed` when the TCP connection is refused:
/// on the target desktop this almost always means Remote Login is off
pub const REASON_LOGIN_DISABLED: &str = "remote login disabled";

/// Reason attached when the host itself cannot be reached
pub const REASON_HOST_UNREACHABLE: &str = "host unreachable";

/// Reason attached when the local network path is down
pub const REASON_NETWORK_UNREACHABLE: &str = "network unreachable";

/// Reason attached when name resolution failed
pub const REASON_DNS: &str = "could not resolve host";

/// Reason attached when an established stream closed under us
pub const REASON_INTERRUPTED: &str = "interrupted";

/// Classify a transport-library error.
///
/// Structured variants are handled first; everything else goes through the
/// message table.
pub fn classify(error: &russh::Error) -> ClassifiedError {
    match error {
        russh::Error::NotAuthenticated => ClassifiedError::AuthFailed,
        russh::Error::Disconnect => ClassifiedError::ConnectFailed(REASON_INTERRUPTED.to_string()),
        russh::Error::ChannelOpenFailure(_) => ClassifiedError::InvalidChannelType,
        russh::Error::IO(io_error) => classify_io(io_error),
        other => classify_message(&other.to_string()),
    }
}

/// Classify an OS-level I/O error.
///
/// `io::ErrorKind` checks run before any string matching because the kinds
/// are stable where descriptions are not.
pub fn classify_io(error: &io::Error) -> ClassifiedError {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => {
            ClassifiedError::ConnectFailed(REASON_LOGIN_DISABLED.to_string())
        }
        io::ErrorKind::TimedOut => ClassifiedError::Timeout,
        io::ErrorKind::NotConnected => ClassifiedError::NotConnected,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => {
            ClassifiedError::ConnectFailed(REASON_INTERRUPTED.to_string())
        }
        _ => classify_message(&error.to_string()),
    }
}

/// Classify a raw error description.
///
/// Precedence matters: POSIX-style phrases run first because their
/// descriptions also match the looser patterns further down.
pub fn classify_message(message: &str) -> ClassifiedError {
    let msg = message.to_lowercase();

    if msg.contains("connection refused") {
        return ClassifiedError::ConnectFailed(REASON_LOGIN_DISABLED.to_string());
    }
    if msg.contains("no route to host")
        || msg.contains("host is unreachable")
        || msg.contains("host unreachable")
    {
        return ClassifiedError::ConnectFailed(REASON_HOST_UNREACHABLE.to_string());
    }
    if msg.contains("network is unreachable") || msg.contains("network unreachable") {
        return ClassifiedError::ConnectFailed(REASON_NETWORK_UNREACHABLE.to_string());
    }
    if msg.contains("not connected") {
        return ClassifiedError::NotConnected;
    }
    if msg.contains("nodename nor servname")
        || msg.contains("name or service not known")
        || msg.contains("failed to lookup address")
        || msg.contains("dns")
    {
        return ClassifiedError::ConnectFailed(REASON_DNS.to_string());
    }
    if msg.contains("timed out") || msg.contains("timeout") {
        return ClassifiedError::Timeout;
    }
    if (msg.contains("auth") && msg.contains("fail"))
        || msg.contains("permission denied")
        || msg.contains("access denied")
    {
        return ClassifiedError::AuthFailed;
    }
    if msg.contains("unknown channel") || msg.contains("invalid channel") {
        return ClassifiedError::InvalidChannelType;
    }
    if msg.contains("connection reset") || msg.contains("broken pipe") || msg.contains("eof") {
        return ClassifiedError::ConnectFailed(REASON_INTERRUPTED.to_string());
    }

    ClassifiedError::ConnectFailed(message.to_string())
}

/// Substrings indicating the transport itself is gone.
///
/// Deliberately broader than the constructor-level tables above: this
/// predicate gates reconnection, where a false negative strands the session
/// and a false positive merely costs one reconnect.
const CONNECTION_LOSS_MARKERS: &[&str] = &[
    "connection reset",
    "broken pipe",
    "eof",
    "connection refused",
    "no route to host",
    "host is unreachable",
    "host unreachable",
    "connection timed out",
    "network is unreachable",
    "network unreachable",
    "not connected",
    "disconnect",
    "interrupted",
];

/// Check whether a raw description indicates loss of the transport
pub fn is_connection_loss_message(message: &str) -> bool {
    let msg = message.to_lowercase();
    CONNECTION_LOSS_MARKERS.iter().any(|m| msg.contains(m))
}

/// Check whether a classified error should escalate to a connection-loss
/// episode.
///
/// A single `Timeout` or evaluator failure is transient and stays
/// per-command; only errors whose detail matches the loss markers, or that
/// state the transport is absent, escalate.
pub fn is_connection_loss(error: &ClassifiedError) -> bool {
    match error {
        ClassifiedError::NotConnected => true,
        ClassifiedError::ConnectFailed(reason) => is_connection_loss_message(reason),
        ClassifiedError::ChannelError(details) => is_connection_loss_message(details),
        _ => false,
    }
}

impl From<ShellError> for ClassifiedError {
    fn from(error: ShellError) -> Self {
        ClassifiedError::ChannelError(error.to_string())
    }
}
