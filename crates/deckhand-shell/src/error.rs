//! Shell-stream error types

use thiserror::Error;

/// Errors produced while resolving commands on an interactive-shell stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShellError {
    /// The sub-stream closed while commands were still pending
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// A command's output grew past the ceiling without a sentinel match
    #[error("output buffer overflowed, command appears stuck")]
    BufferOverflow,

    /// The remote evaluator reported an error as the result line
    #[error("remote evaluator error: {0}")]
    Evaluator(String),

    /// Output arrived on the error stream while the command was executing
    #[error("command wrote to stderr: {0}")]
    Stderr(String),
}
