//! Unified Error Handling
//!
//! One crate-wide error enum, using thiserror, covering the wire codec, the
//! connection protocol, the diff engine and the control/agent services.

use std::io;
use thiserror::Error;

/// Main error type for all volmesh operations
#[derive(Error, Debug)]
pub enum VolmeshError {
    // Wire codec errors
    #[error("frame key too long: {length} bytes (max {max})")]
    KeyTooLong { length: usize, max: usize },

    #[error("frame value too long: {length} bytes (max {max})")]
    ValueTooLong { length: usize, max: usize },

    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("missing argument: {name}")]
    MissingArgument { name: String },

    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("document of kind {actual} not permitted here (expected one of: {expected})")]
    WrongDocumentType { expected: String, actual: String },

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    // Diff engine errors
    #[error("diff cannot be applied: {reason}")]
    DiffApply { reason: String },

    // Connection protocol errors
    #[error("connection lost")]
    ConnectionLost,

    #[error("connection is {state}, not connected")]
    NotConnected { state: String },

    #[error("peer rejected command: {code}: {description}")]
    PeerCall { code: String, description: String },

    #[error("unsupported protocol version: major {major}")]
    UnsupportedProtocolVersion { major: u64 },

    // Service lifecycle errors
    #[error("control service is stopped")]
    ServiceStopped,

    // Transport errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type alias for volmesh operations
pub type VolmeshResult<T> = Result<T, VolmeshError>;

/// Wire-level error codes used in protocol error frames
pub mod wire_code {
    /// The peer does not dispatch this command.
    pub const UNHANDLED_COMMAND: &str = "UNHANDLED_COMMAND";

    /// The handler ran and failed.
    pub const COMMAND_FAILED: &str = "COMMAND_FAILED";

    /// An argument value was outside its permitted type set.
    pub const TYPE_ERROR: &str = "TYPE_ERROR";

    /// The request frame could not be decoded.
    pub const BAD_ARGUMENTS: &str = "BAD_ARGUMENTS";
}

impl VolmeshError {
    /// The error-frame code that represents this error on the wire.
    pub fn as_wire_code(&self) -> &'static str {
        match self {
            VolmeshError::WrongDocumentType { .. } => wire_code::TYPE_ERROR,
            VolmeshError::MissingArgument { .. }
            | VolmeshError::InvalidArgument { .. }
            | VolmeshError::MalformedFrame { .. }
            | VolmeshError::JsonSerialization(_) => wire_code::BAD_ARGUMENTS,
            _ => wire_code::COMMAND_FAILED,
        }
    }
}
