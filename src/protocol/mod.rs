//! Connection Protocol
//!
//! The symmetric framed command protocol each side speaks: a per-connection
//! state machine that dispatches inbound commands to a locator, tracks
//! outgoing calls by correlation tag, pings the peer to keep its idle timer
//! quiet, and aborts the transport when the peer goes silent.

mod connection;

pub use connection::Connection;

use crate::error::{wire_code, VolmeshError};
use crate::wire::{Reply, Request};
use async_trait::async_trait;
use std::fmt;

/// Lifecycle of one side of a connection.
///
/// Commands may only be issued or dispatched while `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Disconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A structured command failure, sent back to the caller as an error frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub code: String,
    pub description: String,
}

impl CommandError {
    pub fn unhandled(command: &str) -> Self {
        Self {
            code: wire_code::UNHANDLED_COMMAND.to_string(),
            description: format!("command {command:?} is not dispatched on this side"),
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            code: wire_code::COMMAND_FAILED.to_string(),
            description: description.into(),
        }
    }
}

impl From<VolmeshError> for CommandError {
    fn from(error: VolmeshError) -> Self {
        Self {
            code: error.as_wire_code().to_string(),
            description: error.to_string(),
        }
    }
}

/// Dispatch table mapping inbound commands to their handlers.
///
/// Each side of the protocol supplies its own locator: the control service
/// dispatches agent reports, the agent dispatches cluster updates. Handlers
/// run sequentially per connection, in arrival order.
#[async_trait]
pub trait CommandLocator: Send + Sync + 'static {
    async fn dispatch(&self, request: Request) -> Result<Reply, CommandError>;
}
