//! Self-healing market data stream client
//!
//! Keeps one long-lived WebSocket connection to a Binance-style stream
//! endpoint, lets callers attach and detach named subscriptions at any
//! time, and replays every live subscription after a reconnect.

pub mod core;
pub mod engine;
pub mod hot_path;
pub mod infrastructure;
pub mod ws;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use crate::core::{Callback, Payload, SubscriptionId, SubscriptionState};
pub use engine::{ClientEvent, StreamClient};
pub use infrastructure::config::{Config, LoggingConfig, StreamConfig, StreamMode};
pub use ws::command::CommandKind;
pub use ws::connection::{Connector, Transport, WebSocketError, WsConnector};
pub use ws::supervisor::SupervisorState;

use thiserror::Error;

/// Main error type for the stream client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Subscription id {0} is already in use")]
    DuplicateSubscriptionId(SubscriptionId),

    #[error("Unknown subscription id {0}")]
    UnknownSubscriptionId(SubscriptionId),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("{kind} for subscription {id} not acknowledged after {attempts} attempts")]
    CommandTimeout {
        id: SubscriptionId,
        kind: CommandKind,
        attempts: u32,
    },

    #[error("{kind} for subscription {id} rejected ({code}): {message}")]
    CommandRejected {
        id: SubscriptionId,
        kind: CommandKind,
        code: i64,
        message: String,
    },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Client closed")]
    ClientClosed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WebSocketError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StreamError>;
