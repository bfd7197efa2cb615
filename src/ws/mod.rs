//! WebSocket side of the client: connection, keepalive, reconnect, commands

pub mod backoff;
pub mod command;
pub mod connection;
pub mod ping;
pub mod supervisor;

pub use backoff::Backoff;
pub use command::{Command, CommandChannel, CommandKind, PendingCommand};
pub use connection::{Connector, Frame, Transport, WebSocketConnection, WebSocketError, WsConnector};
pub use ping::Keepalive;
pub use supervisor::{ConnectionSupervisor, SupervisorState};
