//! Per-frame path
//!
//! This module contains the code every inbound frame goes through:
//! - Frame classification and routing (acks vs. data)
//! - Callback dispatch off the read loop

pub mod dispatch;
pub mod routing;

pub use dispatch::Dispatcher;
pub use routing::{AckError, Inbound, MessageRouter, Route};
