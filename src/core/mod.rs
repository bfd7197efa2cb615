//! Core subscription types
//!
//! This module contains the data the rest of the client is built around:
//! - SubscriptionId / SubscriptionState: caller handle and lifecycle
//! - Payload / Callback: the opaque message and its consumer
//! - SubscriptionRegistry: single source of truth for what should be subscribed

pub mod registry;
pub mod subscription;

pub use registry::{DeliveryTarget, SubscriptionRegistry};
pub use subscription::{
    Callback, Payload, Streams, SubscriptionId, SubscriptionSnapshot, SubscriptionState,
};
