//! Subscription data types
//!
//! A subscription binds a caller-chosen id to one or more stream names and
//! a callback. The registry owns subscriptions; callers only hold the id.

use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use std::fmt;
use std::sync::Arc;

/// Caller-supplied subscription identifier, also used as the wire command id
pub type SubscriptionId = u64;

/// Ordered, de-duplicated stream names of one subscription
pub type Streams = Arc<[String]>;

/// Callback invoked with every payload routed to a subscription
pub type Callback = Arc<dyn Fn(Payload) + Send + Sync + 'static>;

/// Subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Recorded locally, subscribe not yet acknowledged
    Pending,
    /// Acknowledged by the server, receiving data
    Active,
    /// Unsubscribe sent, waiting for acknowledgement
    Unsubscribing,
    /// Gone; the id may be reused
    Removed,
}

impl SubscriptionState {
    /// Whether the subscription belongs to the desired server-side set
    #[inline]
    pub fn is_wanted(&self) -> bool {
        matches!(self, SubscriptionState::Pending | SubscriptionState::Active)
    }
}

/// Point-in-time view of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: SubscriptionId,
    pub streams: Streams,
    pub state: SubscriptionState,
}

/// One inbound data message as handed to a callback
///
/// The body is forwarded verbatim. Cloning is cheap, so fan-out to several
/// subscriptions shares one allocation.
#[derive(Clone)]
pub struct Payload {
    stream: Option<Arc<str>>,
    body: Arc<RawValue>,
}

impl Payload {
    /// Create payload from an already validated JSON body
    pub fn new(stream: Option<Arc<str>>, body: Arc<RawValue>) -> Self {
        Self { stream, body }
    }

    /// Create payload from JSON text, validating it
    pub fn from_json(stream: Option<&str>, json: &str) -> serde_json::Result<Self> {
        let body = RawValue::from_string(json.to_owned())?;
        Ok(Self {
            stream: stream.map(Arc::from),
            body: Arc::from(body),
        })
    }

    /// Stream the payload was tagged with (`None` on raw connections)
    #[inline]
    pub fn stream(&self) -> Option<&str> {
        self.stream.as_deref()
    }

    /// Raw JSON text of the body
    #[inline]
    pub fn as_str(&self) -> &str {
        self.body.get()
    }

    /// Raw JSON value of the body
    #[inline]
    pub fn raw(&self) -> &RawValue {
        &self.body
    }

    /// Deserialize the body into a caller type
    pub fn parse<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(self.body.get())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("stream", &self.stream)
            .field("body", &self.body.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_payload_from_json() {
        let payload = Payload::from_json(Some("btcusdt@aggTrade"), r#"{"e":"aggTrade","p":"1.0"}"#)
            .unwrap();
        assert_eq!(payload.stream(), Some("btcusdt@aggTrade"));
        assert_eq!(payload.as_str(), r#"{"e":"aggTrade","p":"1.0"}"#);
    }

    #[test]
    fn test_payload_rejects_invalid_json() {
        assert!(Payload::from_json(None, "{not json").is_err());
    }

    #[test]
    fn test_payload_parse() {
        #[derive(Deserialize)]
        struct Trade {
            p: String,
        }

        let payload = Payload::from_json(None, r#"{"e":"aggTrade","p":"25000.5"}"#).unwrap();
        let trade: Trade = payload.parse().unwrap();
        assert_eq!(trade.p, "25000.5");
    }

    #[test]
    fn test_wanted_states() {
        assert!(SubscriptionState::Pending.is_wanted());
        assert!(SubscriptionState::Active.is_wanted());
        assert!(!SubscriptionState::Unsubscribing.is_wanted());
        assert!(!SubscriptionState::Removed.is_wanted());
    }
}
