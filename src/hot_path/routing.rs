//! Message router
//!
//! Classifies each inbound text frame as a command acknowledgement or a
//! data event. Acks are matched against pending commands; data events are
//! resolved to the callbacks of every active subscription on the stream.
//!
//! Frame shapes:
//! - ack: `{"result":null,"id":1}` or `{"error":{"code":2,"msg":"..."},"id":1}`
//! - combined data: `{"stream":"btcusdt@aggTrade","data":{...}}`
//! - raw data: the bare payload (object or array)

use crate::core::{DeliveryTarget, Payload, SubscriptionId};
use crate::engine::SharedState;
use crate::infrastructure::config::StreamMode;
use crate::ws::command::CommandKind;
use crate::{Result, StreamError};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;

/// Error body of a rejected command
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AckError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// Top-level fields the router looks at; everything else stays opaque
#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(borrow, default)]
    stream: Option<Cow<'a, str>>,
    #[serde(borrow, default)]
    data: Option<&'a RawValue>,
    #[serde(default)]
    id: Option<Value>,
    /// Set when a `result` key is present, `null` included
    #[serde(default, deserialize_with = "present")]
    result: bool,
    #[serde(default)]
    error: Option<AckError>,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde::de::IgnoredAny::deserialize(deserializer).map(|_| true)
}

/// Classified inbound frame
#[derive(Debug)]
pub enum Inbound<'a> {
    /// Command acknowledgement (`id` is `None` when the server could not echo it)
    Ack {
        id: Option<SubscriptionId>,
        error: Option<AckError>,
    },
    /// Data event
    Data {
        stream: Option<Cow<'a, str>>,
        body: &'a RawValue,
    },
}

impl PartialEq for Inbound<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Inbound::Ack { id: a, error: ea }, Inbound::Ack { id: b, error: eb }) => a == b && ea == eb,
            (Inbound::Data { stream: a, body: ba }, Inbound::Data { stream: b, body: bb }) => {
                a == b && ba.get() == bb.get()
            }
            _ => false,
        }
    }
}

/// Routing decision for one frame
#[derive(Debug)]
pub enum Route {
    /// Ack resolved a pending command
    Acknowledged {
        id: SubscriptionId,
        kind: CommandKind,
        outcome: Result<()>,
    },
    /// Ack with no pending command (late retry answer, or ack-less mode)
    UnmatchedAck(Option<SubscriptionId>),
    /// Data event with its destinations
    Deliver {
        targets: Vec<DeliveryTarget>,
        payload: Payload,
    },
    /// Data event nobody is subscribed to
    Dropped { stream: Option<String> },
}

/// Message router
pub struct MessageRouter {
    mode: StreamMode,
    state: SharedState,
}

impl MessageRouter {
    /// Create router over the shared engine state
    pub fn new(mode: StreamMode, state: SharedState) -> Self {
        Self { mode, state }
    }

    /// Connection mode this router parses for
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Classify a frame without touching any state
    ///
    /// # Errors
    /// `MalformedFrame` when the text is not JSON, or a combined-mode
    /// data frame lacks its `stream`/`data` envelope.
    pub fn classify<'a>(&self, text: &'a str) -> Result<Inbound<'a>> {
        let malformed = |e: serde_json::Error| StreamError::MalformedFrame(e.to_string());

        if !text.trim_start().starts_with('{') {
            let body: &RawValue = serde_json::from_str(text).map_err(malformed)?;
            return match self.mode {
                StreamMode::Raw => Ok(Inbound::Data { stream: None, body }),
                StreamMode::Combined => Err(StreamError::MalformedFrame(
                    "data frame without stream envelope".to_string(),
                )),
            };
        }

        let envelope: Envelope<'a> = serde_json::from_str(text).map_err(malformed)?;

        // An ack answers a command: integer `id` plus `result` or `error`.
        // A lone `error` with no usable id is still a command response.
        if envelope.stream.is_none() {
            let id = envelope.id.as_ref().and_then(Value::as_u64);
            let is_ack = match id {
                Some(_) => envelope.result || envelope.error.is_some(),
                None => envelope.error.is_some() && envelope.id.is_none(),
            };
            if is_ack {
                return Ok(Inbound::Ack {
                    id,
                    error: envelope.error,
                });
            }
        }

        match self.mode {
            StreamMode::Combined => match (envelope.stream, envelope.data) {
                (Some(stream), Some(body)) => Ok(Inbound::Data {
                    stream: Some(stream),
                    body,
                }),
                _ => Err(StreamError::MalformedFrame(
                    "data frame without stream envelope".to_string(),
                )),
            },
            StreamMode::Raw => {
                let body: &RawValue = serde_json::from_str(text).map_err(malformed)?;
                Ok(Inbound::Data { stream: None, body })
            }
        }
    }

    /// Classify a frame and resolve its destination
    ///
    /// # Hot Path
    /// Holds the engine lock only for the ack match or the registry lookup.
    pub fn route(&self, text: &str) -> Result<Route> {
        match self.classify(text)? {
            Inbound::Ack { id: Some(id), error } => {
                let resolved = self.state.lock().acknowledge(id, error);
                Ok(match resolved {
                    Some((kind, outcome)) => Route::Acknowledged { id, kind, outcome },
                    None => Route::UnmatchedAck(Some(id)),
                })
            }
            Inbound::Ack { id: None, error: Some(error) } => Err(StreamError::MalformedFrame(
                format!("error response without request id ({}): {}", error.code, error.msg),
            )),
            Inbound::Ack { id: None, error: None } => Ok(Route::UnmatchedAck(None)),
            Inbound::Data { stream, body } => {
                let targets = {
                    let state = self.state.lock();
                    match &stream {
                        Some(name) => state.registry.resolve(name),
                        None => state.registry.resolve_all(),
                    }
                };

                if targets.is_empty() {
                    return Ok(Route::Dropped {
                        stream: stream.map(Cow::into_owned),
                    });
                }

                let payload = Payload::new(
                    stream.map(|s| Arc::<str>::from(&*s)),
                    Arc::from(body.to_owned()),
                );
                Ok(Route::Deliver { targets, payload })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SubscriptionState;
    use crate::engine::EngineState;
    use crate::ws::command::Command;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    fn shared(require_ack: bool) -> SharedState {
        Arc::new(Mutex::new(EngineState::new(require_ack)))
    }

    fn router(mode: StreamMode) -> MessageRouter {
        MessageRouter::new(mode, shared(true))
    }

    fn add_active(state: &SharedState, id: SubscriptionId, streams: &[&str]) {
        let mut guard = state.lock();
        guard
            .registry
            .add(id, streams.iter().map(|s| s.to_string()).collect(), Arc::new(|_| {}))
            .unwrap();
        guard.registry.activate(id);
    }

    #[test]
    fn test_classify_ack() {
        let router = router(StreamMode::Combined);
        assert_eq!(
            router.classify(r#"{"result":null,"id":1}"#).unwrap(),
            Inbound::Ack { id: Some(1), error: None }
        );
    }

    #[test]
    fn test_classify_error_ack() {
        let router = router(StreamMode::Combined);
        let inbound = router
            .classify(r#"{"error":{"code":2,"msg":"Invalid request"},"id":4}"#)
            .unwrap();
        assert_eq!(
            inbound,
            Inbound::Ack {
                id: Some(4),
                error: Some(AckError { code: 2, msg: "Invalid request".to_string() }),
            }
        );
    }

    #[test]
    fn test_raw_payload_with_id_is_data() {
        let router = router(StreamMode::Raw);

        // Trade payloads carry their own numeric id
        let text = r#"{"e":"trade","id":1,"p":"25000.50"}"#;
        match router.classify(text).unwrap() {
            Inbound::Data { stream, body } => {
                assert!(stream.is_none());
                assert_eq!(body.get(), text);
            }
            other => panic!("expected data, got {:?}", other),
        }

        assert!(matches!(
            router.classify(r#"{"id":"abc","result":null}"#).unwrap(),
            Inbound::Data { .. }
        ));
        assert_eq!(
            router.classify(r#"{"result":null,"id":7}"#).unwrap(),
            Inbound::Ack { id: Some(7), error: None }
        );
    }

    #[test]
    fn test_combined_frame_with_id_only_is_malformed() {
        let router = router(StreamMode::Combined);
        assert!(matches!(
            router.classify(r#"{"id":1}"#),
            Err(StreamError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_classify_combined_data() {
        let router = router(StreamMode::Combined);
        let text = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","p":"25000.50"}}"#;

        match router.classify(text).unwrap() {
            Inbound::Data { stream, body } => {
                assert_eq!(stream.as_deref(), Some("btcusdt@aggTrade"));
                assert_eq!(body.get(), r#"{"e":"aggTrade","p":"25000.50"}"#);
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_raw_object_and_array() {
        let router = router(StreamMode::Raw);

        let text = r#"{"e":"bookTicker","s":"BTCUSDT","b":"25000.50"}"#;
        match router.classify(text).unwrap() {
            Inbound::Data { stream, body } => {
                assert!(stream.is_none());
                assert_eq!(body.get(), text);
            }
            other => panic!("expected data, got {:?}", other),
        }

        let array = r#"[{"e":"24hrMiniTicker","s":"BTCUSDT"}]"#;
        assert!(matches!(router.classify(array).unwrap(), Inbound::Data { stream: None, .. }));
    }

    #[test]
    fn test_classify_malformed() {
        let router = router(StreamMode::Combined);
        assert!(matches!(router.classify("{\"stream\":"), Err(StreamError::MalformedFrame(_))));
        assert!(matches!(router.classify("not json"), Err(StreamError::MalformedFrame(_))));
        // Combined connections always tag data
        assert!(matches!(
            router.classify(r#"{"e":"aggTrade"}"#),
            Err(StreamError::MalformedFrame(_))
        ));
        assert!(matches!(router.classify("[1,2]"), Err(StreamError::MalformedFrame(_))));
    }

    #[test]
    fn test_route_drops_unsubscribed_stream() {
        let state = shared(true);
        add_active(&state, 1, &["btcusdt@aggTrade"]);
        let router = MessageRouter::new(StreamMode::Combined, state);

        let route = router
            .route(r#"{"stream":"ethusdt@aggTrade","data":{"e":"aggTrade"}}"#)
            .unwrap();
        match route {
            Route::Dropped { stream } => assert_eq!(stream.as_deref(), Some("ethusdt@aggTrade")),
            other => panic!("expected drop, got {:?}", other),
        }
    }

    #[test]
    fn test_route_fan_out() {
        let state = shared(true);
        add_active(&state, 1, &["btcusdt@aggTrade"]);
        add_active(&state, 2, &["btcusdt@aggTrade", "ethusdt@aggTrade"]);
        let router = MessageRouter::new(StreamMode::Combined, state);

        let route = router
            .route(r#"{"stream":"btcusdt@aggTrade","data":{"p":"1"}}"#)
            .unwrap();
        match route {
            Route::Deliver { targets, payload } => {
                let ids: Vec<SubscriptionId> = targets.iter().map(|t| t.id).collect();
                assert_eq!(ids, vec![1, 2]);
                assert_eq!(payload.stream(), Some("btcusdt@aggTrade"));
                assert_eq!(payload.as_str(), r#"{"p":"1"}"#);
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn test_route_raw_reaches_all_active() {
        let state = shared(true);
        add_active(&state, 1, &["btcusdt@bookTicker"]);
        add_active(&state, 2, &["ethusdt@bookTicker"]);
        let router = MessageRouter::new(StreamMode::Raw, state);

        match router.route(r#"{"e":"bookTicker","s":"ETHUSDT"}"#).unwrap() {
            Route::Deliver { targets, payload } => {
                assert_eq!(targets.len(), 2);
                assert_eq!(payload.stream(), None);
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn test_route_ack_activates_subscription() {
        let state = shared(true);
        {
            let mut guard = state.lock();
            guard
                .registry
                .add(1, vec!["btcusdt@aggTrade".to_string()], Arc::new(|_| {}))
                .unwrap();
            let streams = guard.registry.streams(1).unwrap();
            guard.commands.record_sent(Command::subscribe(1, streams), Instant::now());
        }
        let router = MessageRouter::new(StreamMode::Combined, state.clone());

        match router.route(r#"{"result":null,"id":1}"#).unwrap() {
            Route::Acknowledged { id, kind, outcome } => {
                assert_eq!(id, 1);
                assert_eq!(kind, CommandKind::Subscribe);
                assert!(outcome.is_ok());
            }
            other => panic!("expected ack, got {:?}", other),
        }
        assert_eq!(state.lock().registry.state(1), Some(SubscriptionState::Active));

        // A second ack for the same id has nothing left to match
        assert!(matches!(
            router.route(r#"{"result":null,"id":1}"#).unwrap(),
            Route::UnmatchedAck(Some(1))
        ));
    }

    #[test]
    fn test_route_error_without_id() {
        let router = router(StreamMode::Combined);
        let result = router.route(r#"{"error":{"code":3,"msg":"Invalid JSON"},"id":null}"#);
        assert!(matches!(result, Err(StreamError::MalformedFrame(_))));
    }
}

// Hot Path Checklist:
// ✓ Single JSON pass for combined frames (payload borrowed as RawValue)
// ✓ Lock held only for ack match / registry lookup
// ✓ Payload shared across fan-out targets (Arc)
// ✓ Malformed frames reported, never panic
