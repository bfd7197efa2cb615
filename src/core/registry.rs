//! Subscription registry
//!
//! In-memory map of subscription id -> (streams, callback, state).
//! Not synchronized on its own: the engine keeps it behind the same lock
//! as the pending command table so replay, caller commands and ack
//! handling all observe one consistent view.

use crate::core::subscription::{
    Callback, Streams, SubscriptionId, SubscriptionSnapshot, SubscriptionState,
};
use crate::{Result, StreamError};
use std::collections::{HashMap, HashSet};

/// Registry entry
struct Entry {
    streams: Streams,
    callback: Callback,
    state: SubscriptionState,
    /// Server acknowledged a SUBSCRIBE for this entry
    confirmed: bool,
    /// Insertion sequence, unique for the lifetime of the registry.
    /// Orders snapshots and keys delivery workers across id reuse.
    seq: u64,
}

/// Resolved destination for one data frame
#[derive(Clone)]
pub struct DeliveryTarget {
    pub id: SubscriptionId,
    /// Delivery key (never reused, unlike the id)
    pub key: u64,
    pub callback: Callback,
}

impl std::fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTarget")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

/// Subscription registry
pub struct SubscriptionRegistry {
    entries: HashMap<SubscriptionId, Entry>,
    next_seq: u64,
}

impl SubscriptionRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Insert a `Pending` subscription
    ///
    /// Stream names are de-duplicated keeping first occurrence order.
    ///
    /// # Errors
    /// - `DuplicateSubscriptionId` if `id` is present and not removed
    /// - `InvalidRequest` if no stream name is given
    pub fn add(&mut self, id: SubscriptionId, streams: Vec<String>, callback: Callback) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(StreamError::DuplicateSubscriptionId(id));
        }

        let mut seen = HashSet::with_capacity(streams.len());
        let streams: Vec<String> = streams
            .into_iter()
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
        if streams.is_empty() {
            return Err(StreamError::InvalidRequest(format!(
                "subscription {} has no stream names",
                id
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id,
            Entry {
                streams: streams.into(),
                callback,
                state: SubscriptionState::Pending,
                confirmed: false,
                seq,
            },
        );
        Ok(())
    }

    /// Remove a subscription locally, without any server round trip
    ///
    /// # Errors
    /// `UnknownSubscriptionId` if `id` is absent
    pub fn remove(&mut self, id: SubscriptionId) -> Result<SubscriptionSnapshot> {
        self.purge(id).ok_or(StreamError::UnknownSubscriptionId(id))
    }

    /// Transition to `Removed` and drop the entry, returning its final view
    pub fn purge(&mut self, id: SubscriptionId) -> Option<SubscriptionSnapshot> {
        self.entries.remove(&id).map(|entry| SubscriptionSnapshot {
            id,
            streams: entry.streams,
            state: SubscriptionState::Removed,
        })
    }

    /// Mark a subscription `Unsubscribing`, returning its streams
    ///
    /// # Errors
    /// `UnknownSubscriptionId` if `id` is absent
    pub fn begin_unsubscribe(&mut self, id: SubscriptionId) -> Result<Streams> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(StreamError::UnknownSubscriptionId(id))?;
        entry.state = SubscriptionState::Unsubscribing;
        Ok(entry.streams.clone())
    }

    /// Record a confirmed SUBSCRIBE
    ///
    /// `Pending` -> `Active`. An entry already being removed only keeps
    /// the confirmation, for a later `restore`.
    pub fn activate(&mut self, id: SubscriptionId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.confirmed = true;
                if entry.state == SubscriptionState::Pending {
                    entry.state = SubscriptionState::Active;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Undo `begin_unsubscribe` after a failed unsubscribe
    ///
    /// Back to `Active` only if the server ever confirmed the subscription,
    /// otherwise back to `Pending`. Returns the new state.
    pub fn restore(&mut self, id: SubscriptionId) -> Option<SubscriptionState> {
        let entry = self.entries.get_mut(&id)?;
        if entry.state != SubscriptionState::Unsubscribing {
            return None;
        }
        entry.state = if entry.confirmed {
            SubscriptionState::Active
        } else {
            SubscriptionState::Pending
        };
        Some(entry.state)
    }

    /// Check if the server ever confirmed a SUBSCRIBE for `id`
    pub fn is_confirmed(&self, id: SubscriptionId) -> bool {
        self.entries.get(&id).is_some_and(|entry| entry.confirmed)
    }

    /// Current state of a subscription (`None` once removed)
    pub fn state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.entries.get(&id).map(|entry| entry.state)
    }

    /// Stream names of a subscription
    pub fn streams(&self, id: SubscriptionId) -> Option<Streams> {
        self.entries.get(&id).map(|entry| entry.streams.clone())
    }

    /// Subscriptions that should exist server-side, in insertion order
    ///
    /// Includes `Pending` entries that were never sent (or whose subscribe
    /// was lost with a connection) together with `Active` ones.
    pub fn snapshot(&self) -> Vec<SubscriptionSnapshot> {
        let mut wanted: Vec<(u64, SubscriptionSnapshot)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_wanted())
            .map(|(&id, entry)| {
                (
                    entry.seq,
                    SubscriptionSnapshot {
                        id,
                        streams: entry.streams.clone(),
                        state: entry.state,
                    },
                )
            })
            .collect();
        wanted.sort_unstable_by_key(|(seq, _)| *seq);
        wanted.into_iter().map(|(_, snap)| snap).collect()
    }

    /// All `Active` subscriptions listening to `stream` (fan-out)
    pub fn resolve(&self, stream: &str) -> Vec<DeliveryTarget> {
        self.collect_active(|entry| entry.streams.iter().any(|s| s == stream))
    }

    /// All `Active` subscriptions (connection-level stream identity)
    pub fn resolve_all(&self) -> Vec<DeliveryTarget> {
        self.collect_active(|_| true)
    }

    fn collect_active(&self, pred: impl Fn(&Entry) -> bool) -> Vec<DeliveryTarget> {
        let mut targets: Vec<DeliveryTarget> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Active && pred(entry))
            .map(|(&id, entry)| DeliveryTarget {
                id,
                key: entry.seq,
                callback: entry.callback.clone(),
            })
            .collect();
        targets.sort_unstable_by_key(|t| t.key);
        targets
    }

    /// Purge every `Unsubscribing` entry
    ///
    /// Called when the connection drops: a fresh connection starts with no
    /// server-side subscriptions, so pending unsubscribes are complete.
    pub fn purge_unsubscribing(&mut self) -> Vec<SubscriptionId> {
        let ids: Vec<SubscriptionId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Unsubscribing)
            .map(|(&id, _)| id)
            .collect();
        for id in &ids {
            self.entries.remove(id);
        }
        ids
    }

    /// Delivery keys of all present entries
    pub fn live_keys(&self) -> HashSet<u64> {
        self.entries.values().map(|entry| entry.seq).collect()
    }

    /// Ids of all present subscriptions, ascending
    pub fn ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every subscription (shutdown)
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Number of present subscriptions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
