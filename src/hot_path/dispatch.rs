//! Callback dispatcher
//!
//! Every subscription gets its own delivery worker: a named thread fed by
//! a bounded crossbeam channel. The read loop only enqueues, so a slow
//! or blocking callback stalls its own subscription and nothing else.
//! Payloads reach a callback in the order frames arrived. When a worker's
//! queue is full the new payload is dropped and counted.

use crate::core::{Callback, DeliveryTarget, Payload, SubscriptionId};
use crate::infrastructure::metrics::StreamMetrics;
use crossbeam::channel::{self, Sender, TrySendError};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Delivery worker handle
struct Worker {
    id: SubscriptionId,
    tx: Sender<Payload>,
    /// Queue was full on the last attempt
    saturated: bool,
}

impl Worker {
    fn spawn(id: SubscriptionId, callback: Callback, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded::<Payload>(capacity);

        std::thread::Builder::new()
            .name(format!("fstream-sub-{}", id))
            .spawn(move || {
                for payload in rx.iter() {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| callback(payload)));
                    if result.is_err() {
                        tracing::error!(id, "subscription callback panicked");
                    }
                }
                tracing::trace!(id, "delivery worker finished");
            })?;

        Ok(Self {
            id,
            tx,
            saturated: false,
        })
    }
}

/// Callback dispatcher
///
/// Owned by the connection supervisor; never shared.
pub struct Dispatcher {
    /// Workers keyed by registry delivery key
    workers: HashMap<u64, Worker>,
    /// Payloads buffered per subscription
    capacity: usize,
    metrics: Arc<StreamMetrics>,
}

impl Dispatcher {
    /// Create dispatcher with no workers
    pub fn new(metrics: Arc<StreamMetrics>, capacity: usize) -> Self {
        Self {
            workers: HashMap::new(),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Hand one payload to every target
    ///
    /// Never blocks. Returns the number of callbacks the payload was queued for.
    pub fn deliver(&mut self, targets: Vec<DeliveryTarget>, payload: Payload) -> usize {
        let mut delivered = 0;
        let mut dropped = 0;

        for target in targets {
            if !self.workers.contains_key(&target.key) {
                match Worker::spawn(target.id, target.callback, self.capacity) {
                    Ok(worker) => {
                        self.workers.insert(target.key, worker);
                    }
                    Err(e) => {
                        tracing::error!(id = target.id, error = %e, "failed to start delivery worker");
                        continue;
                    }
                }
            }

            let Some(worker) = self.workers.get_mut(&target.key) else {
                continue;
            };
            match worker.tx.try_send(payload.clone()) {
                Ok(()) => {
                    worker.saturated = false;
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    if !worker.saturated {
                        tracing::warn!(
                            id = worker.id,
                            capacity = self.capacity,
                            "delivery queue full, dropping payloads"
                        );
                        worker.saturated = true;
                    }
                    dropped += 1;
                }
                Err(TrySendError::Disconnected(_)) => {
                    // Worker thread is gone; a fresh one is spawned next time
                    self.workers.remove(&target.key);
                }
            }
        }

        self.metrics.record_deliveries(delivered as u64);
        if dropped > 0 {
            self.metrics.record_dropped_deliveries(dropped);
        }
        delivered
    }

    /// Stop workers of subscriptions that no longer exist
    ///
    /// Workers drain what is already queued before exiting.
    pub fn retain(&mut self, live: &HashSet<u64>) -> usize {
        let before = self.workers.len();
        self.workers.retain(|key, worker| {
            let keep = live.contains(key);
            if !keep {
                tracing::debug!(id = worker.id, "releasing delivery worker");
            }
            keep
        });
        before - self.workers.len()
    }

    /// Stop all workers after they drain their queues
    pub fn shutdown(&mut self) {
        self.workers.clear();
    }

    /// Number of running workers
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}
