//! Reversal operator.
//!
//! Source index `i` maps to output index `len - 1 - i`, where `len` is the
//! output length at the time the record is applied.

use std::sync::Arc;

use async_trait::async_trait;
use ripple_core::{ChangeEvent, Error, Item, OperatorConfig, Result};
use ripple_reactive::{ChangeStream, Listener, SharedStream, Subscription, VersionedCollection};
use tracing::{debug, trace};

use crate::replay::{attach, new_port, rebase_from, Port};
use crate::worker::{Drain, Signal, Worker};

/// Materialized reversed view of a source.
pub struct Reverse<T: Item> {
    output: Arc<VersionedCollection<T>>,
    worker: Worker,
}

impl<T: Item> Reverse<T> {
    pub async fn new(source: SharedStream<T>) -> Arc<Self> {
        Self::with_config(&OperatorConfig::new("reverse"), source).await
    }

    pub async fn with_config(config: &OperatorConfig, source: SharedStream<T>) -> Arc<Self> {
        let output = Arc::new(VersionedCollection::new());
        let signal = Signal::new();
        let port = new_port();
        let subscription = attach(&*source, &port, &signal);
        rebase_from(&port, &*source).await;
        debug!(operator = %config.label, "reverse attached");

        let state = ReverseState {
            label: config.label.clone(),
            source,
            port,
            _subscription: subscription,
            len: 0,
            output: Arc::clone(&output),
        };
        let worker = Worker::spawn(config, signal, state);
        Arc::new(Self { output, worker })
    }

    #[inline]
    pub fn output(&self) -> &Arc<VersionedCollection<T>> {
        &self.output
    }

    pub async fn dispose(&self) {
        self.worker.shutdown().await;
    }
}

#[async_trait]
impl<T: Item> ChangeStream<T> for Reverse<T> {
    fn subscribe(&self, listener: Listener<T>) -> Subscription {
        self.output.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<T> {
        self.output.snapshot().await
    }
}

struct ReverseState<T: Item> {
    label: String,
    source: SharedStream<T>,
    port: Port<T>,
    _subscription: Subscription,
    len: usize,
    output: Arc<VersionedCollection<T>>,
}

impl<T: Item> ReverseState<T> {
    async fn apply(&mut self, event: &ChangeEvent<T>) -> Result<()> {
        match event {
            ChangeEvent::Reset { .. } => {
                self.len = 0;
                if !self.output.is_empty().await {
                    self.output.clear().await;
                }
                rebase_from(&self.port, &*self.source).await;
            }
            ChangeEvent::Inserted { start, items, .. } => {
                let at = *start;
                if at > self.len {
                    return Err(Error::stale(format!("reverse insert at {at} past length {}", self.len)));
                }
                if !items.is_empty() {
                    let reversed = items.iter().rev().cloned().collect();
                    self.output.insert_range(self.len - at, reversed).await?;
                    self.len += items.len();
                }
            }
            ChangeEvent::Removed { start, items, .. } => {
                let (at, count) = (*start, items.len());
                if at + count > self.len {
                    return Err(Error::stale(format!("reverse remove past length {}", self.len)));
                }
                if count > 0 {
                    self.output.remove_range(self.len - at - count, count).await?;
                    self.len -= count;
                }
            }
            ChangeEvent::Replaced {
                indices, new_items, ..
            } => {
                if let Some(index) = indices.iter().find(|&&index| index >= self.len) {
                    return Err(Error::stale(format!("reverse replace at {index} past length {}", self.len)));
                }
                if !indices.is_empty() {
                    let updates = indices
                        .iter()
                        .zip(new_items)
                        .map(|(&index, item)| (self.len - 1 - index, item.clone()))
                        .collect();
                    self.output.replace_bulk(updates).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Item> Drain for ReverseState<T> {
    async fn step(&mut self) -> Result<bool> {
        let ready = self.port.lock().pop_ready();
        let Some(event) = ready else {
            return Ok(false);
        };
        trace!(operator = %self.label, version = event.version(), kind = ?event.kind(), "applying change");
        self.apply(&event).await?;
        Ok(true)
    }

    fn poison(&mut self) {
        self.port.lock().poison();
    }
}
