//! Concatenation of several sources.
//!
//! Each source owns a contiguous range of the output. The operator keeps the
//! current length contributed by every source; a source's range starts at the
//! sum of the lengths before it.

use std::sync::Arc;

use async_trait::async_trait;
use ripple_core::{ChangeEvent, Error, Item, OperatorConfig, Result};
use ripple_reactive::{ChangeStream, Listener, SharedStream, Subscription, VersionedCollection};
use tracing::{debug, trace};

use crate::replay::{attach, new_port, rebase_from, Port};
use crate::worker::{Drain, Signal, Worker};

/// Materialized concatenation of its sources, in order.
pub struct Concat<T: Item> {
    output: Arc<VersionedCollection<T>>,
    worker: Worker,
}

impl<T: Item> Concat<T> {
    /// Creates a concatenation with the default configuration.
    pub async fn new(sources: Vec<SharedStream<T>>) -> Result<Arc<Self>> {
        Self::with_config(&OperatorConfig::new("concat"), sources).await
    }

    /// Creates a concatenation. Fails when `sources` is empty.
    pub async fn with_config(config: &OperatorConfig, sources: Vec<SharedStream<T>>) -> Result<Arc<Self>> {
        if sources.is_empty() {
            return Err(Error::invariant("concat requires at least one source"));
        }
        let output = Arc::new(VersionedCollection::new());
        let signal = Signal::new();
        let mut inputs = Vec::with_capacity(sources.len());
        for source in sources {
            let port = new_port();
            let subscription = attach(&*source, &port, &signal);
            rebase_from(&port, &*source).await;
            inputs.push(Input {
                source,
                port,
                _subscription: subscription,
                len: 0,
            });
        }
        debug!(operator = %config.label, sources = inputs.len(), "concat attached");

        let state = ConcatState {
            label: config.label.clone(),
            check: config.check_invariants,
            inputs,
            output: Arc::clone(&output),
        };
        let worker = Worker::spawn(config, signal, state);
        Ok(Arc::new(Self { output, worker }))
    }

    /// Returns the materialized output.
    #[inline]
    pub fn output(&self) -> &Arc<VersionedCollection<T>> {
        &self.output
    }

    /// Stops the drain loop and detaches from every source.
    pub async fn dispose(&self) {
        self.worker.shutdown().await;
    }
}

#[async_trait]
impl<T: Item> ChangeStream<T> for Concat<T> {
    fn subscribe(&self, listener: Listener<T>) -> Subscription {
        self.output.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<T> {
        self.output.snapshot().await
    }
}

struct Input<T: Item> {
    source: SharedStream<T>,
    port: Port<T>,
    _subscription: Subscription,
    /// Number of output elements contributed by this source
    len: usize,
}

struct ConcatState<T: Item> {
    label: String,
    check: bool,
    inputs: Vec<Input<T>>,
    output: Arc<VersionedCollection<T>>,
}

impl<T: Item> ConcatState<T> {
    fn offset(&self, source: usize) -> usize {
        self.inputs[..source].iter().map(|input| input.len).sum()
    }

    async fn apply(&mut self, source: usize, event: &ChangeEvent<T>) -> Result<()> {
        let offset = self.offset(source);
        let len = self.inputs[source].len;
        match event {
            ChangeEvent::Reset { .. } => {
                if len > 0 {
                    self.output.remove_range(offset, len).await?;
                    self.inputs[source].len = 0;
                }
                let input = &self.inputs[source];
                rebase_from(&input.port, &*input.source).await;
            }
            ChangeEvent::Inserted { start, items, .. } => {
                if *start > len {
                    return Err(Error::stale(format!(
                        "concat source {source} insert at {start} past length {len}"
                    )));
                }
                if !items.is_empty() {
                    self.output.insert_range(offset + start, items.clone()).await?;
                    self.inputs[source].len += items.len();
                }
            }
            ChangeEvent::Removed { start, items, .. } => {
                if start + items.len() > len {
                    return Err(Error::stale(format!(
                        "concat source {source} remove past length {len}"
                    )));
                }
                if !items.is_empty() {
                    self.output.remove_range(offset + start, items.len()).await?;
                    self.inputs[source].len -= items.len();
                }
            }
            ChangeEvent::Replaced {
                indices, new_items, ..
            } => {
                if let Some(index) = indices.iter().find(|&&index| index >= len) {
                    return Err(Error::stale(format!(
                        "concat source {source} replace at {index} past length {len}"
                    )));
                }
                if !indices.is_empty() {
                    let updates = indices
                        .iter()
                        .zip(new_items)
                        .map(|(index, item)| (offset + index, item.clone()))
                        .collect();
                    self.output.replace_bulk(updates).await?;
                }
            }
        }
        Ok(())
    }

    async fn verify(&self) -> Result<()> {
        let expected = self.offset(self.inputs.len());
        let len = self.output.len().await;
        if len != expected {
            return Err(Error::stale(format!(
                "concat output holds {len} items but sources contribute {expected}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Item> Drain for ConcatState<T> {
    async fn step(&mut self) -> Result<bool> {
        let mut progressed = false;
        for source in 0..self.inputs.len() {
            let ready = self.inputs[source].port.lock().pop_ready();
            let Some(event) = ready else {
                continue;
            };
            trace!(
                operator = %self.label,
                source,
                version = event.version(),
                kind = ?event.kind(),
                "applying change"
            );
            self.apply(source, &event).await?;
            progressed = true;
        }
        if progressed && self.check {
            self.verify().await?;
        }
        Ok(progressed)
    }

    fn poison(&mut self) {
        for input in &self.inputs {
            input.port.lock().poison();
        }
    }
}
