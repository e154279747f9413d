//! Positional indexing operator.
//!
//! Every element is wrapped with its current source position. Edits that
//! shift positions re-stamp all shifted elements through one bulk replace.

use std::sync::Arc;

use async_trait::async_trait;
use ripple_core::{ChangeEvent, Error, Item, OperatorConfig, Result};
use ripple_reactive::{ChangeStream, Listener, SharedStream, Subscription, VersionedCollection};
use tracing::{debug, trace};

use crate::replay::{attach, new_port, rebase_from, Port};
use crate::worker::{Drain, Signal, Worker};

/// An element paired with its position in the source.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Indexed<T> {
    pub index: usize,
    pub item: T,
}

impl<T> Indexed<T> {
    #[inline]
    pub fn new(index: usize, item: T) -> Self {
        Self { index, item }
    }
}

/// Materialized `(index, item)` view of a source.
pub struct Index<T: Item> {
    output: Arc<VersionedCollection<Indexed<T>>>,
    worker: Worker,
}

impl<T: Item> Index<T> {
    pub async fn new(source: SharedStream<T>) -> Arc<Self> {
        Self::with_config(&OperatorConfig::new("index"), source).await
    }

    pub async fn with_config(config: &OperatorConfig, source: SharedStream<T>) -> Arc<Self> {
        let output = Arc::new(VersionedCollection::new());
        let signal = Signal::new();
        let port = new_port();
        let subscription = attach(&*source, &port, &signal);
        rebase_from(&port, &*source).await;
        debug!(operator = %config.label, "index attached");

        let state = IndexState {
            label: config.label.clone(),
            check: config.check_invariants,
            source,
            port,
            _subscription: subscription,
            items: Vec::new(),
            output: Arc::clone(&output),
        };
        let worker = Worker::spawn(config, signal, state);
        Arc::new(Self { output, worker })
    }

    #[inline]
    pub fn output(&self) -> &Arc<VersionedCollection<Indexed<T>>> {
        &self.output
    }

    pub async fn dispose(&self) {
        self.worker.shutdown().await;
    }
}

#[async_trait]
impl<T: Item> ChangeStream<Indexed<T>> for Index<T> {
    fn subscribe(&self, listener: Listener<Indexed<T>>) -> Subscription {
        self.output.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<Indexed<T>> {
        self.output.snapshot().await
    }
}

struct IndexState<T: Item> {
    label: String,
    check: bool,
    source: SharedStream<T>,
    port: Port<T>,
    _subscription: Subscription,
    /// Copy of the source content
    items: Vec<T>,
    output: Arc<VersionedCollection<Indexed<T>>>,
}

impl<T: Item> IndexState<T> {
    /// Re-stamps every element from `from` to the end.
    async fn restamp(&self, from: usize) -> Result<()> {
        if from >= self.items.len() {
            return Ok(());
        }
        let updates = self.items[from..]
            .iter()
            .enumerate()
            .map(|(offset, item)| (from + offset, Indexed::new(from + offset, item.clone())))
            .collect();
        self.output.replace_bulk(updates).await?;
        Ok(())
    }

    async fn apply(&mut self, event: &ChangeEvent<T>) -> Result<()> {
        match event {
            ChangeEvent::Reset { .. } => {
                self.items.clear();
                if !self.output.is_empty().await {
                    self.output.clear().await;
                }
                rebase_from(&self.port, &*self.source).await;
            }
            ChangeEvent::Inserted { start, items, .. } => {
                let at = *start;
                if at > self.items.len() {
                    return Err(Error::stale(format!(
                        "index insert at {at} past length {}",
                        self.items.len()
                    )));
                }
                if items.is_empty() {
                    return Ok(());
                }
                self.items.splice(at..at, items.iter().cloned());
                let stamped = items
                    .iter()
                    .enumerate()
                    .map(|(offset, item)| Indexed::new(at + offset, item.clone()))
                    .collect();
                self.output.insert_range(at, stamped).await?;
                self.restamp(at + items.len()).await?;
            }
            ChangeEvent::Removed { start, items, .. } => {
                let at = *start;
                let end = at + items.len();
                if end > self.items.len() {
                    return Err(Error::stale(format!(
                        "index remove of {at}..{end} past length {}",
                        self.items.len()
                    )));
                }
                if items.is_empty() {
                    return Ok(());
                }
                self.items.drain(at..end);
                self.output.remove_range(at, items.len()).await?;
                self.restamp(at).await?;
            }
            ChangeEvent::Replaced {
                indices, new_items, ..
            } => {
                let mut updates = Vec::with_capacity(indices.len());
                for (&index, item) in indices.iter().zip(new_items) {
                    let slot = self.items.get_mut(index).ok_or_else(|| {
                        Error::stale(format!("index replace at {index} past end"))
                    })?;
                    *slot = item.clone();
                    updates.push((index, Indexed::new(index, item.clone())));
                }
                if !updates.is_empty() {
                    self.output.replace_bulk(updates).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Item> Drain for IndexState<T> {
    async fn step(&mut self) -> Result<bool> {
        let ready = self.port.lock().pop_ready();
        let Some(event) = ready else {
            return Ok(false);
        };
        trace!(operator = %self.label, version = event.version(), kind = ?event.kind(), "applying change");
        self.apply(&event).await?;
        if self.check {
            let len = self.output.len().await;
            if len != self.items.len() {
                return Err(Error::stale(format!(
                    "index output holds {len} rows for {} source items",
                    self.items.len()
                )));
            }
        }
        Ok(true)
    }

    fn poison(&mut self) {
        self.port.lock().poison();
    }
}
