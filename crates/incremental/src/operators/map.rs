//! Incremental map operator.
//!
//! Applies a transform to every inserted or replaced element. The output
//! mirrors the source element for element, so the only shadow state is the
//! source length.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use ripple_core::{ChangeEvent, Error, Item, OperatorConfig, Result};
use ripple_reactive::{ChangeStream, Listener, SharedStream, Subscription, VersionedCollection};
use tracing::{debug, trace};

use crate::replay::{attach, new_port, rebase_from, Port};
use crate::worker::{Drain, Signal, Worker};

/// Shared element transform.
pub type Mapper<T, U> = Arc<dyn Fn(&T) -> U + Send + Sync>;

/// Materialized element-wise transform of a source.
///
/// # Example
///
/// ```ignore
/// let prices = Arc::new(VersionedCollection::from_items(vec![100, 250]));
/// let labels = Map::new(shared(&prices), |cents: &i32| format!("${}.{:02}", cents / 100, cents % 100)).await;
/// // labels -> ["$1.00", "$2.50"]
/// ```
pub struct Map<T: Item, U: Item> {
    output: Arc<VersionedCollection<U>>,
    worker: Worker,
    _source: PhantomData<fn(T)>,
}

impl<T: Item, U: Item> Map<T, U> {
    pub async fn new<F>(source: SharedStream<T>, mapper: F) -> Arc<Self>
    where
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        Self::with_config(&OperatorConfig::new("map"), source, mapper).await
    }

    pub async fn with_config<F>(config: &OperatorConfig, source: SharedStream<T>, mapper: F) -> Arc<Self>
    where
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let output = Arc::new(VersionedCollection::new());
        let signal = Signal::new();
        let port = new_port();
        let subscription = attach(&*source, &port, &signal);
        rebase_from(&port, &*source).await;
        debug!(operator = %config.label, "map attached");

        let state = MapState {
            label: config.label.clone(),
            source,
            port,
            _subscription: subscription,
            mapper: Arc::new(mapper),
            len: 0,
            output: Arc::clone(&output),
        };
        let worker = Worker::spawn(config, signal, state);
        Arc::new(Self {
            output,
            worker,
            _source: PhantomData,
        })
    }

    #[inline]
    pub fn output(&self) -> &Arc<VersionedCollection<U>> {
        &self.output
    }

    pub async fn dispose(&self) {
        self.worker.shutdown().await;
    }
}

#[async_trait]
impl<T: Item, U: Item> ChangeStream<U> for Map<T, U> {
    fn subscribe(&self, listener: Listener<U>) -> Subscription {
        self.output.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<U> {
        self.output.snapshot().await
    }
}

struct MapState<T: Item, U: Item> {
    label: String,
    source: SharedStream<T>,
    port: Port<T>,
    _subscription: Subscription,
    mapper: Mapper<T, U>,
    /// Source length, equal to the output length
    len: usize,
    output: Arc<VersionedCollection<U>>,
}

impl<T: Item, U: Item> MapState<T, U> {
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
                if *start > self.len {
                    return Err(Error::stale(format!("map insert at {start} past length {}", self.len)));
                }
                if !items.is_empty() {
                    let mapped = items.iter().map(|item| (self.mapper)(item)).collect();
                    self.output.insert_range(*start, mapped).await?;
                    self.len += items.len();
                }
            }
            ChangeEvent::Removed { start, items, .. } => {
                if start + items.len() > self.len {
                    return Err(Error::stale(format!("map remove past length {}", self.len)));
                }
                if !items.is_empty() {
                    self.output.remove_range(*start, items.len()).await?;
                    self.len -= items.len();
                }
            }
            ChangeEvent::Replaced {
                indices, new_items, ..
            } => {
                if let Some(index) = indices.iter().find(|&&index| index >= self.len) {
                    return Err(Error::stale(format!("map replace at {index} past length {}", self.len)));
                }
                if !indices.is_empty() {
                    let updates = indices
                        .iter()
                        .zip(new_items)
                        .map(|(&index, item)| (index, (self.mapper)(item)))
                        .collect();
                    self.output.replace_bulk(updates).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Item, U: Item> Drain for MapState<T, U> {
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
