//! Incremental sort operator.
//!
//! The output is kept ordered under a comparer by binary insertion. Equal
//! elements are placed after the ones already present. A replacement that
//! changes an element's rank is turned into a synthetic remove + insert pair
//! queued ahead of the next upstream record.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ripple_core::{ChangeEvent, Error, Item, OperatorConfig, Result};
use ripple_reactive::{ChangeStream, Listener, SharedStream, Subscription, VersionedCollection};
use tracing::{debug, trace};

use crate::replay::{attach, new_port, rebase_from, Port};
use crate::worker::{Drain, Signal, Worker};

/// Shared, swappable ordering.
pub type Comparer<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Materialized view of a source ordered by a comparer.
pub struct Sort<T: Item> {
    output: Arc<VersionedCollection<T>>,
    next_comparer: Arc<Mutex<Option<Comparer<T>>>>,
    worker: Worker,
}

impl<T: Item> Sort<T> {
    pub async fn new<C>(source: SharedStream<T>, comparer: C) -> Arc<Self>
    where
        C: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self::with_config(&OperatorConfig::new("sort"), source, comparer).await
    }

    pub async fn with_config<C>(config: &OperatorConfig, source: SharedStream<T>, comparer: C) -> Arc<Self>
    where
        C: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        let output = Arc::new(VersionedCollection::new());
        let next_comparer = Arc::new(Mutex::new(None));
        let signal = Signal::new();
        let port = new_port();
        let subscription = attach(&*source, &port, &signal);
        rebase_from(&port, &*source).await;
        debug!(operator = %config.label, "sort attached");

        let state = SortState {
            label: config.label.clone(),
            check: config.check_invariants,
            source,
            port,
            _subscription: subscription,
            comparer: Arc::new(comparer),
            next_comparer: Arc::clone(&next_comparer),
            correlation: Vec::new(),
            output: Arc::clone(&output),
        };
        let worker = Worker::spawn(config, signal, state);
        Arc::new(Self {
            output,
            next_comparer,
            worker,
        })
    }

    /// Replaces the comparer. The output is rebuilt in the new order.
    pub fn set_comparer<C>(&self, comparer: C)
    where
        C: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        *self.next_comparer.lock() = Some(Arc::new(comparer));
        self.worker.signal().wake();
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
impl<T: Item> ChangeStream<T> for Sort<T> {
    fn subscribe(&self, listener: Listener<T>) -> Subscription {
        self.output.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<T> {
        self.output.snapshot().await
    }
}

struct SortState<T: Item> {
    label: String,
    check: bool,
    source: SharedStream<T>,
    port: Port<T>,
    _subscription: Subscription,
    comparer: Comparer<T>,
    next_comparer: Arc<Mutex<Option<Comparer<T>>>>,
    /// source index -> output index
    correlation: Vec<usize>,
    output: Arc<VersionedCollection<T>>,
}

impl<T: Item> SortState<T> {
    async fn reset(&mut self) -> Result<()> {
        self.correlation.clear();
        if !self.output.is_empty().await {
            self.output.clear().await;
        }
        rebase_from(&self.port, &*self.source).await;
        Ok(())
    }

    /// Fills an empty output in one record with a stable sort.
    async fn load(&mut self, items: &[T]) -> Result<()> {
        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by(|&a, &b| (self.comparer)(&items[a], &items[b]));
        self.correlation = vec![0; items.len()];
        for (position, &index) in order.iter().enumerate() {
            self.correlation[index] = position;
        }
        let sorted = order.into_iter().map(|index| items[index].clone()).collect();
        self.output.insert_range(0, sorted).await?;
        Ok(())
    }

    async fn on_inserted(&mut self, at: usize, items: &[T]) -> Result<()> {
        if at > self.correlation.len() {
            return Err(Error::stale(format!(
                "sort insert at {at} past length {}",
                self.correlation.len()
            )));
        }
        if items.is_empty() {
            return Ok(());
        }
        if self.correlation.is_empty() {
            return self.load(items).await;
        }
        for (offset, item) in items.iter().enumerate() {
            let comparer = Arc::clone(&self.comparer);
            let position = self
                .output
                .insert_sorted(item.clone(), move |a, b| comparer(a, b))
                .await;
            for slot in self.correlation.iter_mut().filter(|slot| **slot >= position) {
                *slot += 1;
            }
            self.correlation.insert(at + offset, position);
        }
        Ok(())
    }

    async fn on_removed(&mut self, at: usize, count: usize) -> Result<()> {
        if at + count > self.correlation.len() {
            return Err(Error::stale(format!(
                "sort remove of {count} at {at} past length {}",
                self.correlation.len()
            )));
        }
        for _ in 0..count {
            let position = self.correlation.remove(at);
            for slot in self.correlation.iter_mut().filter(|slot| **slot > position) {
                *slot -= 1;
            }
            self.output.remove_range(position, 1).await?;
        }
        Ok(())
    }

    async fn on_replaced(&mut self, event: &ChangeEvent<T>) -> Result<()> {
        let ChangeEvent::Replaced {
            version,
            indices,
            old_items,
            new_items,
        } = event
        else {
            return Ok(());
        };
        let mut in_place = Vec::new();
        let mut moved = Vec::new();
        for ((&index, old), new) in indices.iter().zip(old_items).zip(new_items) {
            let position = *self.correlation.get(index).ok_or_else(|| {
                Error::stale(format!("sort replace at {index} past end"))
            })?;
            if (self.comparer)(old, new) == Ordering::Equal {
                in_place.push((position, new.clone()));
            } else {
                moved.push(ChangeEvent::Removed {
                    version: *version,
                    start: index,
                    items: vec![old.clone()],
                });
                moved.push(ChangeEvent::Inserted {
                    version: *version,
                    start: index,
                    items: vec![new.clone()],
                });
            }
        }
        if !moved.is_empty() {
            self.port.lock().inject(moved);
        }
        if !in_place.is_empty() {
            self.output.replace_bulk(in_place).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, event: &ChangeEvent<T>) -> Result<()> {
        match event {
            ChangeEvent::Reset { .. } => self.reset().await,
            ChangeEvent::Inserted { start, items, .. } => self.on_inserted(*start, items).await,
            ChangeEvent::Removed { start, items, .. } => self.on_removed(*start, items.len()).await,
            ChangeEvent::Replaced { .. } => self.on_replaced(event).await,
        }
    }

    async fn verify(&self) -> Result<()> {
        let mut seen = vec![false; self.correlation.len()];
        for &position in &self.correlation {
            match seen.get_mut(position) {
                Some(slot) if !*slot => *slot = true,
                _ => {
                    return Err(Error::stale(format!(
                        "sort correlation is not a permutation at {position}"
                    )))
                }
            }
        }
        let items = self.output.to_vec().await;
        if items.len() != self.correlation.len() {
            return Err(Error::stale(format!(
                "sort output holds {} items for {} source items",
                items.len(),
                self.correlation.len()
            )));
        }
        if let Some(at) = items
            .windows(2)
            .position(|pair| (self.comparer)(&pair[0], &pair[1]) == Ordering::Greater)
        {
            return Err(Error::stale(format!("sort output out of order at {at}")));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Item> Drain for SortState<T> {
    async fn step(&mut self) -> Result<bool> {
        let swapped = self.next_comparer.lock().take();
        if let Some(comparer) = swapped {
            debug!(operator = %self.label, "comparer swapped, rebuilding");
            self.comparer = comparer;
            self.reset().await?;
            return Ok(true);
        }
        let ready = self.port.lock().pop_ready();
        let Some(event) = ready else {
            return Ok(false);
        };
        trace!(operator = %self.label, version = event.version(), kind = ?event.kind(), "applying change");
        self.apply(&event).await?;
        if self.check {
            self.verify().await?;
        }
        Ok(true)
    }

    fn poison(&mut self) {
        self.port.lock().poison();
    }
}
