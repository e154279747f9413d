//! Incremental filter operator.
//!
//! Keeps the subsequence of the source accepted by a predicate. The shadow
//! state is one correlation slot per source element holding the element's
//! output index, or `None` when the predicate rejected it.
//!
//! Predicates are awaited inside the drain, so a predicate may consult
//! async state. Plain `Fn(&T) -> bool` closures are predicates as they are;
//! async closures are wrapped in [`AsyncPredicate`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ripple_core::{ChangeEvent, Error, Item, OperatorConfig, Result};
use ripple_reactive::{ChangeStream, Listener, SharedStream, Subscription, VersionedCollection};
use tracing::{debug, trace};

use crate::replay::{attach, new_port, rebase_from, Port};
use crate::worker::{Drain, Signal, Worker};

/// Decides whether a source element belongs to the filter output.
#[async_trait]
pub trait Predicate<T: Item>: Send + Sync {
    async fn accepts(&self, item: &T) -> bool;
}

#[async_trait]
impl<T, F> Predicate<T> for F
where
    T: Item,
    F: Fn(&T) -> bool + Send + Sync,
{
    async fn accepts(&self, item: &T) -> bool {
        self(item)
    }
}

/// Adapts an async closure taking the element by value into a [`Predicate`].
///
/// ```ignore
/// let allowed = Filter::new(shared(&users), AsyncPredicate::new(move |user: User| {
///     let acl = Arc::clone(&acl);
///     async move { acl.read().await.contains(&user.id) }
/// }))
/// .await;
/// ```
pub struct AsyncPredicate<F>(F);

impl<F> AsyncPredicate<F> {
    pub fn new(predicate: F) -> Self {
        Self(predicate)
    }
}

#[async_trait]
impl<T, F, Fut> Predicate<T> for AsyncPredicate<F>
where
    T: Item,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn accepts(&self, item: &T) -> bool {
        (self.0)(item.clone()).await
    }
}

type SharedPredicate<T> = Arc<dyn Predicate<T>>;

/// Materialized subsequence of a source accepted by a predicate.
///
/// # Example
///
/// ```ignore
/// let people = Arc::new(VersionedCollection::from_items(vec![17, 25, 40]));
/// let adults = Filter::new(shared(&people), |age: &i32| *age >= 18).await;
/// // adults -> [25, 40]
/// adults.set_predicate(|age: &i32| *age >= 30);
/// // adults -> [40]
/// ```
pub struct Filter<T: Item> {
    output: Arc<VersionedCollection<T>>,
    next_predicate: Arc<Mutex<Option<SharedPredicate<T>>>>,
    worker: Worker,
}

impl<T: Item> Filter<T> {
    /// Creates a filter with the default configuration.
    pub async fn new<P>(source: SharedStream<T>, predicate: P) -> Arc<Self>
    where
        P: Predicate<T> + 'static,
    {
        Self::with_config(&OperatorConfig::new("filter"), source, predicate).await
    }

    /// Creates a filter.
    pub async fn with_config<P>(config: &OperatorConfig, source: SharedStream<T>, predicate: P) -> Arc<Self>
    where
        P: Predicate<T> + 'static,
    {
        let output = Arc::new(VersionedCollection::new());
        let next_predicate = Arc::new(Mutex::new(None));
        let signal = Signal::new();
        let port = new_port();
        let subscription = attach(&*source, &port, &signal);
        rebase_from(&port, &*source).await;
        debug!(operator = %config.label, "filter attached");

        let state = FilterState {
            label: config.label.clone(),
            check: config.check_invariants,
            source,
            port,
            _subscription: subscription,
            predicate: Arc::new(predicate),
            next_predicate: Arc::clone(&next_predicate),
            correlation: Vec::new(),
            output: Arc::clone(&output),
        };
        let worker = Worker::spawn(config, signal, state);
        Arc::new(Self {
            output,
            next_predicate,
            worker,
        })
    }

    /// Replaces the predicate. The output is rebuilt from a fresh snapshot.
    ///
    /// Several swaps issued before the worker gets to them collapse into the last one.
    pub fn set_predicate<P>(&self, predicate: P)
    where
        P: Predicate<T> + 'static,
    {
        *self.next_predicate.lock() = Some(Arc::new(predicate));
        self.worker.signal().wake();
    }

    /// Returns the materialized output.
    #[inline]
    pub fn output(&self) -> &Arc<VersionedCollection<T>> {
        &self.output
    }

    /// Stops the drain loop and detaches from the source.
    pub async fn dispose(&self) {
        self.worker.shutdown().await;
    }
}

#[async_trait]
impl<T: Item> ChangeStream<T> for Filter<T> {
    fn subscribe(&self, listener: Listener<T>) -> Subscription {
        self.output.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<T> {
        self.output.snapshot().await
    }
}

struct FilterState<T: Item> {
    label: String,
    check: bool,
    source: SharedStream<T>,
    port: Port<T>,
    _subscription: Subscription,
    predicate: SharedPredicate<T>,
    next_predicate: Arc<Mutex<Option<SharedPredicate<T>>>>,
    /// source index -> output index
    correlation: Vec<Option<usize>>,
    output: Arc<VersionedCollection<T>>,
}

impl<T: Item> FilterState<T> {
    async fn reset(&mut self) -> Result<()> {
        self.correlation.clear();
        if !self.output.is_empty().await {
            self.output.clear().await;
        }
        rebase_from(&self.port, &*self.source).await;
        Ok(())
    }

    /// Output index the first accepted element at or after `at` would take.
    fn output_position(&self, at: usize) -> usize {
        self.correlation[..at]
            .iter()
            .rev()
            .find_map(|slot| *slot)
            .map_or(0, |index| index + 1)
    }

    fn shift_after(&mut self, at: usize, delta: isize) {
        for slot in self.correlation[at..].iter_mut().flatten() {
            *slot = slot.wrapping_add_signed(delta);
        }
    }

    async fn on_inserted(&mut self, at: usize, items: &[T]) -> Result<()> {
        if at > self.correlation.len() {
            return Err(Error::stale(format!(
                "filter insert at {at} past source length {}",
                self.correlation.len()
            )));
        }
        let start = self.output_position(at);
        let mut accepted = Vec::new();
        let mut slots = Vec::with_capacity(items.len());
        for item in items {
            if self.predicate.accepts(item).await {
                slots.push(Some(start + accepted.len()));
                accepted.push(item.clone());
            } else {
                slots.push(None);
            }
        }
        let count = accepted.len();
        self.shift_after(at, count as isize);
        self.correlation.splice(at..at, slots);
        if count > 0 {
            self.output.insert_range(start, accepted).await?;
        }
        Ok(())
    }

    async fn on_removed(&mut self, at: usize, count: usize) -> Result<()> {
        let end = at + count;
        if end > self.correlation.len() {
            return Err(Error::stale(format!(
                "filter remove of {at}..{end} past source length {}",
                self.correlation.len()
            )));
        }
        // accepted elements of a source range are contiguous in the output
        let removed: Vec<usize> = self.correlation.drain(at..end).flatten().collect();
        if let Some(&first) = removed.first() {
            self.shift_after(at, -(removed.len() as isize));
            self.output.remove_range(first, removed.len()).await?;
        }
        Ok(())
    }

    async fn on_replaced(&mut self, indices: &[usize], new_items: &[T]) -> Result<()> {
        let mut rejected = Vec::new();
        let mut admitted = Vec::new();
        let mut kept = Vec::new();
        for (&index, item) in indices.iter().zip(new_items) {
            let slot = *self.correlation.get(index).ok_or_else(|| {
                Error::stale(format!(
                    "filter replace at {index} past source length {}",
                    self.correlation.len()
                ))
            })?;
            let accepted = self.predicate.accepts(item).await;
            match (slot, accepted) {
                (Some(_), true) => kept.push((index, item)),
                (Some(_), false) => rejected.push(index),
                (None, true) => admitted.push((index, item)),
                (None, false) => {}
            }
        }

        // Removals run back to front so earlier output positions stay valid.
        rejected.sort_unstable_by(|a, b| b.cmp(a));
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for index in rejected {
            let Some(position) = self.correlation[index].take() else {
                continue;
            };
            self.shift_after(index + 1, -1);
            match runs.last_mut() {
                Some((start, len)) if *start == position + 1 => {
                    *start = position;
                    *len += 1;
                }
                _ => runs.push((position, 1)),
            }
        }
        for (start, len) in runs {
            self.output.remove_range(start, len).await?;
        }

        admitted.sort_unstable_by_key(|(index, _)| *index);
        for (index, item) in admitted {
            let position = self.output_position(index);
            self.shift_after(index + 1, 1);
            self.correlation[index] = Some(position);
            self.output.insert_range(position, vec![item.clone()]).await?;
        }

        let updates: Vec<(usize, T)> = kept
            .into_iter()
            .filter_map(|(index, item)| self.correlation[index].map(|position| (position, item.clone())))
            .collect();
        if !updates.is_empty() {
            self.output.replace_bulk(updates).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, event: &ChangeEvent<T>) -> Result<()> {
        match event {
            ChangeEvent::Reset { .. } => self.reset().await,
            ChangeEvent::Inserted { start, items, .. } => self.on_inserted(*start, items).await,
            ChangeEvent::Removed { start, items, .. } => self.on_removed(*start, items.len()).await,
            ChangeEvent::Replaced {
                indices, new_items, ..
            } => self.on_replaced(indices, new_items).await,
        }
    }

    async fn verify(&self) -> Result<()> {
        let mut accepted = 0;
        for position in self.correlation.iter().flatten() {
            if *position != accepted {
                return Err(Error::stale(format!(
                    "filter correlation holds {position} where {accepted} was expected"
                )));
            }
            accepted += 1;
        }
        let len = self.output.len().await;
        if len != accepted {
            return Err(Error::stale(format!(
                "filter output holds {len} items but {accepted} are accepted"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Item> Drain for FilterState<T> {
    async fn step(&mut self) -> Result<bool> {
        let swapped = self.next_predicate.lock().take();
        if let Some(predicate) = swapped {
            debug!(operator = %self.label, "predicate swapped, rebuilding");
            self.predicate = predicate;
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
