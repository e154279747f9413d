//! Bounded window over the head or the tail of a source.
//!
//! The operator keeps a full copy of the source and the bounds `[start, end)`
//! of the slice its output mirrors, so `output == copy[start..end]` holds
//! after every step. Each record is first applied in window coordinates, then
//! [`TakeState::settle`] moves the bounds to the target slice by editing the
//! output at its edges.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ripple_core::{ChangeEvent, Error, Item, OperatorConfig, Result};
use ripple_reactive::{ChangeStream, Listener, SharedStream, Subscription, VersionedCollection};
use tracing::{debug, trace};

use crate::replay::{attach, new_port, rebase_from, Port};
use crate::worker::{Drain, Signal, Worker};

/// Which end of the source the window is anchored to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TakeFrom {
    /// The first `n` elements.
    Start,
    /// The last `n` elements.
    End,
}

/// Materialized first-N or last-N window of a source.
///
/// # Example
///
/// ```ignore
/// let feed = Arc::new(VersionedCollection::from_items((1..=10).collect::<Vec<_>>()));
/// let latest = Take::last(shared(&feed), 3).await;
/// // latest -> [8, 9, 10]
/// latest.set_count(5);
/// // latest -> [6, 7, 8, 9, 10]
/// ```
pub struct Take<T: Item> {
    output: Arc<VersionedCollection<T>>,
    next_count: Arc<Mutex<Option<usize>>>,
    worker: Worker,
}

impl<T: Item> Take<T> {
    /// Keeps the first `count` elements of `source`.
    pub async fn first(source: SharedStream<T>, count: usize) -> Arc<Self> {
        Self::new(source, TakeFrom::Start, count).await
    }

    /// Keeps the last `count` elements of `source`.
    pub async fn last(source: SharedStream<T>, count: usize) -> Arc<Self> {
        Self::new(source, TakeFrom::End, count).await
    }

    pub async fn new(source: SharedStream<T>, from: TakeFrom, count: usize) -> Arc<Self> {
        let label = match from {
            TakeFrom::Start => "take_first",
            TakeFrom::End => "take_last",
        };
        Self::with_config(&OperatorConfig::new(label), source, from, count).await
    }

    pub async fn with_config(
        config: &OperatorConfig,
        source: SharedStream<T>,
        from: TakeFrom,
        count: usize,
    ) -> Arc<Self> {
        let output = Arc::new(VersionedCollection::new());
        let next_count = Arc::new(Mutex::new(None));
        let signal = Signal::new();
        let port = new_port();
        let subscription = attach(&*source, &port, &signal);
        rebase_from(&port, &*source).await;
        debug!(operator = %config.label, count, "take attached");

        let state = TakeState {
            label: config.label.clone(),
            check: config.check_invariants,
            source,
            port,
            _subscription: subscription,
            from,
            count,
            next_count: Arc::clone(&next_count),
            items: Vec::new(),
            start: 0,
            end: 0,
            output: Arc::clone(&output),
        };
        let worker = Worker::spawn(config, signal, state);
        Arc::new(Self {
            output,
            next_count,
            worker,
        })
    }

    /// Changes the window width without touching the source.
    pub fn set_count(&self, count: usize) {
        *self.next_count.lock() = Some(count);
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
impl<T: Item> ChangeStream<T> for Take<T> {
    fn subscribe(&self, listener: Listener<T>) -> Subscription {
        self.output.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<T> {
        self.output.snapshot().await
    }
}

struct TakeState<T: Item> {
    label: String,
    check: bool,
    source: SharedStream<T>,
    port: Port<T>,
    _subscription: Subscription,
    from: TakeFrom,
    count: usize,
    next_count: Arc<Mutex<Option<usize>>>,
    /// Copy of the source content
    items: Vec<T>,
    start: usize,
    end: usize,
    output: Arc<VersionedCollection<T>>,
}

impl<T: Item> TakeState<T> {
    fn target(&self) -> (usize, usize) {
        let len = self.items.len();
        let width = self.count.min(len);
        match self.from {
            TakeFrom::Start => (0, width),
            TakeFrom::End => (len - width, len),
        }
    }

    async fn reset(&mut self) -> Result<()> {
        self.items.clear();
        self.start = 0;
        self.end = 0;
        if !self.output.is_empty().await {
            self.output.clear().await;
        }
        rebase_from(&self.port, &*self.source).await;
        Ok(())
    }

    async fn on_inserted(&mut self, at: usize, items: &[T]) -> Result<()> {
        if at > self.items.len() {
            return Err(Error::stale(format!(
                "take insert at {at} past length {}",
                self.items.len()
            )));
        }
        let count = items.len();
        if count == 0 {
            return Ok(());
        }
        self.items.splice(at..at, items.iter().cloned());
        let tail = self.from == TakeFrom::End;
        if at < self.start || (tail && at == self.start) {
            self.start += count;
            self.end += count;
        } else if at < self.end
            || (!tail && at == self.start && (self.start < self.end || self.count > 0))
            || (tail && at == self.end)
        {
            self.output.insert_range(at - self.start, items.to_vec()).await?;
            self.end += count;
        }
        Ok(())
    }

    async fn on_removed(&mut self, at: usize, count: usize) -> Result<()> {
        let end = at + count;
        if end > self.items.len() {
            return Err(Error::stale(format!(
                "take remove of {at}..{end} past length {}",
                self.items.len()
            )));
        }
        self.items.drain(at..end);
        let overlap_start = at.max(self.start);
        let overlap_end = end.min(self.end);
        if overlap_start < overlap_end {
            self.output
                .remove_range(overlap_start - self.start, overlap_end - overlap_start)
                .await?;
        }
        let before_start = end.min(self.start).saturating_sub(at);
        let before_end = end.min(self.end).saturating_sub(at);
        self.start -= before_start;
        self.end -= before_end;
        Ok(())
    }

    async fn on_replaced(&mut self, indices: &[usize], new_items: &[T]) -> Result<()> {
        let mut updates = Vec::new();
        for (&index, item) in indices.iter().zip(new_items) {
            let slot = self
                .items
                .get_mut(index)
                .ok_or_else(|| Error::stale(format!("take replace at {index} past end")))?;
            *slot = item.clone();
            if (self.start..self.end).contains(&index) {
                updates.push((index - self.start, item.clone()));
            }
        }
        if !updates.is_empty() {
            self.output.replace_bulk(updates).await?;
        }
        Ok(())
    }

    /// Moves `[start, end)` to the target slice, editing the output at its edges.
    async fn settle(&mut self) -> Result<()> {
        let (target_start, target_end) = self.target();
        if (target_start, target_end) == (self.start, self.end) {
            return Ok(());
        }
        if target_end <= self.start || target_start >= self.end {
            // disjoint: replace the whole window
            if self.end > self.start {
                self.output.remove_range(0, self.end - self.start).await?;
            }
            if target_end > target_start {
                self.output
                    .insert_range(0, self.items[target_start..target_end].to_vec())
                    .await?;
            }
            self.start = target_start;
            self.end = target_end;
            return Ok(());
        }
        if target_end < self.end {
            self.output
                .remove_range(target_end - self.start, self.end - target_end)
                .await?;
        } else if target_end > self.end {
            self.output
                .insert_range(self.end - self.start, self.items[self.end..target_end].to_vec())
                .await?;
        }
        self.end = target_end;
        if target_start > self.start {
            self.output.remove_range(0, target_start - self.start).await?;
        } else if target_start < self.start {
            self.output
                .insert_range(0, self.items[target_start..self.start].to_vec())
                .await?;
        }
        self.start = target_start;
        Ok(())
    }

    async fn apply(&mut self, event: &ChangeEvent<T>) -> Result<()> {
        match event {
            ChangeEvent::Reset { .. } => return self.reset().await,
            ChangeEvent::Inserted { start, items, .. } => self.on_inserted(*start, items).await?,
            ChangeEvent::Removed { start, items, .. } => self.on_removed(*start, items.len()).await?,
            ChangeEvent::Replaced {
                indices, new_items, ..
            } => self.on_replaced(indices, new_items).await?,
        }
        self.settle().await
    }

    async fn verify(&self) -> Result<()> {
        let len = self.output.len().await;
        if self.end < self.start || self.end - self.start != len || self.end > self.items.len() {
            return Err(Error::stale(format!(
                "take window {}..{} does not match output length {len}",
                self.start, self.end
            )));
        }
        if (self.start, self.end) != self.target() {
            return Err(Error::stale(format!(
                "take window {}..{} is not settled",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Item> Drain for TakeState<T> {
    async fn step(&mut self) -> Result<bool> {
        let resized = self.next_count.lock().take();
        if let Some(count) = resized {
            debug!(operator = %self.label, count, "window width changed");
            self.count = count;
            self.settle().await?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, settle};
    use ripple_reactive::shared;

    #[tokio::test]
    async fn test_take_last_window_scenario() {
        let source = Arc::new(VersionedCollection::from_items((1..=10).collect::<Vec<i32>>()));
        let take = Take::last(shared(&source), 3).await;
        assert_eq!(settle(&*take, &[8, 9, 10]).await, vec![8, 9, 10]);
        let (_sub, log) = record(&*take);

        source.insert_range(0, vec![20, 21]).await.unwrap();
        source.remove_range(0, 1).await.unwrap();
        source.push_range(vec![30]).await;
        assert_eq!(settle(&*take, &[9, 10, 30]).await, vec![9, 10, 30]);

        // only the append reaches the output: one insert, one trim
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_take_first_window() {
        let source = Arc::new(VersionedCollection::from_items(vec![1, 2, 3, 4, 5]));
        let take = Take::first(shared(&source), 3).await;
        assert_eq!(settle(&*take, &[1, 2, 3]).await, vec![1, 2, 3]);

        source.insert_range(0, vec![0]).await.unwrap();
        assert_eq!(settle(&*take, &[0, 1, 2]).await, vec![0, 1, 2]);

        source.remove_range(1, 2).await.unwrap();
        assert_eq!(settle(&*take, &[0, 3, 4]).await, vec![0, 3, 4]);

        source.replace_at(3, 50).await.unwrap();
        source.replace_at(2, 40).await.unwrap();
        assert_eq!(settle(&*take, &[0, 3, 40]).await, vec![0, 3, 40]);
    }

    #[tokio::test]
    async fn test_take_shorter_source_and_growth() {
        let source = Arc::new(VersionedCollection::from_items(vec![1]));
        let take = Take::last(shared(&source), 3).await;
        assert_eq!(settle(&*take, &[1]).await, vec![1]);

        source.push_range(vec![2, 3, 4, 5]).await;
        assert_eq!(settle(&*take, &[3, 4, 5]).await, vec![3, 4, 5]);

        source.remove_range(0, 5).await.unwrap();
        assert_eq!(settle(&*take, &[]).await, Vec::<i32>::new());
    }

    #[tokio::test]
    async fn test_take_width_change() {
        let source = Arc::new(VersionedCollection::from_items((1..=10).collect::<Vec<i32>>()));
        let first = Take::first(shared(&source), 2).await;
        let last = Take::last(shared(&source), 2).await;
        settle(&*first, &[1, 2]).await;
        settle(&*last, &[9, 10]).await;

        first.set_count(4);
        last.set_count(4);
        assert_eq!(settle(&*first, &[1, 2, 3, 4]).await, vec![1, 2, 3, 4]);
        assert_eq!(settle(&*last, &[7, 8, 9, 10]).await, vec![7, 8, 9, 10]);

        first.set_count(0);
        last.set_count(1);
        assert_eq!(settle(&*first, &[]).await, Vec::<i32>::new());
        assert_eq!(settle(&*last, &[10]).await, vec![10]);
    }

    #[tokio::test]
    async fn test_take_first_zero_ignores_inserts() {
        let source = Arc::new(VersionedCollection::new());
        let take = Take::first(shared(&source), 0).await;
        let (_sub, log) = record(&*take);

        source.insert_range(0, vec![5, 6]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(log.lock().is_empty());
        assert!(take.snapshot().await.is_empty());

        take.set_count(1);
        assert_eq!(settle(&*take, &[5]).await, vec![5]);
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_take_replace_outside_window_is_silent() {
        let source = Arc::new(VersionedCollection::from_items(vec![1, 2, 3, 4]));
        let take = Take::first(shared(&source), 2).await;
        settle(&*take, &[1, 2]).await;
        let (_sub, log) = record(&*take);

        source.replace_at(3, 40).await.unwrap();
        source.replace_at(0, 10).await.unwrap();
        assert_eq!(settle(&*take, &[10, 2]).await, vec![10, 2]);
        assert_eq!(log.lock().len(), 1);
    }
}
