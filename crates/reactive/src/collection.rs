//! The mutable, versioned base collection.
//!
//! `VersionedCollection` is the single source of truth of a pipeline and also
//! the output store of every derived operator. Each mutating call validates
//! its arguments, applies the edit under the write lock, bumps the version
//! exactly once and publishes one change record after the lock is released.
//! `remove_where` is the exception: it bumps once per removed element and
//! publishes all of its records after the lock is released.

use std::cmp::Ordering;

use async_trait::async_trait;
use hashbrown::HashSet;
use ripple_core::{ChangeEvent, Error, Item, Result, Version};
use tokio::sync::RwLock;
use tracing::trace;

use crate::stream::ChangeStream;
use crate::subscription::{Listener, Publisher, Subscription};

struct State<T> {
    items: Vec<T>,
    version: Version,
}

impl<T> State<T> {
    #[inline]
    fn bump(&mut self) -> Version {
        self.version += 1;
        self.version
    }
}

/// An ordered sequence with a monotonic version counter.
pub struct VersionedCollection<T> {
    state: RwLock<State<T>>,
    publisher: Publisher<T>,
}

impl<T: Item> Default for VersionedCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> VersionedCollection<T> {
    /// Creates an empty collection at version 0.
    pub fn new() -> Self {
        Self::from_items(Vec::new())
    }

    /// Creates a collection holding `items` at version 0.
    pub fn from_items(items: Vec<T>) -> Self {
        Self {
            state: RwLock::new(State { items, version: 0 }),
            publisher: Publisher::new(),
        }
    }

    fn emit(&self, event: ChangeEvent<T>) -> Version {
        let version = event.version();
        trace!(version, kind = ?event.kind(), len = event.len(), "publishing change");
        self.publisher.publish(event);
        version
    }

    // ---- Mutators ----

    /// Removes every element and emits `Reset`.
    pub async fn clear(&self) -> Version {
        let event = {
            let mut state = self.state.write().await;
            state.items.clear();
            ChangeEvent::Reset {
                version: state.bump(),
            }
        };
        self.emit(event)
    }

    /// Emits `Reset` without changing the content, forcing consumers to rebuild.
    pub async fn reset(&self) -> Version {
        let event = {
            let mut state = self.state.write().await;
            ChangeEvent::Reset {
                version: state.bump(),
            }
        };
        self.emit(event)
    }

    /// Inserts `items` so that the first one lands at `at`. `at == len` appends.
    pub async fn insert_range(&self, at: usize, items: Vec<T>) -> Result<Version> {
        let event = {
            let mut state = self.state.write().await;
            let len = state.items.len();
            if at > len {
                return Err(Error::out_of_range(at, len));
            }
            state.items.splice(at..at, items.iter().cloned());
            ChangeEvent::Inserted {
                version: state.bump(),
                start: at,
                items,
            }
        };
        Ok(self.emit(event))
    }

    /// Appends `items` at the end.
    pub async fn push_range(&self, items: Vec<T>) -> Version {
        let event = {
            let mut state = self.state.write().await;
            let start = state.items.len();
            state.items.extend(items.iter().cloned());
            ChangeEvent::Inserted {
                version: state.bump(),
                start,
                items,
            }
        };
        self.emit(event)
    }

    /// Removes `count` elements starting at `at`.
    pub async fn remove_range(&self, at: usize, count: usize) -> Result<Version> {
        if count == 0 {
            return Err(Error::invariant("remove_range requires a non-empty range"));
        }
        let event = {
            let mut state = self.state.write().await;
            let len = state.items.len();
            match at.checked_add(count) {
                Some(end) if end <= len => {}
                Some(end) => return Err(Error::out_of_range(end - 1, len)),
                None => return Err(Error::out_of_range(usize::MAX, len)),
            }
            let items: Vec<T> = state.items.drain(at..at + count).collect();
            ChangeEvent::Removed {
                version: state.bump(),
                start: at,
                items,
            }
        };
        Ok(self.emit(event))
    }

    /// Removes every element matching `predicate` and returns how many went.
    ///
    /// Matches are removed back to front under one write lock, one `Removed`
    /// record per element, so each record's `start` is valid against the
    /// collection as left by the previous record.
    pub async fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&T) -> bool + Send,
    {
        let events = {
            let mut state = self.state.write().await;
            let mut events = Vec::new();
            for index in (0..state.items.len()).rev() {
                if !predicate(&state.items[index]) {
                    continue;
                }
                let item = state.items.remove(index);
                events.push(ChangeEvent::Removed {
                    version: state.bump(),
                    start: index,
                    items: vec![item],
                });
            }
            events
        };
        let removed = events.len();
        for event in events {
            self.emit(event);
        }
        removed
    }

    /// Replaces the element at `index`.
    pub async fn replace_at(&self, index: usize, item: T) -> Result<Version> {
        self.replace_bulk(vec![(index, item)]).await
    }

    /// Replaces several elements at once. Indices must be unique.
    pub async fn replace_bulk(&self, updates: Vec<(usize, T)>) -> Result<Version> {
        ensure_unique(updates.iter().map(|(index, _)| *index))?;
        let event = {
            let mut state = self.state.write().await;
            let len = state.items.len();
            if let Some((index, _)) = updates.iter().find(|(index, _)| *index >= len) {
                return Err(Error::out_of_range(*index, len));
            }
            let mut indices = Vec::with_capacity(updates.len());
            let mut old_items = Vec::with_capacity(updates.len());
            let mut new_items = Vec::with_capacity(updates.len());
            for (index, item) in updates {
                old_items.push(std::mem::replace(&mut state.items[index], item.clone()));
                indices.push(index);
                new_items.push(item);
            }
            ChangeEvent::Replaced {
                version: state.bump(),
                indices,
                old_items,
                new_items,
            }
        };
        Ok(self.emit(event))
    }

    /// Edits the element at `index` in place and emits a one-index `Replaced`.
    pub async fn change_at<F>(&self, index: usize, edit: F) -> Result<Version>
    where
        F: FnOnce(&mut T) + Send,
    {
        let event = {
            let mut state = self.state.write().await;
            let len = state.items.len();
            let slot = state
                .items
                .get_mut(index)
                .ok_or_else(|| Error::out_of_range(index, len))?;
            let old = slot.clone();
            edit(slot);
            let new = slot.clone();
            ChangeEvent::Replaced {
                version: state.bump(),
                indices: vec![index],
                old_items: vec![old],
                new_items: vec![new],
            }
        };
        Ok(self.emit(event))
    }

    /// Re-emits the current values at `indices` as a `Replaced` record.
    ///
    /// Consumers re-evaluate those elements as if they had changed. An empty
    /// index list emits nothing and returns the current version.
    pub async fn touch(&self, indices: &[usize]) -> Result<Version> {
        ensure_unique(indices.iter().copied())?;
        let event = {
            let mut state = self.state.write().await;
            if indices.is_empty() {
                return Ok(state.version);
            }
            let len = state.items.len();
            if let Some(&index) = indices.iter().find(|&&index| index >= len) {
                return Err(Error::out_of_range(index, len));
            }
            let items: Vec<T> = indices.iter().map(|&i| state.items[i].clone()).collect();
            ChangeEvent::Replaced {
                version: state.bump(),
                indices: indices.to_vec(),
                old_items: items.clone(),
                new_items: items,
            }
        };
        Ok(self.emit(event))
    }

    /// Inserts `item` after every element that compares less than or equal to it.
    ///
    /// Returns the index the item was inserted at.
    pub async fn insert_sorted<F>(&self, item: T, compare: F) -> usize
    where
        F: Fn(&T, &T) -> Ordering + Send,
    {
        let (index, event) = {
            let mut state = self.state.write().await;
            let index = state
                .items
                .partition_point(|existing| compare(existing, &item) != Ordering::Greater);
            state.items.insert(index, item.clone());
            let event = ChangeEvent::Inserted {
                version: state.bump(),
                start: index,
                items: vec![item],
            };
            (index, event)
        };
        self.emit(event);
        index
    }

    // ---- Reads ----

    /// Returns the number of elements.
    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    /// Returns true if the collection holds no element.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.items.is_empty()
    }

    /// Returns the version of the last mutation (0 before any).
    pub async fn version(&self) -> Version {
        self.state.read().await.version
    }

    /// Returns a copy of the element at `index`.
    pub async fn item_at(&self, index: usize) -> Result<T> {
        let state = self.state.read().await;
        state
            .items
            .get(index)
            .cloned()
            .ok_or_else(|| Error::out_of_range(index, state.items.len()))
    }

    /// Returns the positions of every element matching `predicate`.
    pub async fn indexes_of<F>(&self, predicate: F) -> Vec<usize>
    where
        F: Fn(&T) -> bool + Send,
    {
        let state = self.state.read().await;
        state
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| predicate(item))
            .map(|(index, _)| index)
            .collect()
    }

    /// Returns a copy of the first element matching `predicate`.
    pub async fn first_where<F>(&self, predicate: F) -> Option<T>
    where
        F: Fn(&T) -> bool + Send,
    {
        let state = self.state.read().await;
        state.items.iter().find(|item| predicate(item)).cloned()
    }

    /// Returns a copy of the last element matching `predicate`.
    pub async fn last_where<F>(&self, predicate: F) -> Option<T>
    where
        F: Fn(&T) -> bool + Send,
    {
        let state = self.state.read().await;
        state.items.iter().rev().find(|item| predicate(item)).cloned()
    }

    /// Returns copies of every element matching `predicate`, in order.
    pub async fn collect_where<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool + Send,
    {
        let state = self.state.read().await;
        state.items.iter().filter(|item| predicate(item)).cloned().collect()
    }

    /// Returns a copy of the whole content.
    pub async fn to_vec(&self) -> Vec<T> {
        self.state.read().await.items.clone()
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }
}

#[async_trait]
impl<T: Item> ChangeStream<T> for VersionedCollection<T> {
    fn subscribe(&self, listener: Listener<T>) -> Subscription {
        self.publisher.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<T> {
        let state = self.state.read().await;
        ChangeEvent::Inserted {
            version: state.version,
            start: 0,
            items: state.items.clone(),
        }
    }
}

fn ensure_unique(indices: impl Iterator<Item = usize>) -> Result<()> {
    let mut seen = HashSet::new();
    for index in indices {
        if !seen.insert(index) {
            return Err(Error::invariant(format!("duplicate index {index}")));
        }
    }
    Ok(())
}
