//! Out-of-order safe delivery of change records.
//!
//! Listeners may observe the records of one stream in any order. Each
//! operator input owns a `ReplayBuffer` that holds early records until every
//! version before them has arrived, then releases them strictly in sequence.
//! Bootstrap snapshots are stored in the same buffer under their own version,
//! so they are applied through the regular insert path.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use ripple_core::{ChangeEvent, Item, Version};
use ripple_reactive::{ChangeStream, Subscription};
use tracing::{debug, warn};

use crate::worker::Signal;

/// Version-ordered staging area for one input of an operator.
pub struct ReplayBuffer<T> {
    /// Records waiting for their turn, by version
    pending: BTreeMap<Version, Arc<ChangeEvent<T>>>,
    /// Operator-generated records applied before the next versioned one
    injected: VecDeque<Arc<ChangeEvent<T>>>,
    /// Version of the next record to release
    next: Version,
    /// Set after a failed apply; only a reset may pass
    poisoned: bool,
}

impl<T> Default for ReplayBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReplayBuffer<T> {
    /// Creates an empty buffer expecting version 0.
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            injected: VecDeque::new(),
            next: 0,
            poisoned: false,
        }
    }

    /// Stores a record unless it is already buffered or older than the next expected version.
    ///
    /// Returns true if the record was stored.
    pub fn offer(&mut self, event: Arc<ChangeEvent<T>>) -> bool {
        let version = event.version();
        if version < self.next || self.pending.contains_key(&version) {
            return false;
        }
        self.pending.insert(version, event);
        true
    }

    /// Restarts the sequence at a snapshot.
    ///
    /// The snapshot is buffered under its own version, overriding whatever
    /// was stored there, and becomes the next record released. Injected work
    /// is dropped and a poisoned buffer is healed.
    pub fn rebase(&mut self, snapshot: ChangeEvent<T>) {
        let version = snapshot.version();
        self.injected.clear();
        self.poisoned = false;
        self.next = version;
        self.purge();
        self.pending.insert(version, Arc::new(snapshot));
    }

    /// Marks every version up to and including `version` as applied.
    pub fn skip_to(&mut self, version: Version) {
        self.injected.clear();
        self.poisoned = false;
        self.next = version + 1;
        self.purge();
    }

    /// Queues operator-generated records ahead of the next versioned record.
    pub fn inject(&mut self, events: impl IntoIterator<Item = ChangeEvent<T>>) {
        self.injected.extend(events.into_iter().map(Arc::new));
    }

    /// Releases the next record to apply, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<Arc<ChangeEvent<T>>> {
        if let Some(event) = self.injected.pop_front() {
            return Some(event);
        }
        self.purge();
        if self.poisoned {
            return self.pop_recovery();
        }
        let event = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(event)
    }

    fn pop_recovery(&mut self) -> Option<Arc<ChangeEvent<T>>> {
        let version = self
            .pending
            .iter()
            .find(|(_, event)| event.is_reset())
            .map(|(version, _)| *version)?;
        let kept = self.pending.split_off(&version);
        if !self.pending.is_empty() {
            warn!(
                dropped = self.pending.len(),
                reset = version,
                "discarding records held by a poisoned buffer"
            );
        }
        self.pending = kept;
        self.poisoned = false;
        self.next = version + 1;
        debug!(version, "poisoned buffer recovered at reset");
        self.pending.remove(&version)
    }

    /// Stops releasing versioned records until a reset arrives.
    pub fn poison(&mut self) {
        self.poisoned = true;
        self.injected.clear();
    }

    /// Returns true while the buffer waits for a reset.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Returns the version of the next record to release.
    #[inline]
    pub fn next_version(&self) -> Version {
        self.next
    }

    /// Returns the number of buffered versioned records.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn purge(&mut self) {
        if self
            .pending
            .first_key_value()
            .is_some_and(|(version, _)| *version < self.next)
        {
            self.pending = self.pending.split_off(&self.next);
        }
    }
}

/// A replay buffer shared between an upstream listener and the operator's worker.
pub(crate) type Port<T> = Arc<Mutex<ReplayBuffer<T>>>;

pub(crate) fn new_port<T>() -> Port<T> {
    Arc::new(Mutex::new(ReplayBuffer::new()))
}

/// Subscribes `port` to `source`: every record is offered and wakes the worker.
pub(crate) fn attach<T: Item>(
    source: &dyn ChangeStream<T>,
    port: &Port<T>,
    signal: &Arc<Signal>,
) -> Subscription {
    let port = Arc::clone(port);
    let signal = Arc::clone(signal);
    source.subscribe(Arc::new(move |event: &Arc<ChangeEvent<T>>| {
        let stored = port.lock().offer(Arc::clone(event));
        if stored {
            signal.wake();
        }
    }))
}

/// Takes a snapshot of `source` and restarts `port` at it.
pub(crate) async fn rebase_from<T: Item>(port: &Port<T>, source: &dyn ChangeStream<T>) {
    let snapshot = source.snapshot().await;
    port.lock().rebase(snapshot);
}
