//! The contract shared by every source and derived collection.

use std::sync::Arc;

use async_trait::async_trait;
use ripple_core::{ChangeEvent, Item};

use crate::subscription::{Listener, Subscription};

/// A push channel of versioned changes plus an on-demand snapshot.
///
/// A consumer attaches in two steps: subscribe first, then take a snapshot.
/// Changes already covered by the snapshot arrive with a version no greater
/// than the snapshot's and are discarded during replay.
#[async_trait]
pub trait ChangeStream<T: Item>: Send + Sync {
    /// Registers a listener for every subsequent change.
    fn subscribe(&self, listener: Listener<T>) -> Subscription;

    /// Returns `Inserted { version, start: 0, items }` holding the full current content.
    async fn snapshot(&self) -> ChangeEvent<T>;
}

/// Type-erased handle to any change stream.
pub type SharedStream<T> = Arc<dyn ChangeStream<T>>;

/// Erases the concrete type of a stream.
pub fn shared<T, S>(stream: &Arc<S>) -> SharedStream<T>
where
    T: Item,
    S: ChangeStream<T> + 'static,
{
    Arc::clone(stream) as SharedStream<T>
}
