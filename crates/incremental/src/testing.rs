//! Helpers shared by the operator unit tests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ripple_core::{ChangeEvent, Item};
use ripple_reactive::{ChangeStream, Subscription};
use tokio::time::Instant;

/// Polls `stream` until its content equals `expected` or a deadline passes,
/// then returns the last observed content.
pub(crate) async fn settle<T, S>(stream: &S, expected: &[T]) -> Vec<T>
where
    T: Item + PartialEq,
    S: ChangeStream<T> + ?Sized,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let items = stream.snapshot().await.into_items();
        if items == expected || Instant::now() >= deadline {
            return items;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Records every change published by `stream`.
pub(crate) fn record<T, S>(stream: &S) -> (Subscription, Arc<Mutex<Vec<ChangeEvent<T>>>>)
where
    T: Item,
    S: ChangeStream<T> + ?Sized,
{
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let subscription = stream.subscribe(Arc::new(move |event: &Arc<ChangeEvent<T>>| {
        sink.lock().push(ChangeEvent::clone(event));
    }));
    (subscription, log)
}
