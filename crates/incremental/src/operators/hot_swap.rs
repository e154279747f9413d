//! Re-pointable pass-through operator.
//!
//! Mirrors one source at a time. `swap_source` detaches from the current
//! source and attaches to another one, either rebuilding the output from
//! scratch or morphing it in place so that downstream consumers only see
//! the positions that differ in length plus one bulk replacement.

use std::sync::Arc;

use async_trait::async_trait;
use ripple_core::{ChangeEvent, Error, Item, OperatorConfig, Result};
use ripple_reactive::{ChangeStream, Listener, SharedStream, Subscription, VersionedCollection};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::replay::{attach, new_port, rebase_from, Port};
use crate::worker::{Drain, Signal, Worker};

struct SwapRequest<T: Item> {
    source: SharedStream<T>,
    soft: bool,
    done: oneshot::Sender<Result<()>>,
}

/// Pass-through view whose source can be replaced at runtime.
pub struct HotSwap<T: Item> {
    output: Arc<VersionedCollection<T>>,
    requests: mpsc::UnboundedSender<SwapRequest<T>>,
    worker: Worker,
}

impl<T: Item> HotSwap<T> {
    pub async fn new(source: SharedStream<T>) -> Arc<Self> {
        Self::with_config(&OperatorConfig::new("hot_swap"), source).await
    }

    pub async fn with_config(config: &OperatorConfig, source: SharedStream<T>) -> Arc<Self> {
        let output = Arc::new(VersionedCollection::new());
        let (requests, inbox) = mpsc::unbounded_channel();
        let signal = Signal::new();
        let port = new_port();
        let subscription = attach(&*source, &port, &signal);
        rebase_from(&port, &*source).await;
        debug!(operator = %config.label, "hot swap attached");

        let state = HotSwapState {
            label: config.label.clone(),
            signal: Arc::clone(&signal),
            source,
            port,
            subscription,
            inbox,
            len: 0,
            output: Arc::clone(&output),
        };
        let worker = Worker::spawn(config, signal, state);
        Arc::new(Self {
            output,
            requests,
            worker,
        })
    }

    /// Re-points the operator at `source` and waits until the switch is applied.
    ///
    /// With `soft == false` the output is cleared and refilled from a snapshot
    /// of the new source before this returns. With `soft == true` the output
    /// is grown or shrunk at its end and the overlapping positions are
    /// replaced in one record.
    /// Fails with [`Error::Cancelled`] once the operator is disposed.
    pub async fn swap_source(&self, source: SharedStream<T>, soft: bool) -> Result<()> {
        let (done, reply) = oneshot::channel();
        self.requests
            .send(SwapRequest { source, soft, done })
            .map_err(|_| Error::Cancelled)?;
        self.worker.signal().wake();
        reply.await.map_err(|_| Error::Cancelled)?
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
impl<T: Item> ChangeStream<T> for HotSwap<T> {
    fn subscribe(&self, listener: Listener<T>) -> Subscription {
        self.output.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<T> {
        self.output.snapshot().await
    }
}

struct HotSwapState<T: Item> {
    label: String,
    signal: Arc<Signal>,
    source: SharedStream<T>,
    port: Port<T>,
    subscription: Subscription,
    inbox: mpsc::UnboundedReceiver<SwapRequest<T>>,
    len: usize,
    output: Arc<VersionedCollection<T>>,
}

impl<T: Item> HotSwapState<T> {
    async fn swap(&mut self, source: SharedStream<T>, soft: bool) -> Result<()> {
        debug!(operator = %self.label, soft, "swapping source");
        let port = new_port();
        // the old subscription is dropped, and with it the old source
        self.subscription = attach(&*source, &port, &self.signal);
        self.port = port;
        self.source = source;
        if soft {
            self.morph().await
        } else {
            self.rebuild().await?;
            // the snapshot of the new source is the next ready record
            self.apply_next().await?;
            Ok(())
        }
    }

    /// Applies the next ready record. Returns `false` when none has arrived.
    async fn apply_next(&mut self) -> Result<bool> {
        let ready = self.port.lock().pop_ready();
        let Some(event) = ready else {
            return Ok(false);
        };
        trace!(operator = %self.label, version = event.version(), kind = ?event.kind(), "applying change");
        self.apply(&event).await?;
        Ok(true)
    }

    async fn rebuild(&mut self) -> Result<()> {
        self.len = 0;
        if !self.output.is_empty().await {
            self.output.clear().await;
        }
        rebase_from(&self.port, &*self.source).await;
        Ok(())
    }

    async fn morph(&mut self) -> Result<()> {
        let snapshot = self.source.snapshot().await;
        let version = snapshot.version();
        let items = snapshot.into_items();
        let target = items.len();
        if self.len < target {
            self.output
                .insert_range(self.len, items[self.len..].to_vec())
                .await?;
        } else if self.len > target {
            self.output.remove_range(target, self.len - target).await?;
        }
        let overlap = self.len.min(target);
        if overlap > 0 {
            let updates = items[..overlap].iter().cloned().enumerate().collect();
            self.output.replace_bulk(updates).await?;
        }
        self.len = target;
        self.port.lock().skip_to(version);
        Ok(())
    }

    async fn apply(&mut self, event: &ChangeEvent<T>) -> Result<()> {
        match event {
            ChangeEvent::Reset { .. } => self.rebuild().await?,
            ChangeEvent::Inserted { start, items, .. } => {
                if *start > self.len {
                    return Err(Error::stale(format!("hot swap insert at {start} past length {}", self.len)));
                }
                if !items.is_empty() {
                    self.output.insert_range(*start, items.clone()).await?;
                    self.len += items.len();
                }
            }
            ChangeEvent::Removed { start, items, .. } => {
                if start + items.len() > self.len {
                    return Err(Error::stale(format!("hot swap remove past length {}", self.len)));
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
                    return Err(Error::stale(format!("hot swap replace at {index} past length {}", self.len)));
                }
                if !indices.is_empty() {
                    let updates = indices.iter().copied().zip(new_items.iter().cloned()).collect();
                    self.output.replace_bulk(updates).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Item> Drain for HotSwapState<T> {
    async fn step(&mut self) -> Result<bool> {
        if let Ok(request) = self.inbox.try_recv() {
            let outcome = self.swap(request.source, request.soft).await;
            // the caller may have stopped waiting
            let _ = request.done.send(outcome.clone());
            outcome?;
            return Ok(true);
        }
        self.apply_next().await
    }

    fn poison(&mut self) {
        self.port.lock().poison();
    }
}
