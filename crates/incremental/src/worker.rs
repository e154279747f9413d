//! The per-operator drain task.
//!
//! Every operator owns exactly one worker task holding its shadow state.
//! Upstream listeners and parameter setters never touch that state: they
//! store their input and call [`Signal::wake`]. `Notify` keeps a single
//! permit, so any burst of wakes collapses into one more drain pass.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use ripple_core::{Error, OperatorConfig, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Wake-up and shutdown flag shared between a worker and its feeders.
#[derive(Default)]
pub(crate) struct Signal {
    wake: Notify,
    closed: AtomicBool,
}

impl Signal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests another drain pass.
    #[inline]
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stops the drain loop before its next record.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        self.wake.notified().await;
    }
}

/// Shadow state of an operator, driven by its worker.
#[async_trait]
pub(crate) trait Drain: Send + 'static {
    /// Applies one unit of pending work. Returns `Ok(false)` when nothing is ready.
    async fn step(&mut self) -> Result<bool>;

    /// Poisons every input so nothing but an upstream reset is applied next.
    fn poison(&mut self);
}

/// Handle to a running drain task.
pub(crate) struct Worker {
    label: String,
    signal: Arc<Signal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawns the drain loop on the current tokio runtime and schedules a first pass.
    pub(crate) fn spawn<D: Drain>(config: &OperatorConfig, signal: Arc<Signal>, drain: D) -> Self {
        let handle = tokio::spawn(run(
            config.label.clone(),
            config.yield_every.max(1),
            Arc::clone(&signal),
            drain,
        ));
        signal.wake();
        Self {
            label: config.label.clone(),
            signal,
            handle: Mutex::new(Some(handle)),
        }
    }

    #[inline]
    pub(crate) fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    /// Stops the loop and waits for the task to finish. Safe to call repeatedly.
    pub(crate) async fn shutdown(&self) {
        self.signal.close();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(operator = %self.label, "drain task panicked");
                }
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.signal.close();
    }
}

async fn run<D: Drain>(label: String, yield_every: usize, signal: Arc<Signal>, mut drain: D) {
    debug!(operator = %label, "drain loop started");
    let mut streak = 0usize;
    while !signal.is_closed() {
        let outcome = AssertUnwindSafe(drain.step()).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    operator = %label,
                    panic = %panic_message(panic.as_ref()),
                    "drain panicked, waiting for upstream reset"
                );
                drain.poison();
                continue;
            }
        };
        match result {
            Ok(true) => {
                streak += 1;
                if streak % yield_every == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok(false) => {
                streak = 0;
                signal.wait().await;
            }
            Err(Error::Cancelled) => break,
            Err(err) => {
                error!(operator = %label, error = %err, "drain failed, waiting for upstream reset");
                drain.poison();
            }
        }
    }
    debug!(operator = %label, "drain loop stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Panics on its first step, then reports an idle input.
    struct Flaky {
        steps: Arc<AtomicUsize>,
        poisoned: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Drain for Flaky {
        async fn step(&mut self) -> Result<bool> {
            if self.steps.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("callback exploded");
            }
            Ok(false)
        }

        fn poison(&mut self) {
            self.poisoned.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_panicking_step_poisons_and_keeps_running() {
        let steps = Arc::new(AtomicUsize::new(0));
        let poisoned = Arc::new(AtomicBool::new(false));
        let signal = Signal::new();
        let worker = Worker::spawn(
            &OperatorConfig::new("flaky"),
            Arc::clone(&signal),
            Flaky {
                steps: Arc::clone(&steps),
                poisoned: Arc::clone(&poisoned),
            },
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while steps.load(Ordering::SeqCst) < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(poisoned.load(Ordering::SeqCst));
        let before = steps.load(Ordering::SeqCst);
        assert!(before >= 2);

        // still alive: a wake runs another step
        signal.wake();
        while steps.load(Ordering::SeqCst) <= before && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(steps.load(Ordering::SeqCst) > before);
        worker.shutdown().await;
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
