//! Bounded dispatch of user hooks.
//!
//! [`HookDispatcher`] runs hook bodies away from the session read loops.
//! Each category (packet, connected, disconnected) owns one dispatcher, so a
//! slow or faulty hook in one category cannot starve the others. A hook that
//! panics is logged at the join boundary and otherwise ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Semaphore-bounded executor for synchronous hook closures.
///
/// [`dispatch`](HookDispatcher::dispatch) never waits: the job is queued on
/// a task that takes a permit and then runs it on the blocking pool. At most
/// `concurrency` jobs of this category run at once; the rest wait in
/// arrival order.
#[derive(Debug, Clone)]
pub struct HookDispatcher {
    name: &'static str,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    concurrency: usize,
}

impl HookDispatcher {
    /// Creates a dispatcher allowing `concurrency` simultaneous jobs.
    ///
    /// A concurrency of zero is raised to one.
    #[must_use]
    pub fn new(name: &'static str, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            name,
            permits: Arc::new(Semaphore::new(concurrency)),
            queued: Arc::new(AtomicUsize::new(0)),
            concurrency,
        }
    }

    /// Queues `job` and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let backlog = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        if backlog > self.concurrency {
            debug!(hook = self.name, backlog, "hook jobs waiting for a free slot");
        }
        let name = self.name;
        let permits = Arc::clone(&self.permits);
        let queued = Arc::clone(&self.queued);
        drop(tokio::spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => {
                    if let Err(e) = tokio::task::spawn_blocking(job).await {
                        warn!(hook = name, error = %e, "hook panicked");
                    }
                }
                Err(_) => debug!(hook = name, "hook dispatcher closed, dropping job"),
            }
            let _ = queued.fetch_sub(1, Ordering::Relaxed);
        }));
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn runs_dispatched_job() {
        let dispatcher = HookDispatcher::new("packet", 4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.dispatch(move || {
            let _ = tx.send(7u8);
        });
        let Some(value) = rx.recv().await else {
            panic!("job never ran");
        };
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn panicking_job_does_not_poison_dispatcher() {
        let dispatcher = HookDispatcher::new("packet", 1);
        dispatcher.dispatch(|| panic!("hook failure"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.dispatch(move || {
            let _ = tx.send(());
        });
        let Ok(Some(())) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await else {
            panic!("dispatcher stopped after a panicking hook");
        };
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let dispatcher = HookDispatcher::new("disconnected", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            dispatcher.dispatch(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                let _ = running.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }
        for _ in 0..6 {
            let Some(()) = rx.recv().await else {
                panic!("job lost");
            };
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn zero_concurrency_is_raised_to_one() {
        let dispatcher = HookDispatcher::new("connected", 0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.dispatch(move || {
            let _ = tx.send(());
        });
        let Ok(Some(())) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await else {
            panic!("job never ran with zero concurrency");
        };
    }

    #[tokio::test]
    async fn dispatch_does_not_wait_for_a_blocked_hook() {
        let dispatcher = HookDispatcher::new("packet", 1);
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        dispatcher.dispatch(move || {
            let _ = gate_rx.recv();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..3u8 {
            let tx = tx.clone();
            dispatcher.dispatch(move || {
                let _ = tx.send(i);
            });
        }
        // Queued jobs stay queued until the slot frees up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        let _ = gate_tx.send(());
        for expected in 0..3u8 {
            let Ok(Some(value)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
            else {
                panic!("queued job lost");
            };
            assert_eq!(value, expected);
        }
    }
}
