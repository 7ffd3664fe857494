//! Capacity-bounded child process pool with graceful drain.
//!
//! Acquisition capacity is modeled with a [`tokio::sync::Semaphore`]: a
//! released permit is handed straight to the next queued waiter, which is
//! exactly the FIFO hand-off the pool contract calls for. Closing the
//! semaphore is what gives `drain_all`/`destroy` their "reject every
//! queued waiter" behavior for free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gw_domain::error::Error;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Abstracts the two-phase termination signal a tracked child understands.
/// Concrete mapping to OS signals (SIGTERM/SIGKILL on POSIX) lives with
/// whatever spawns the child.
#[async_trait]
pub trait Terminable: Send + Sync {
    async fn terminate_graceful(&self);
    async fn terminate_force(&self);
}

/// Held by a caller that has acquired pool capacity. Releases the slot to
/// the next waiter (or decrements `active`) on drop.
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct ProcessPool {
    max_concurrent: usize,
    queue_timeout: Duration,
    shutdown_timeout: Duration,
    semaphore: Mutex<Arc<Semaphore>>,
    shutting_down: AtomicBool,
    tracked: Mutex<HashMap<u64, Arc<dyn Terminable>>>,
    next_id: AtomicU64,
    tracked_empty: Notify,
}

impl ProcessPool {
    pub fn new(max_concurrent: usize, queue_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            max_concurrent,
            queue_timeout,
            shutdown_timeout,
            semaphore: Mutex::new(Arc::new(Semaphore::new(max_concurrent))),
            shutting_down: AtomicBool::new(false),
            tracked: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tracked_empty: Notify::new(),
        }
    }

    /// Acquires a capacity slot, waiting up to `queue_timeout` when the
    /// pool is at capacity. Fails immediately while shutting down.
    pub async fn acquire(&self) -> Result<PoolPermit, Error> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::BackendError("process pool is shutting down".into()));
        }

        let semaphore = self.semaphore.lock().clone();
        let acquired = tokio::time::timeout(self.queue_timeout, semaphore.acquire_owned()).await;
        match acquired {
            Ok(Ok(permit)) => Ok(PoolPermit { _permit: permit }),
            Ok(Err(_closed)) => {
                Err(Error::BackendError("process pool is shutting down".into()))
            }
            Err(_elapsed) => Err(Error::BackendError("no capacity available".into())),
        }
    }

    /// Adds `child` to the tracked set, returning an id to `untrack` with.
    pub fn track(&self, child: Arc<dyn Terminable>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.tracked.lock().insert(id, child);
        id
    }

    /// Removes a tracked child. If a drain is waiting on the tracked set
    /// to empty, wakes it once it does.
    pub fn untrack(&self, id: u64) {
        let mut tracked = self.tracked.lock();
        tracked.remove(&id);
        if tracked.is_empty() {
            self.tracked_empty.notify_waiters();
        }
    }

    pub fn active_count(&self) -> usize {
        self.max_concurrent - self.semaphore.lock().available_permits()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Idempotent two-phase graceful-then-force shutdown. Returns once
    /// every tracked child has exited, escalation has force-killed the
    /// stragglers, or the second `shutdown_timeout` elapses (progress
    /// guarantee: the tracked set is cleared and this always returns).
    pub async fn drain_all(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            // Already draining (or drained) -- idempotent no-op.
            return;
        }

        self.semaphore.lock().close();

        let children: Vec<Arc<dyn Terminable>> = self.tracked.lock().values().cloned().collect();
        if children.is_empty() {
            return;
        }

        for child in &children {
            child.terminate_graceful().await;
        }
        if self.wait_for_empty(self.shutdown_timeout).await {
            return;
        }

        tracing::warn!(
            remaining = self.tracked_count(),
            "drain: graceful termination timed out, escalating to force-kill"
        );
        let remaining: Vec<Arc<dyn Terminable>> = self.tracked.lock().values().cloned().collect();
        for child in &remaining {
            child.terminate_force().await;
        }
        if self.wait_for_empty(self.shutdown_timeout).await {
            return;
        }

        tracing::warn!("drain: force-kill escalation timed out, clearing tracked set anyway");
        self.tracked.lock().clear();
    }

    async fn wait_for_empty(&self, timeout: Duration) -> bool {
        if self.tracked_count() == 0 {
            return true;
        }
        tokio::time::timeout(timeout, self.tracked_empty.notified())
            .await
            .is_ok()
            && self.tracked_count() == 0
    }

    /// Rejects all queued waiters and resets the pool to a fresh,
    /// reusable state.
    pub fn destroy(&self) {
        let mut semaphore = self.semaphore.lock();
        semaphore.close();
        *semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        self.shutting_down.store(false, Ordering::SeqCst);
        self.tracked.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingChild {
        graceful_calls: Arc<AtomicUsize>,
        force_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Terminable for CountingChild {
        async fn terminate_graceful(&self) {
            self.graceful_calls.fetch_add(1, Ordering::SeqCst);
        }
        async fn terminate_force(&self) {
            self.force_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn acquire_respects_capacity_and_releases_on_drop() {
        let pool = ProcessPool::new(1, Duration::from_millis(50), Duration::from_millis(50));
        let permit = pool.acquire().await.unwrap();
        assert_eq!(pool.active_count(), 1);
        drop(permit);
        assert_eq!(pool.active_count(), 0);
        pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_times_out_at_capacity() {
        let pool = ProcessPool::new(1, Duration::from_millis(20), Duration::from_millis(50));
        let _permit = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::BackendError(_)));
    }

    #[tokio::test]
    async fn drain_all_force_kills_after_timeout() {
        let pool = ProcessPool::new(4, Duration::from_millis(50), Duration::from_millis(30));
        let graceful = Arc::new(AtomicUsize::new(0));
        let force = Arc::new(AtomicUsize::new(0));
        let child: Arc<dyn Terminable> = Arc::new(CountingChild {
            graceful_calls: graceful.clone(),
            force_calls: force.clone(),
        });
        pool.track(child);

        pool.drain_all().await;

        assert_eq!(graceful.load(Ordering::SeqCst), 1);
        assert_eq!(force.load(Ordering::SeqCst), 1);
        assert_eq!(pool.tracked_count(), 0);
    }

    #[tokio::test]
    async fn drain_all_is_idempotent() {
        let pool = ProcessPool::new(1, Duration::from_millis(20), Duration::from_millis(20));
        pool.drain_all().await;
        pool.drain_all().await;
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::BackendError(_)));
    }

    #[tokio::test]
    async fn untrack_before_timeout_completes_drain_promptly() {
        let pool = Arc::new(ProcessPool::new(
            4,
            Duration::from_millis(50),
            Duration::from_secs(5),
        ));
        let graceful = Arc::new(AtomicUsize::new(0));
        let force = Arc::new(AtomicUsize::new(0));
        let child: Arc<dyn Terminable> = Arc::new(CountingChild {
            graceful_calls: graceful.clone(),
            force_calls: force.clone(),
        });
        let id = pool.track(child);

        let pool2 = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pool2.untrack(id);
        });

        let start = std::time::Instant::now();
        pool.drain_all().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(force.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn destroy_resets_pool_for_reuse() {
        let pool = ProcessPool::new(1, Duration::from_millis(20), Duration::from_millis(20));
        let permit = pool.acquire().await.unwrap();
        pool.destroy();
        drop(permit);
        pool.acquire().await.unwrap();
    }
}
