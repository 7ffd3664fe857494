//! Two-phase graceful-then-force termination for a single child, outside
//! the pool's drain sequence (used when an individual request is
//! cancelled).

use std::sync::Arc;
use std::time::Duration;

use crate::pool::Terminable;

/// Sends graceful termination, then force termination if the child has
/// not exited within `timeout`. `wait_exited` should resolve once the
/// child's process has actually exited; the force-kill timer is
/// cancelled as soon as it does.
pub async fn kill_with_escalation<F>(child: Arc<dyn Terminable>, timeout: Duration, wait_exited: F)
where
    F: std::future::Future<Output = ()>,
{
    child.terminate_graceful().await;

    tokio::select! {
        _ = wait_exited => {}
        _ = tokio::time::sleep(timeout) => {
            child.terminate_force().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Terminable;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChild {
        graceful: Arc<AtomicUsize>,
        force: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Terminable for CountingChild {
        async fn terminate_graceful(&self) {
            self.graceful.fetch_add(1, Ordering::SeqCst);
        }
        async fn terminate_force(&self) {
            self.force.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn skips_force_kill_when_exit_observed_first() {
        let graceful = Arc::new(AtomicUsize::new(0));
        let force = Arc::new(AtomicUsize::new(0));
        let child: Arc<dyn Terminable> = Arc::new(CountingChild {
            graceful: graceful.clone(),
            force: force.clone(),
        });

        kill_with_escalation(child, Duration::from_millis(200), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
        })
        .await;

        assert_eq!(graceful.load(Ordering::SeqCst), 1);
        assert_eq!(force.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn force_kills_after_timeout() {
        let graceful = Arc::new(AtomicUsize::new(0));
        let force = Arc::new(AtomicUsize::new(0));
        let child: Arc<dyn Terminable> = Arc::new(CountingChild {
            graceful: graceful.clone(),
            force: force.clone(),
        });

        kill_with_escalation(child, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        assert_eq!(graceful.load(Ordering::SeqCst), 1);
        assert_eq!(force.load(Ordering::SeqCst), 1);
    }
}
