//! Periodic sweep timer for a [`SessionRegistry`](crate::registry::SessionRegistry).

use std::sync::Arc;
use std::time::Duration;

use crate::registry::SessionRegistry;

/// Spawns a background task that calls `sweep()` on a fixed interval.
/// Dropping the returned handle's abort guard stops the timer; the
/// registry's own state is untouched (call `destroy()` separately).
pub fn spawn_sweeper(registry: Arc<SessionRegistry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            registry.sweep();
        }
    })
}
