//! Reaper for expired leases and stalled dependencies.
//!
//! The reaper periodically makes jobs whose lease has lapsed dispatchable
//! again and re-examines blocked jobs whose dependency managers may have
//! changed their answer (a file appearing, for instance).

use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Storage operations the reaper drives.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Return running jobs whose lease is older than `lock_timeout` to the
    /// dispatch set. Returns how many were reclaimed.
    async fn reclaim_expired(&self, lock_timeout: Duration) -> usize;

    /// Re-evaluate blocked jobs. Returns how many became dispatchable.
    async fn recheck_blocked(&self) -> usize;
}

/// Reaper that recovers jobs from stalled or vanished workers.
pub struct LeaseReaper {
    store: Weak<dyn LeaseStore>,
    interval: Duration,
    lock_timeout: Duration,
    shutdown: CancellationToken,
}

impl LeaseReaper {
    /// Create a new reaper.
    pub fn new(
        store: Weak<dyn LeaseStore>,
        interval: Duration,
        lock_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            interval,
            lock_timeout,
            shutdown,
        }
    }

    /// Run the reaper loop until shutdown or until the store is dropped.
    pub async fn run(&self) {
        tracing::debug!("Reaper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(store) = self.store.upgrade() else {
                break;
            };

            let reclaimed = store.reclaim_expired(self.lock_timeout).await;
            if reclaimed > 0 {
                tracing::info!(count = reclaimed, "Reclaimed jobs with expired leases");
            }

            let unblocked = store.recheck_blocked().await;
            if unblocked > 0 {
                tracing::debug!(count = unblocked, "Blocked jobs became ready");
            }
        }

        tracing::debug!("Reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingStore {
        reclaims: AtomicUsize,
        rechecks: AtomicUsize,
    }

    #[async_trait]
    impl LeaseStore for CountingStore {
        async fn reclaim_expired(&self, _lock_timeout: Duration) -> usize {
            self.reclaims.fetch_add(1, Ordering::SeqCst);
            1
        }

        async fn recheck_blocked(&self) -> usize {
            self.rechecks.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[tokio::test]
    async fn test_reaper_ticks_until_shutdown() {
        let store = Arc::new(CountingStore::default());
        let weak: Weak<dyn LeaseStore> = Arc::downgrade(&store) as Weak<dyn LeaseStore>;
        let shutdown = CancellationToken::new();
        let reaper = LeaseReaper::new(
            weak,
            Duration::from_millis(10),
            Duration::from_secs(1),
            shutdown.clone(),
        );
        let handle = tokio::spawn(async move { reaper.run().await });

        tokio::time::sleep(Duration::from_millis(55)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let ticks = store.reclaims.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected several ticks, got {}", ticks);
        assert_eq!(ticks, store.rechecks.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reaper_stops_when_store_dropped() {
        let store = Arc::new(CountingStore::default());
        let weak: Weak<dyn LeaseStore> = Arc::downgrade(&store) as Weak<dyn LeaseStore>;
        drop(store);

        let reaper = LeaseReaper::new(
            weak,
            Duration::from_millis(5),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        tokio::time::timeout(Duration::from_secs(1), reaper.run())
            .await
            .unwrap();
    }
}
