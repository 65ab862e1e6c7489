//! Scheduler for orphan recovery sweeps.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::AssuredConfig;
use crate::recovery::Recovery;

/// Runs one sweep shortly after startup, then a fixed number of delayed
/// follow-up sweeps.
///
/// The follow-ups catch jobs of instances that were still inside their
/// heartbeat TTL when the startup sweep ran. Cancellation is observed while
/// waiting between sweeps; a sweep in progress always finishes.
pub struct RecoveryScheduler<B: Backend> {
    recovery: Arc<Recovery<B>>,
    startup_delay: Duration,
    delayed_count: u32,
    delayed_interval: Duration,
    cancel: CancellationToken,
}

impl<B: Backend> RecoveryScheduler<B> {
    /// Create a new scheduler.
    pub fn new(
        recovery: Arc<Recovery<B>>,
        startup_delay: Duration,
        delayed_count: u32,
        delayed_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            recovery,
            startup_delay,
            delayed_count,
            delayed_interval,
            cancel,
        }
    }

    /// Create a scheduler with timings taken from `config`.
    pub fn from_config(
        recovery: Arc<Recovery<B>>,
        config: &AssuredConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(
            recovery,
            config.startup_delay,
            config.delayed_recovery_count,
            config.delayed_recovery_interval,
            cancel,
        )
    }

    /// Run the startup sweep and the delayed sweeps.
    ///
    /// Returns early when cancelled.
    pub async fn run(&self) {
        tracing::debug!(
            startup_delay_secs = self.startup_delay.as_secs_f64(),
            delayed_count = self.delayed_count,
            delayed_interval_secs = self.delayed_interval.as_secs_f64(),
            "Recovery scheduler started"
        );

        if !self.wait(self.startup_delay).await {
            tracing::debug!("Recovery scheduler cancelled before startup sweep");
            return;
        }
        self.recovery.reenqueue_orphans().await;

        for round in 1..=self.delayed_count {
            if !self.wait(self.delayed_interval).await {
                tracing::debug!(round = round, "Recovery scheduler cancelled");
                return;
            }

            tracing::info!(
                round = round,
                of = self.delayed_count,
                "Running delayed orphan recovery"
            );
            self.recovery.reenqueue_orphans().await;
        }

        tracing::debug!("Recovery scheduler finished");
    }

    /// Sleep for `delay`. Returns false if cancelled first.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPayload;
    use crate::memory::{MemoryBackend, MemoryQueue};

    const NS: &str = "sched";

    fn recovery(backend: &MemoryBackend, queue: &MemoryQueue) -> Arc<Recovery<MemoryBackend>> {
        let config = AssuredConfig::builder()
            .instance_id("me")
            .namespace(NS)
            .build()
            .unwrap();
        Arc::new(Recovery::new(
            backend.clone(),
            Arc::new(config),
            Arc::new(queue.clone()),
        ))
    }

    async fn orphan(backend: &MemoryBackend, owner: &str, jid: &str) {
        let raw = JobPayload::new("W", jid).to_json().unwrap();
        backend.track_job(NS, owner, jid, &raw).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_sweep_runs_after_delay() {
        let backend = MemoryBackend::new();
        let queue = MemoryQueue::new();
        orphan(&backend, "dead", "j1").await;

        let scheduler = RecoveryScheduler::new(
            recovery(&backend, &queue),
            Duration::from_secs(5),
            0,
            Duration::from_secs(300),
            CancellationToken::new(),
        );
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);

        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_sweep_catches_late_orphans() {
        let backend = MemoryBackend::new();
        let queue = MemoryQueue::new();

        // Peer still alive at startup, so nothing is recovered then.
        backend
            .heartbeat(NS, "peer", 1.0, Duration::from_secs(45))
            .await
            .unwrap();
        orphan(&backend, "peer", "late").await;

        let scheduler = RecoveryScheduler::new(
            recovery(&backend, &queue),
            Duration::from_secs(5),
            1,
            Duration::from_secs(300),
            CancellationToken::new(),
        );
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(queue.is_empty());
        assert!(backend.is_tracked_by(NS, "peer", "late").await.unwrap());

        handle.await.unwrap();
        assert_eq!(queue.jobs()[0].jid, "late");
        assert!(backend.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_configured_number_of_sweeps() {
        let backend = MemoryBackend::new();
        let queue = MemoryQueue::new();

        let scheduler = RecoveryScheduler::new(
            recovery(&backend, &queue),
            Duration::from_secs(5),
            3,
            Duration::from_secs(60),
            CancellationToken::new(),
        );
        let handle = tokio::spawn(async move { scheduler.run().await });

        // Sweeps run at 5s, 65s, 125s and 185s. A new orphan appears
        // between each pair.
        tokio::time::sleep(Duration::from_secs(30)).await;
        for i in 0..3 {
            orphan(&backend, "dead", &format!("j{}", i)).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        handle.await.unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_sweeps() {
        let backend = MemoryBackend::new();
        let queue = MemoryQueue::new();
        orphan(&backend, "dead", "j1").await;

        let cancel = CancellationToken::new();
        let scheduler = RecoveryScheduler::new(
            recovery(&backend, &queue),
            Duration::from_secs(5),
            1,
            Duration::from_secs(300),
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(queue.is_empty());
        assert!(backend.is_tracked_by(NS, "dead", "j1").await.unwrap());
    }
}
