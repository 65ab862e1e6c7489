//! Orphan recovery.
//!
//! A sweep finds tracking sets whose owning instance has no liveness marker
//! and resubmits their jobs. Sweeps run under a cluster-wide lock so each
//! orphan is resubmitted by exactly one instance; an instance that fails to
//! take the lock skips the round.

use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::Backend;
use crate::config::AssuredConfig;
use crate::enqueue::{clear_unique_lock, Enqueuer, NoUniqueLocks, UniqueLocks};
use crate::error::Result;
use crate::job::JobPayload;

/// Counters for one completed sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances owning a tracking set but no liveness marker.
    pub dead_instances: usize,
    /// Job payloads found in dead instances' tracking sets.
    pub orphaned: usize,
    /// Jobs handed back to the runtime.
    pub resubmitted: usize,
    /// Jobs left in place for the next sweep.
    pub failed: usize,
}

/// What a sweep attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another instance holds the recovery lock.
    Skipped,
    /// This instance held the lock and ran the sweep.
    Completed(SweepReport),
}

/// Finds and resubmits jobs abandoned by dead instances.
pub struct Recovery<B: Backend> {
    backend: B,
    config: Arc<AssuredConfig>,
    enqueuer: Arc<dyn Enqueuer>,
    unique_locks: Arc<dyn UniqueLocks>,
}

impl<B: Backend> Recovery<B> {
    /// Create a new recovery coordinator.
    pub fn new(backend: B, config: Arc<AssuredConfig>, enqueuer: Arc<dyn Enqueuer>) -> Self {
        Self {
            backend,
            config,
            enqueuer,
            unique_locks: Arc::new(NoUniqueLocks),
        }
    }

    /// Clear uniqueness locks through `locks` before resubmitting.
    pub fn with_unique_locks(mut self, locks: Arc<dyn UniqueLocks>) -> Self {
        self.unique_locks = locks;
        self
    }

    /// Run a sweep, logging instead of returning any error.
    ///
    /// Returns `None` when the sweep failed; it is retried on the next
    /// scheduled invocation.
    pub async fn reenqueue_orphans(&self) -> Option<SweepOutcome> {
        match self.sweep().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(
                    instance_id = %self.config.instance_id,
                    namespace = %self.config.namespace,
                    error = %e,
                    error_debug = ?e,
                    "Orphan recovery failed"
                );
                None
            }
        }
    }

    /// Run one sweep under the recovery lock.
    ///
    /// The lock is deleted after the sweep whatever its result.
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        let ns = &self.config.namespace;
        let instance_id = &self.config.instance_id;

        let acquired = self
            .backend
            .try_acquire_recovery_lock(ns, instance_id, self.config.recovery_lock_ttl)
            .await?;

        if !acquired {
            tracing::debug!(
                instance_id = %instance_id,
                "Recovery lock not acquired, another instance is handling recovery"
            );
            return Ok(SweepOutcome::Skipped);
        }

        tracing::info!(instance_id = %instance_id, "Recovery lock acquired");

        let result = self.recover_orphans().await;

        if let Err(e) = self.backend.release_recovery_lock(ns).await {
            tracing::error!(
                instance_id = %instance_id,
                error = %e,
                "Failed to release recovery lock"
            );
        } else {
            tracing::info!(instance_id = %instance_id, "Recovery lock released");
        }

        result.map(SweepOutcome::Completed)
    }

    async fn recover_orphans(&self) -> Result<SweepReport> {
        let ns = &self.config.namespace;
        tracing::info!(namespace = %ns, "Starting orphan job recovery");

        // Owners before markers: an instance that starts between the two
        // scans then shows up live, never as an owner without a marker.
        let owners = self.backend.tracking_owners(ns).await?;
        let live: HashSet<String> = self.backend.live_instances(ns).await?.into_iter().collect();

        let mut report = SweepReport::default();

        for owner in owners.iter().filter(|owner| !live.contains(*owner)) {
            report.dead_instances += 1;
            self.recover_instance(owner, &mut report).await?;
        }

        if report.orphaned == 0 {
            tracing::info!(namespace = %ns, "Found no orphaned jobs");
        } else {
            tracing::info!(
                namespace = %ns,
                dead_instances = report.dead_instances,
                orphaned = report.orphaned,
                resubmitted = report.resubmitted,
                failed = report.failed,
                "Orphan job recovery complete"
            );
        }

        Ok(report)
    }

    /// Resubmit every job tracked by a dead instance.
    ///
    /// Each entry is claimed (removed) before its enqueue so a resubmitted job
    /// that starts on another instance never has its fresh tracking entry
    /// deleted by this sweep. Only a successful claim is enqueued, and a
    /// failed enqueue restores the entry.
    async fn recover_instance(&self, instance_id: &str, report: &mut SweepReport) -> Result<()> {
        let ns = &self.config.namespace;
        let jids = self.backend.tracked_jobs(ns, instance_id).await?;

        tracing::info!(
            dead_instance = %instance_id,
            job_count = jids.len(),
            "Recovering jobs from dead instance"
        );

        let mut left_behind = 0;

        for jid in jids {
            let Some(raw) = self.backend.job_payload(ns, &jid).await? else {
                tracing::debug!(jid = %jid, dead_instance = %instance_id, "Tracked job has no payload, dropping");
                self.backend.claim_job(ns, instance_id, &jid).await?;
                continue;
            };

            let job = match JobPayload::from_json(&raw) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(
                        jid = %jid,
                        dead_instance = %instance_id,
                        error = %e,
                        "Orphaned job payload is not valid JSON, leaving it in place"
                    );
                    report.failed += 1;
                    left_behind += 1;
                    continue;
                }
            };

            if !self.backend.claim_job(ns, instance_id, &jid).await? {
                tracing::debug!(jid = %jid, dead_instance = %instance_id, "Orphaned job already claimed");
                continue;
            }
            report.orphaned += 1;

            clear_unique_lock(self.unique_locks.as_ref(), &job).await;

            match self.enqueuer.enqueue(&job, &raw).await {
                Ok(()) => {
                    report.resubmitted += 1;
                    tracing::info!(
                        jid = %job.jid,
                        class = %job.class,
                        queue = %job.queue,
                        dead_instance = %instance_id,
                        "Re-enqueued orphaned job"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    left_behind += 1;
                    tracing::error!(
                        jid = %job.jid,
                        class = %job.class,
                        dead_instance = %instance_id,
                        error = %e,
                        "Failed to re-enqueue orphaned job, restoring its tracking entry"
                    );
                    self.backend.track_job(ns, instance_id, &jid, &raw).await?;
                }
            }
        }

        if left_behind == 0 {
            self.backend.remove_tracking_set(ns, instance_id).await?;
        } else {
            tracing::warn!(
                dead_instance = %instance_id,
                left_behind = left_behind,
                "Some orphaned jobs were not recovered, will retry on next sweep"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AssuredError;
    use crate::memory::{MemoryBackend, MemoryQueue};
    use async_trait::async_trait;
    use std::time::Duration;

    const NS: &str = "rec";

    fn config(instance_id: &str) -> Arc<AssuredConfig> {
        Arc::new(
            AssuredConfig::builder()
                .instance_id(instance_id)
                .namespace(NS)
                .build()
                .unwrap(),
        )
    }

    fn payload(jid: &str) -> String {
        JobPayload::new("W", jid).to_json().unwrap()
    }

    struct RejectingQueue;

    #[async_trait]
    impl Enqueuer for RejectingQueue {
        async fn enqueue(&self, _job: &JobPayload, _raw: &str) -> Result<()> {
            Err(AssuredError::Enqueue("queue unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_tracked_is_noop() {
        let backend = MemoryBackend::new();
        let queue = MemoryQueue::new();
        let recovery = Recovery::new(backend.clone(), config("c"), Arc::new(queue.clone()));

        let outcome = recovery.sweep().await.unwrap();

        assert_eq!(outcome, SweepOutcome::Completed(SweepReport::default()));
        assert!(queue.is_empty());
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_when_lock_held() {
        let backend = MemoryBackend::new();
        let queue = MemoryQueue::new();
        backend.track_job(NS, "dead", "j1", &payload("j1")).await.unwrap();
        backend
            .try_acquire_recovery_lock(NS, "other", Duration::from_secs(300))
            .await
            .unwrap();

        let recovery = Recovery::new(backend.clone(), config("c"), Arc::new(queue.clone()));
        assert_eq!(recovery.sweep().await.unwrap(), SweepOutcome::Skipped);

        assert!(queue.is_empty());
        assert_eq!(
            backend.recovery_lock_holder(NS).await.unwrap().as_deref(),
            Some("other")
        );
    }

    #[tokio::test]
    async fn test_missing_payload_is_dropped() {
        let backend = MemoryBackend::new();
        let queue = MemoryQueue::new();
        backend.track_job(NS, "dead", "j1", &payload("j1")).await.unwrap();
        backend.track_job(NS, "dead", "j2", &payload("j2")).await.unwrap();
        // Untracking under another owner drops only the payload key.
        backend.untrack_job(NS, "nobody", "j2").await.unwrap();
        assert!(backend.job_payload(NS, "j2").await.unwrap().is_none());
        assert!(backend.is_tracked_by(NS, "dead", "j2").await.unwrap());

        let recovery = Recovery::new(backend.clone(), config("c"), Arc::new(queue.clone()));
        let outcome = recovery.sweep().await.unwrap();

        let SweepOutcome::Completed(report) = outcome else {
            panic!("sweep skipped");
        };
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.resubmitted, 1);
        assert_eq!(queue.jobs()[0].jid, "j1");
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_failed_enqueue_restores_entry() {
        let backend = MemoryBackend::new();
        backend.track_job(NS, "dead", "j1", &payload("j1")).await.unwrap();

        let recovery = Recovery::new(backend.clone(), config("c"), Arc::new(RejectingQueue));
        let outcome = recovery.sweep().await.unwrap();

        assert_eq!(
            outcome,
            SweepOutcome::Completed(SweepReport {
                dead_instances: 1,
                orphaned: 1,
                resubmitted: 0,
                failed: 1,
            })
        );
        assert!(backend.is_tracked_by(NS, "dead", "j1").await.unwrap());
        assert_eq!(backend.job_payload(NS, "j1").await.unwrap(), Some(payload("j1")));
        assert!(backend.recovery_lock_holder(NS).await.unwrap().is_none());

        // A later sweep with a working queue picks it up.
        let queue = MemoryQueue::new();
        let recovery = Recovery::new(backend.clone(), config("c"), Arc::new(queue.clone()));
        recovery.sweep().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert!(backend.keys().is_empty());
    }

    /// Memory backend with injected faults and interleavings.
    #[derive(Default)]
    struct Scripted {
        inner: MemoryBackend,
        /// Listing tracking sets fails.
        broken_scan: bool,
        /// Instance "late" starts a job right after the marker scan.
        late_start: bool,
        /// Another path claims each job right after its payload is read.
        claimed_elsewhere: bool,
    }

    #[async_trait]
    impl Backend for Scripted {
        async fn heartbeat(&self, ns: &str, id: &str, at: f64, ttl: Duration) -> Result<()> {
            self.inner.heartbeat(ns, id, at, ttl).await
        }
        async fn remove_heartbeat(&self, ns: &str, id: &str) -> Result<()> {
            self.inner.remove_heartbeat(ns, id).await
        }
        async fn last_heartbeat(&self, ns: &str, id: &str) -> Result<Option<f64>> {
            self.inner.last_heartbeat(ns, id).await
        }
        async fn live_instances(&self, ns: &str) -> Result<Vec<String>> {
            let live = self.inner.live_instances(ns).await?;
            if self.late_start {
                self.inner
                    .heartbeat(ns, "late", crate::heartbeat::unix_now(), Duration::from_secs(45))
                    .await?;
                self.inner
                    .track_job(ns, "late", "late-running", &payload("late-running"))
                    .await?;
            }
            Ok(live)
        }
        async fn track_job(&self, ns: &str, id: &str, jid: &str, payload: &str) -> Result<()> {
            self.inner.track_job(ns, id, jid, payload).await
        }
        async fn untrack_job(&self, ns: &str, id: &str, jid: &str) -> Result<()> {
            self.inner.untrack_job(ns, id, jid).await
        }
        async fn claim_job(&self, ns: &str, id: &str, jid: &str) -> Result<bool> {
            self.inner.claim_job(ns, id, jid).await
        }
        async fn tracking_owners(&self, ns: &str) -> Result<Vec<String>> {
            if self.broken_scan {
                return Err(AssuredError::Backend("connection reset".to_string()));
            }
            self.inner.tracking_owners(ns).await
        }
        async fn tracked_jobs(&self, ns: &str, id: &str) -> Result<Vec<String>> {
            self.inner.tracked_jobs(ns, id).await
        }
        async fn tracked_count(&self, ns: &str, id: &str) -> Result<usize> {
            self.inner.tracked_count(ns, id).await
        }
        async fn is_tracked_by(&self, ns: &str, id: &str, jid: &str) -> Result<bool> {
            self.inner.is_tracked_by(ns, id, jid).await
        }
        async fn job_payload(&self, ns: &str, jid: &str) -> Result<Option<String>> {
            let payload = self.inner.job_payload(ns, jid).await?;
            if self.claimed_elsewhere {
                if let Some(owner) = self.inner.find_owner(ns, jid).await? {
                    self.inner.claim_job(ns, &owner, jid).await?;
                }
            }
            Ok(payload)
        }
        async fn remove_tracking_set(&self, ns: &str, id: &str) -> Result<()> {
            self.inner.remove_tracking_set(ns, id).await
        }
        async fn try_acquire_recovery_lock(&self, ns: &str, holder: &str, ttl: Duration) -> Result<bool> {
            self.inner.try_acquire_recovery_lock(ns, holder, ttl).await
        }
        async fn release_recovery_lock(&self, ns: &str) -> Result<()> {
            self.inner.release_recovery_lock(ns).await
        }
        async fn recovery_lock_holder(&self, ns: &str) -> Result<Option<String>> {
            self.inner.recovery_lock_holder(ns).await
        }
    }

    #[tokio::test]
    async fn test_lock_released_when_sweep_fails() {
        let memory = MemoryBackend::new();
        let backend = Scripted {
            inner: memory.clone(),
            broken_scan: true,
            ..Default::default()
        };
        let recovery = Recovery::new(backend, config("c"), Arc::new(MemoryQueue::new()));

        let err = recovery.sweep().await.unwrap_err();
        assert!(matches!(err, AssuredError::Backend(_)));
        assert!(memory.recovery_lock_holder(NS).await.unwrap().is_none());

        // The logging wrapper swallows the error.
        assert_eq!(recovery.reenqueue_orphans().await, None);
        assert!(memory.keys().is_empty());
    }

    #[tokio::test]
    async fn test_instance_starting_mid_sweep_is_left_alone() {
        let memory = MemoryBackend::new();
        let queue = MemoryQueue::new();
        memory.track_job(NS, "dead", "j1", &payload("j1")).await.unwrap();
        let backend = Scripted {
            inner: memory.clone(),
            late_start: true,
            ..Default::default()
        };

        let recovery = Recovery::new(backend, config("c"), Arc::new(queue.clone()));
        let outcome = recovery.sweep().await.unwrap();

        assert_eq!(
            outcome,
            SweepOutcome::Completed(SweepReport {
                dead_instances: 1,
                orphaned: 1,
                resubmitted: 1,
                failed: 0,
            })
        );
        assert_eq!(queue.raw_jobs(), vec![payload("j1")]);
        assert_eq!(memory.live_instances(NS).await.unwrap(), vec!["late"]);
        assert!(memory.is_tracked_by(NS, "late", "late-running").await.unwrap());
        assert!(memory.job_payload(NS, "late-running").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_job_claimed_elsewhere_is_not_resubmitted() {
        let memory = MemoryBackend::new();
        let queue = MemoryQueue::new();
        memory.track_job(NS, "dead", "j1", &payload("j1")).await.unwrap();
        let backend = Scripted {
            inner: memory.clone(),
            claimed_elsewhere: true,
            ..Default::default()
        };

        let recovery = Recovery::new(backend, config("c"), Arc::new(queue.clone()));
        let outcome = recovery.sweep().await.unwrap();

        assert_eq!(
            outcome,
            SweepOutcome::Completed(SweepReport {
                dead_instances: 1,
                ..Default::default()
            })
        );
        assert!(queue.is_empty());
        assert!(memory.keys().is_empty());
    }

    #[tokio::test]
    async fn test_resubmits_raw_payload_unchanged() {
        let backend = MemoryBackend::new();
        let queue = MemoryQueue::new();
        let raw = r#"{"jid":"j1","class":"W","unique_digest":null,"retry":true}"#;
        backend.track_job(NS, "dead", "j1", raw).await.unwrap();

        let recovery = Recovery::new(backend.clone(), config("c"), Arc::new(queue.clone()));
        recovery.sweep().await.unwrap();

        assert_eq!(queue.raw_jobs(), vec![raw]);
        assert_eq!(queue.jobs()[0].queue, "default");
    }

    #[tokio::test]
    async fn test_invalid_payload_left_in_place() {
        let backend = MemoryBackend::new();
        let queue = MemoryQueue::new();
        backend.track_job(NS, "dead", "bad", "not json").await.unwrap();

        let recovery = Recovery::new(backend.clone(), config("c"), Arc::new(queue.clone()));
        let outcome = recovery.reenqueue_orphans().await;

        assert!(matches!(
            outcome,
            Some(SweepOutcome::Completed(SweepReport { failed: 1, .. }))
        ));
        assert!(queue.is_empty());
        assert!(backend.is_tracked_by(NS, "dead", "bad").await.unwrap());
    }
}
