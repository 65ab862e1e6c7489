//! # assured-admin - Orphaned job inspection and management
//!
//! This crate provides an `OrphanAdmin` for looking at and acting on jobs
//! left behind by dead instances, without waiting for the next recovery
//! sweep.
//!
//! ## Features
//!
//! - **Orphans**: List orphaned jobs with their owner and how long ago it died
//! - **Instances**: Live instances and dead ones still owning tracked jobs
//! - **Actions**: Retry or delete single orphans, or many at once
//! - **Statistics**: Totals for a dashboard or a JSON endpoint
//!
//! ## Usage
//!
//! ```rust,ignore
//! use assured_admin::OrphanAdmin;
//! use assured_core::AssuredConfig;
//! use assured_redis::{RedisBackend, RedisEnqueuer};
//!
//! #[tokio::main]
//! async fn main() -> assured_core::Result<()> {
//!     let backend = RedisBackend::new("redis://localhost").await?;
//!     let enqueuer = RedisEnqueuer::with_connection(backend.connection());
//!     let admin = OrphanAdmin::new(backend, &AssuredConfig::from_env()?, enqueuer);
//!
//!     for job in admin.orphaned_jobs().await? {
//!         println!("{} ({}) dead for {:.0}s", job.payload.jid, job.instance_id, job.orphaned_duration);
//!     }
//!
//!     admin.retry("job-id-123").await?;
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use assured_core::{
    clear_unique_lock, seconds_since, unix_now, AssuredConfig, AssuredJobs, Backend, Enqueuer,
    NoUniqueLocks, SharedBackend, UniqueLocks,
};

pub use assured_core::{AssuredError, JobPayload, Result};

/// A tracked job whose owner has no liveness marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanedJob {
    /// The job as it was tracked.
    pub payload: JobPayload,
    /// The dead instance that was running it.
    pub instance_id: String,
    /// Unix time the owner was last known alive.
    pub orphaned_at: f64,
    /// Seconds since `orphaned_at`.
    pub orphaned_duration: f64,
}

/// Liveness of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Alive,
    Dead,
}

/// An instance known to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub status: InstanceStatus,
    /// Marker timestamp for live instances, estimate for dead ones.
    pub last_heartbeat: Option<f64>,
    /// Jobs the instance still owns. Only set for dead instances.
    pub orphaned_job_count: Option<usize>,
}

/// Result of a bulk action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    /// Number of jobs the action succeeded for.
    pub succeeded: usize,
    /// `(jid, error message)` for every job it failed for.
    pub failures: Vec<(String, String)>,
}

impl BulkOutcome {
    /// Whether every job succeeded.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Orphan totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrphanStats {
    pub total_orphaned_jobs: usize,
    pub dead_instances: usize,
    pub live_instances: usize,
    /// Seconds the oldest orphan has been waiting.
    pub oldest_orphaned_duration: Option<f64>,
}

/// Admin client for orphaned jobs in one namespace.
#[derive(Clone)]
pub struct OrphanAdmin<B: Backend + Clone = SharedBackend> {
    backend: B,
    namespace: String,
    heartbeat_ttl: Duration,
    enqueuer: Arc<dyn Enqueuer>,
    unique_locks: Arc<dyn UniqueLocks>,
}

impl OrphanAdmin<SharedBackend> {
    /// Create a new admin client with a shared backend.
    pub fn new(
        backend: impl Backend + 'static,
        config: &AssuredConfig,
        enqueuer: impl Enqueuer + 'static,
    ) -> Self {
        Self::with_backend(SharedBackend::new(backend), config, Arc::new(enqueuer))
    }
}

impl<B: Backend + Clone + 'static> OrphanAdmin<B> {
    /// Create an admin client sharing a running host's backend, enqueuer and
    /// unique-lock cleaner.
    pub fn for_host(host: &AssuredJobs<B>) -> Self {
        Self::with_backend(host.backend().clone(), host.config(), host.enqueuer().clone())
            .with_unique_locks(host.unique_locks().clone())
    }
}

impl<B: Backend + Clone> OrphanAdmin<B> {
    /// Create an admin client with a specific backend.
    pub fn with_backend(backend: B, config: &AssuredConfig, enqueuer: Arc<dyn Enqueuer>) -> Self {
        Self {
            backend,
            namespace: config.namespace.clone(),
            heartbeat_ttl: config.heartbeat_ttl,
            enqueuer,
            unique_locks: Arc::new(NoUniqueLocks),
        }
    }

    /// Clear uniqueness locks through `locks` on retry.
    pub fn with_unique_locks(mut self, locks: Arc<dyn UniqueLocks>) -> Self {
        self.unique_locks = locks;
        self
    }

    /// Get a reference to the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The namespace this client manages.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // ========== Queries ==========

    /// All orphaned jobs, most recently orphaned first.
    pub async fn orphaned_jobs(&self) -> Result<Vec<OrphanedJob>> {
        let ns = &self.namespace;
        let mut jobs = Vec::new();

        for owner in self.dead_owners().await? {
            let orphaned_at = self.orphaned_at(&owner).await?;

            for jid in self.backend.tracked_jobs(ns, &owner).await? {
                let Some(raw) = self.backend.job_payload(ns, &jid).await? else {
                    continue;
                };
                match JobPayload::from_json(&raw) {
                    Ok(payload) => jobs.push(OrphanedJob {
                        payload,
                        instance_id: owner.clone(),
                        orphaned_at,
                        orphaned_duration: seconds_since(orphaned_at),
                    }),
                    Err(e) => {
                        tracing::warn!(jid = %jid, error = %e, "Skipping unparseable orphaned job")
                    }
                }
            }
        }

        jobs.sort_by(|a, b| b.orphaned_at.total_cmp(&a.orphaned_at));
        Ok(jobs)
    }

    /// A single orphaned job. `None` if it does not exist or its owner is alive.
    pub async fn orphaned_job(&self, jid: &str) -> Result<Option<OrphanedJob>> {
        match self.locate(jid).await {
            Ok((payload, _, instance_id)) => {
                let orphaned_at = self.orphaned_at(&instance_id).await?;
                Ok(Some(OrphanedJob {
                    payload,
                    instance_id,
                    orphaned_at,
                    orphaned_duration: seconds_since(orphaned_at),
                }))
            }
            Err(AssuredError::JobNotFound(_)) | Err(AssuredError::NotOrphaned(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Live instances and dead instances that still own tracked jobs.
    pub async fn instances(&self) -> Result<Vec<InstanceInfo>> {
        let ns = &self.namespace;
        let mut instances = Vec::new();

        let owners = self.backend.tracking_owners(ns).await?;
        let live = self.backend.live_instances(ns).await?;
        for instance_id in &live {
            instances.push(InstanceInfo {
                instance_id: instance_id.clone(),
                status: InstanceStatus::Alive,
                last_heartbeat: self.backend.last_heartbeat(ns, instance_id).await?,
                orphaned_job_count: None,
            });
        }

        let live: HashSet<String> = live.into_iter().collect();
        for owner in owners {
            if live.contains(&owner) {
                continue;
            }
            instances.push(InstanceInfo {
                last_heartbeat: Some(self.orphaned_at(&owner).await?),
                orphaned_job_count: Some(self.backend.tracked_count(ns, &owner).await?),
                instance_id: owner,
                status: InstanceStatus::Dead,
            });
        }

        Ok(instances)
    }

    /// Totals across orphaned jobs and instances.
    pub async fn stats(&self) -> Result<OrphanStats> {
        let jobs = self.orphaned_jobs().await?;
        let instances = self.instances().await?;

        Ok(OrphanStats {
            total_orphaned_jobs: jobs.len(),
            dead_instances: instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Dead)
                .count(),
            live_instances: instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Alive)
                .count(),
            oldest_orphaned_duration: jobs
                .iter()
                .map(|j| j.orphaned_duration)
                .max_by(f64::total_cmp),
        })
    }

    // ========== Actions ==========

    /// Resubmit an orphaned job now.
    ///
    /// The tracking entry is claimed first and restored if the enqueue
    /// fails, the same ordering a recovery sweep uses. A job claimed by a
    /// concurrent sweep or retry is reported as not found.
    pub async fn retry(&self, jid: &str) -> Result<()> {
        let ns = &self.namespace;
        let (payload, raw, instance_id) = self.locate(jid).await?;

        if !self.backend.claim_job(ns, &instance_id, jid).await? {
            return Err(AssuredError::JobNotFound(jid.to_string()));
        }
        clear_unique_lock(self.unique_locks.as_ref(), &payload).await;

        if let Err(e) = self.enqueuer.enqueue(&payload, &raw).await {
            self.backend.track_job(ns, &instance_id, jid, &raw).await?;
            return Err(e);
        }

        tracing::info!(
            jid = %jid,
            class = %payload.class,
            dead_instance = %instance_id,
            "Retried orphaned job"
        );
        Ok(())
    }

    /// Discard an orphaned job without running it.
    pub async fn delete(&self, jid: &str) -> Result<()> {
        let (_, _, instance_id) = self.locate(jid).await?;
        if !self
            .backend
            .claim_job(&self.namespace, &instance_id, jid)
            .await?
        {
            return Err(AssuredError::JobNotFound(jid.to_string()));
        }

        tracing::info!(jid = %jid, dead_instance = %instance_id, "Deleted orphaned job");
        Ok(())
    }

    /// Retry each job, collecting failures.
    pub async fn bulk_retry<S: AsRef<str>>(&self, jids: &[S]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for jid in jids {
            let jid = jid.as_ref();
            match self.retry(jid).await {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => outcome.failures.push((jid.to_string(), e.to_string())),
            }
        }
        outcome
    }

    /// Delete each job, collecting failures.
    pub async fn bulk_delete<S: AsRef<str>>(&self, jids: &[S]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for jid in jids {
            let jid = jid.as_ref();
            match self.delete(jid).await {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => outcome.failures.push((jid.to_string(), e.to_string())),
            }
        }
        outcome
    }

    // ========== Helpers ==========

    /// Tracking-set owners with no liveness marker.
    ///
    /// Owners are listed before markers, as a sweep does.
    async fn dead_owners(&self) -> Result<Vec<String>> {
        let owners = self.backend.tracking_owners(&self.namespace).await?;
        let live: HashSet<String> = self
            .backend
            .live_instances(&self.namespace)
            .await?
            .into_iter()
            .collect();
        Ok(owners.into_iter().filter(|o| !live.contains(o)).collect())
    }

    /// Last time `instance_id` was known alive.
    ///
    /// A dead instance's marker has expired, so this is at the latest one
    /// heartbeat TTL ago.
    async fn orphaned_at(&self, instance_id: &str) -> Result<f64> {
        Ok(self
            .backend
            .last_heartbeat(&self.namespace, instance_id)
            .await?
            .unwrap_or_else(|| unix_now() - self.heartbeat_ttl.as_secs_f64()))
    }

    /// Payload, raw payload and dead owner of an orphaned job.
    async fn locate(&self, jid: &str) -> Result<(JobPayload, String, String)> {
        let ns = &self.namespace;
        let raw = self
            .backend
            .job_payload(ns, jid)
            .await?
            .ok_or_else(|| AssuredError::JobNotFound(jid.to_string()))?;
        let instance_id = self
            .backend
            .find_owner(ns, jid)
            .await?
            .ok_or_else(|| AssuredError::JobNotFound(jid.to_string()))?;

        if self.backend.last_heartbeat(ns, &instance_id).await?.is_some() {
            return Err(AssuredError::NotOrphaned(jid.to_string()));
        }

        let payload = JobPayload::from_json(&raw)?;
        Ok((payload, raw, instance_id))
    }
}
