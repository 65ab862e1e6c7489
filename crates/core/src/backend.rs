//! Shared store abstraction.
//!
//! Instances never talk to each other; every bit of coordination (liveness,
//! job tracking, the recovery lock) goes through a [`Backend`]. The
//! implementation must provide atomic conditional-set with expiry, multi-key
//! transactions, sets, and key expiry.
//!
//! All operations take the namespace so one backend connection can serve
//! several independent deployments.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Backend trait for liveness, tracking and lock storage.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Backend: Send + Sync {
    // ========== Liveness ==========

    /// Write the liveness marker of an instance with the given expiry.
    ///
    /// `at` is the heartbeat time in Unix seconds.
    async fn heartbeat(&self, ns: &str, instance_id: &str, at: f64, ttl: Duration) -> Result<()>;

    /// Delete the liveness marker of an instance.
    async fn remove_heartbeat(&self, ns: &str, instance_id: &str) -> Result<()>;

    /// Read the last heartbeat time of an instance, if its marker is present.
    async fn last_heartbeat(&self, ns: &str, instance_id: &str) -> Result<Option<f64>>;

    /// Ids of every instance whose liveness marker is currently present.
    async fn live_instances(&self, ns: &str) -> Result<Vec<String>>;

    // ========== Job Tracking ==========

    /// Atomically add `jid` to the instance's tracking set and store its payload.
    async fn track_job(&self, ns: &str, instance_id: &str, jid: &str, payload: &str) -> Result<()>;

    /// Atomically remove `jid` from the instance's tracking set and delete its payload.
    async fn untrack_job(&self, ns: &str, instance_id: &str, jid: &str) -> Result<()>;

    /// Atomically remove `jid` from the instance's tracking set and, only if
    /// it was a member, delete its payload.
    ///
    /// Returns `true` if this call removed the entry. Exactly one of several
    /// concurrent claims on the same entry succeeds.
    async fn claim_job(&self, ns: &str, instance_id: &str, jid: &str) -> Result<bool>;

    /// Ids of every instance that owns a non-empty tracking set.
    async fn tracking_owners(&self, ns: &str) -> Result<Vec<String>>;

    /// Job ids in an instance's tracking set.
    async fn tracked_jobs(&self, ns: &str, instance_id: &str) -> Result<Vec<String>>;

    /// Number of job ids in an instance's tracking set.
    async fn tracked_count(&self, ns: &str, instance_id: &str) -> Result<usize>;

    /// Whether `jid` is in the instance's tracking set.
    async fn is_tracked_by(&self, ns: &str, instance_id: &str, jid: &str) -> Result<bool>;

    /// Read the stored payload of a tracked job.
    async fn job_payload(&self, ns: &str, jid: &str) -> Result<Option<String>>;

    /// Delete an instance's whole tracking set.
    async fn remove_tracking_set(&self, ns: &str, instance_id: &str) -> Result<()>;

    /// Find the instance tracking `jid`, if any.
    async fn find_owner(&self, ns: &str, jid: &str) -> Result<Option<String>> {
        for owner in self.tracking_owners(ns).await? {
            if self.is_tracked_by(ns, &owner, jid).await? {
                return Ok(Some(owner));
            }
        }
        Ok(None)
    }

    // ========== Recovery Lock ==========

    /// Set the recovery lock to `holder` only if it is absent.
    ///
    /// Returns `true` if this call acquired the lock.
    async fn try_acquire_recovery_lock(&self, ns: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Delete the recovery lock.
    async fn release_recovery_lock(&self, ns: &str) -> Result<()>;

    /// Current holder of the recovery lock.
    async fn recovery_lock_holder(&self, ns: &str) -> Result<Option<String>>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn heartbeat(&self, ns: &str, instance_id: &str, at: f64, ttl: Duration) -> Result<()> {
        self.inner.heartbeat(ns, instance_id, at, ttl).await
    }

    async fn remove_heartbeat(&self, ns: &str, instance_id: &str) -> Result<()> {
        self.inner.remove_heartbeat(ns, instance_id).await
    }

    async fn last_heartbeat(&self, ns: &str, instance_id: &str) -> Result<Option<f64>> {
        self.inner.last_heartbeat(ns, instance_id).await
    }

    async fn live_instances(&self, ns: &str) -> Result<Vec<String>> {
        self.inner.live_instances(ns).await
    }

    async fn track_job(&self, ns: &str, instance_id: &str, jid: &str, payload: &str) -> Result<()> {
        self.inner.track_job(ns, instance_id, jid, payload).await
    }

    async fn untrack_job(&self, ns: &str, instance_id: &str, jid: &str) -> Result<()> {
        self.inner.untrack_job(ns, instance_id, jid).await
    }

    async fn claim_job(&self, ns: &str, instance_id: &str, jid: &str) -> Result<bool> {
        self.inner.claim_job(ns, instance_id, jid).await
    }

    async fn tracking_owners(&self, ns: &str) -> Result<Vec<String>> {
        self.inner.tracking_owners(ns).await
    }

    async fn tracked_jobs(&self, ns: &str, instance_id: &str) -> Result<Vec<String>> {
        self.inner.tracked_jobs(ns, instance_id).await
    }

    async fn tracked_count(&self, ns: &str, instance_id: &str) -> Result<usize> {
        self.inner.tracked_count(ns, instance_id).await
    }

    async fn is_tracked_by(&self, ns: &str, instance_id: &str, jid: &str) -> Result<bool> {
        self.inner.is_tracked_by(ns, instance_id, jid).await
    }

    async fn job_payload(&self, ns: &str, jid: &str) -> Result<Option<String>> {
        self.inner.job_payload(ns, jid).await
    }

    async fn remove_tracking_set(&self, ns: &str, instance_id: &str) -> Result<()> {
        self.inner.remove_tracking_set(ns, instance_id).await
    }

    async fn find_owner(&self, ns: &str, jid: &str) -> Result<Option<String>> {
        self.inner.find_owner(ns, jid).await
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
