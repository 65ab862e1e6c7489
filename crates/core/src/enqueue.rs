//! Hooks into the job runtime used when resubmitting orphaned jobs.

use async_trait::async_trait;

use crate::error::Result;
use crate::job::JobPayload;

/// The job runtime's enqueue entry point.
///
/// Recovered payloads are passed through unchanged: `raw` is the payload
/// exactly as it was tracked and `job` is its parsed view, for routing.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    /// Submit a raw job payload for execution.
    async fn enqueue(&self, job: &JobPayload, raw: &str) -> Result<()>;
}

/// An external uniqueness-lock subsystem.
///
/// Jobs carrying a `unique_digest` may still hold a lock taken when they were
/// first enqueued; it has to be cleared or the resubmission is rejected as a
/// duplicate.
#[async_trait]
pub trait UniqueLocks: Send + Sync {
    /// Release the lock identified by `digest`.
    async fn clear(&self, digest: &str) -> Result<()>;
}

/// Used when no uniqueness subsystem is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUniqueLocks;

#[async_trait]
impl UniqueLocks for NoUniqueLocks {
    async fn clear(&self, _digest: &str) -> Result<()> {
        Ok(())
    }
}

/// Best-effort release of a job's uniqueness lock before resubmission.
///
/// Failures are logged and swallowed.
pub async fn clear_unique_lock(locks: &dyn UniqueLocks, job: &JobPayload) {
    let Some(digest) = job.unique_digest.as_deref() else {
        return;
    };

    match locks.clear(digest).await {
        Ok(()) => tracing::info!(
            jid = %job.jid,
            digest = %digest,
            "Cleared unique-jobs lock"
        ),
        Err(e) => tracing::warn!(
            jid = %job.jid,
            digest = %digest,
            error = %e,
            "Failed to clear unique-jobs lock"
        ),
    }
}
