//! Job tracking middleware.
//!
//! Wraps each job execution so that, for the whole duration of the attempt,
//! the store records which instance is running it and the payload needed to
//! run it again.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::backend::Backend;
use crate::config::AssuredConfig;
use crate::job::{JobPayload, Worker};

/// Middleware recording in-flight jobs of opted-in workers.
#[derive(Clone)]
pub struct TrackingMiddleware<B: Backend> {
    backend: B,
    config: Arc<AssuredConfig>,
}

impl<B: Backend> TrackingMiddleware<B> {
    /// Create a new middleware for the local instance.
    pub fn new(backend: B, config: Arc<AssuredConfig>) -> Self {
        Self { backend, config }
    }

    /// Whether executions of `worker` are tracked.
    pub fn should_track<W: Worker + ?Sized>(&self, worker: &W) -> bool {
        worker.options().assured
    }

    /// Run `execute` for `job`, tracking it if the worker opted in.
    ///
    /// The job's output is returned untouched and a panic inside the job is
    /// resumed once the tracking entry has been removed. Store failures are
    /// logged and never affect the job.
    pub async fn call<W, Fut>(&self, worker: &W, job: &JobPayload, queue: &str, execute: Fut) -> Fut::Output
    where
        W: Worker + ?Sized,
        Fut: Future,
    {
        if !self.should_track(worker) {
            return execute.await;
        }

        self.start_tracking(job, queue).await;

        let outcome = AssertUnwindSafe(execute).catch_unwind().await;

        self.stop_tracking(job).await;

        match outcome {
            Ok(output) => output,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn start_tracking(&self, job: &JobPayload, queue: &str) {
        let payload = match job.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(jid = %job.jid, error = %e, "Failed to serialize job for tracking");
                return;
            }
        };

        match self
            .backend
            .track_job(&self.config.namespace, &self.config.instance_id, &job.jid, &payload)
            .await
        {
            Ok(()) => tracing::debug!(
                jid = %job.jid,
                class = %job.class,
                queue = %queue,
                instance_id = %self.config.instance_id,
                "Started tracking job"
            ),
            Err(e) => tracing::error!(
                jid = %job.jid,
                instance_id = %self.config.instance_id,
                error = %e,
                "Failed to start tracking job"
            ),
        }
    }

    async fn stop_tracking(&self, job: &JobPayload) {
        match self
            .backend
            .untrack_job(&self.config.namespace, &self.config.instance_id, &job.jid)
            .await
        {
            Ok(()) => tracing::debug!(
                jid = %job.jid,
                instance_id = %self.config.instance_id,
                "Stopped tracking job"
            ),
            Err(e) => tracing::error!(
                jid = %job.jid,
                instance_id = %self.config.instance_id,
                error = %e,
                "Failed to stop tracking job"
            ),
        }
    }
}
