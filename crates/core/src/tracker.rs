//! Lifecycle host wiring heartbeats, tracking and recovery into a runtime.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SharedBackend};
use crate::config::AssuredConfig;
use crate::enqueue::{Enqueuer, NoUniqueLocks, UniqueLocks};
use crate::error::{AssuredError, Result};
use crate::heartbeat::Heartbeater;
use crate::middleware::TrackingMiddleware;
use crate::recovery::Recovery;
use crate::scheduler::RecoveryScheduler;

/// Builder for [`AssuredJobs`].
#[derive(Default)]
pub struct AssuredJobsBuilder {
    config: Option<AssuredConfig>,
    backend: Option<SharedBackend>,
    enqueuer: Option<Arc<dyn Enqueuer>>,
    unique_locks: Option<Arc<dyn UniqueLocks>>,
}

impl AssuredJobsBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration. Defaults to [`AssuredConfig::default`].
    pub fn config(mut self, config: AssuredConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the backend.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(SharedBackend::new(backend));
        self
    }

    /// Set the runtime's enqueue entry point used to resubmit orphans.
    pub fn enqueuer(mut self, enqueuer: impl Enqueuer + 'static) -> Self {
        self.enqueuer = Some(Arc::new(enqueuer));
        self
    }

    /// Set the uniqueness-lock subsystem cleared before resubmission.
    pub fn unique_locks(mut self, locks: impl UniqueLocks + 'static) -> Self {
        self.unique_locks = Some(Arc::new(locks));
        self
    }

    /// Build with the configured backend.
    pub fn build(mut self) -> Result<AssuredJobs<SharedBackend>> {
        let backend = self
            .backend
            .take()
            .ok_or_else(|| AssuredError::Config("Backend is required".to_string()))?;

        self.build_with_backend(backend)
    }

    /// Build with a custom backend.
    pub fn build_with_backend<B: Backend + Clone + 'static>(
        self,
        backend: B,
    ) -> Result<AssuredJobs<B>> {
        let enqueuer = self
            .enqueuer
            .ok_or_else(|| AssuredError::Config("Enqueuer is required".to_string()))?;

        let config = self.config.unwrap_or_default();
        config.validate()?;
        let unique_locks = self
            .unique_locks
            .unwrap_or_else(|| Arc::new(NoUniqueLocks));

        Ok(AssuredJobs::new(config, backend, enqueuer, unique_locks))
    }
}

/// What was left behind when the host stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs still tracked by this instance. Another instance's sweep will
    /// resubmit them.
    pub abandoned: Vec<String>,
}

/// Crash-recovery host for one worker process.
///
/// Hand [`AssuredJobs::middleware`] to the job runtime, call
/// [`AssuredJobs::start`] when the process starts serving and
/// [`AssuredJobs::shutdown`] when it stops.
pub struct AssuredJobs<B: Backend + Clone + 'static = SharedBackend> {
    config: Arc<AssuredConfig>,
    backend: B,
    enqueuer: Arc<dyn Enqueuer>,
    unique_locks: Arc<dyn UniqueLocks>,
    recovery: Arc<Recovery<B>>,
    middleware: TrackingMiddleware<B>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    started: bool,
}

impl AssuredJobs<SharedBackend> {
    /// Create a new builder.
    pub fn builder() -> AssuredJobsBuilder {
        AssuredJobsBuilder::new()
    }
}

impl<B: Backend + Clone + 'static> AssuredJobs<B> {
    /// Create a host from its parts.
    pub fn new(
        config: AssuredConfig,
        backend: B,
        enqueuer: Arc<dyn Enqueuer>,
        unique_locks: Arc<dyn UniqueLocks>,
    ) -> Self {
        let config = Arc::new(config);
        let recovery = Arc::new(
            Recovery::new(backend.clone(), config.clone(), enqueuer.clone())
                .with_unique_locks(unique_locks.clone()),
        );
        let middleware = TrackingMiddleware::new(backend.clone(), config.clone());

        Self {
            config,
            backend,
            enqueuer,
            unique_locks,
            recovery,
            middleware,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            started: false,
        }
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// The shared configuration.
    pub fn config(&self) -> &Arc<AssuredConfig> {
        &self.config
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The enqueue entry point used for resubmission.
    pub fn enqueuer(&self) -> &Arc<dyn Enqueuer> {
        &self.enqueuer
    }

    /// The uniqueness-lock subsystem.
    pub fn unique_locks(&self) -> &Arc<dyn UniqueLocks> {
        &self.unique_locks
    }

    /// Middleware to install in the job runtime.
    pub fn middleware(&self) -> TrackingMiddleware<B> {
        self.middleware.clone()
    }

    /// The recovery coordinator, for running a sweep by hand.
    pub fn recovery(&self) -> Arc<Recovery<B>> {
        self.recovery.clone()
    }

    /// Start heartbeats and the recovery schedule.
    ///
    /// The first heartbeat is written before this returns so the instance is
    /// live as soon as it starts taking jobs.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(AssuredError::Config("Already started".to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(AssuredError::Config("Already shut down".to_string()));
        }
        self.config.validate()?;
        self.started = true;

        let heartbeater = Heartbeater::new(
            self.backend.clone(),
            self.config.clone(),
            self.cancel.clone(),
        );
        heartbeater.activate().await;
        self.tasks.spawn(async move { heartbeater.refresh_loop().await });

        let scheduler =
            RecoveryScheduler::from_config(self.recovery.clone(), &self.config, self.cancel.clone());
        self.tasks.spawn(async move { scheduler.run().await });

        tracing::info!(
            instance_id = %self.config.instance_id,
            namespace = %self.config.namespace,
            heartbeat_interval_secs = self.config.heartbeat_interval.as_secs(),
            heartbeat_ttl_secs = self.config.heartbeat_ttl.as_secs(),
            "Assured jobs started"
        );

        Ok(())
    }

    /// Start, wait for `shutdown` to resolve, then shut down.
    pub async fn run_until<S>(&mut self, shutdown: S) -> Result<ShutdownReport>
    where
        S: Future<Output = ()> + Send,
    {
        self.start().await?;
        shutdown.await;
        tracing::info!(instance_id = %self.config.instance_id, "Shutdown requested");
        self.shutdown().await
    }

    /// Stop background tasks and delete the liveness marker.
    ///
    /// Tracked jobs are left in place: they belong to a now-dead instance and
    /// the next sweep anywhere in the cluster resubmits them.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport> {
        self.cancel.cancel();

        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Task panicked");
            }
        }

        if !self.started {
            return Ok(ShutdownReport::default());
        }
        self.started = false;

        let abandoned = self
            .backend
            .tracked_jobs(&self.config.namespace, &self.config.instance_id)
            .await?;

        if abandoned.is_empty() {
            tracing::info!(instance_id = %self.config.instance_id, "No tracked jobs left behind");
        } else {
            tracing::warn!(
                instance_id = %self.config.instance_id,
                count = abandoned.len(),
                jids = ?abandoned,
                "Tracked jobs left for orphan recovery"
            );
        }

        tracing::info!(instance_id = %self.config.instance_id, "Assured jobs stopped");
        Ok(ShutdownReport { abandoned })
    }
}
