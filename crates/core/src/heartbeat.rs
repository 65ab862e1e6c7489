//! Heartbeat component for instance liveness.
//!
//! The heartbeater keeps a TTL-bound marker for the local instance in the
//! store. Other instances treat a missing marker as proof that this process
//! is dead and that its tracked jobs are orphaned.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::AssuredConfig;
use crate::error::Result;

/// Heartbeater that periodically refreshes the instance's liveness marker.
pub struct Heartbeater<B: Backend> {
    backend: B,
    config: Arc<AssuredConfig>,
    cancel: CancellationToken,
}

impl<B: Backend + Clone + 'static> Heartbeater<B> {
    /// Create a new heartbeater.
    pub fn new(backend: B, config: Arc<AssuredConfig>, cancel: CancellationToken) -> Self {
        Self {
            backend,
            config,
            cancel,
        }
    }

    /// Send the first heartbeat and keep refreshing until cancelled.
    pub async fn run(&self) {
        self.activate().await;
        self.refresh_loop().await;
    }

    /// Write the marker once. Failures are logged, not returned.
    pub async fn activate(&self) {
        if let Err(e) = self.send_heartbeat().await {
            tracing::error!(
                instance_id = %self.config.instance_id,
                error = %e,
                "Failed to send initial heartbeat"
            );
        }
    }

    /// Refresh the marker every interval until cancelled, then delete it.
    ///
    /// Deleting the marker makes this instance dead immediately, so any job
    /// still tracked here becomes eligible for recovery. Store failures are
    /// logged and the loop keeps going.
    pub async fn refresh_loop(&self) {
        tracing::debug!(instance_id = %self.config.instance_id, "Heartbeater started");

        let period = self.config.heartbeat_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        tracing::error!(
                            instance_id = %self.config.instance_id,
                            error = %e,
                            "Failed to send heartbeat"
                        );
                    }
                }
            }
        }

        if let Err(e) = self
            .backend
            .remove_heartbeat(&self.config.namespace, &self.config.instance_id)
            .await
        {
            tracing::error!(
                instance_id = %self.config.instance_id,
                error = %e,
                "Failed to remove heartbeat on shutdown"
            );
        }

        tracing::debug!(instance_id = %self.config.instance_id, "Heartbeater stopped");
    }

    /// Send a single heartbeat.
    pub async fn send_heartbeat(&self) -> Result<()> {
        let at = unix_now();
        self.backend
            .heartbeat(
                &self.config.namespace,
                &self.config.instance_id,
                at,
                self.config.heartbeat_ttl,
            )
            .await?;

        tracing::debug!(
            instance_id = %self.config.instance_id,
            heartbeat_at = at,
            "Heartbeat sent"
        );

        Ok(())
    }
}

/// Generate a unique instance ID.
///
/// Host and pid make the id readable in dashboards; the random suffix keeps
/// restarted processes with a recycled pid distinct.
pub fn generate_instance_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, pid, &suffix[..16])
}

/// Current Unix time in fractional seconds.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Seconds elapsed since the Unix timestamp `since`, never negative.
pub fn seconds_since(since: f64) -> f64 {
    (unix_now() - since).max(0.0)
}
