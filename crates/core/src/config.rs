//! Configuration for heartbeats, tracking and recovery.
//!
//! An [`AssuredConfig`] is built once at startup, either through the builder
//! or from `ASSURED_JOBS_*` environment variables, and then shared read-only
//! (usually as `Arc<AssuredConfig>`) by every component.

use std::time::Duration;

use crate::error::{AssuredError, Result};
use crate::heartbeat::generate_instance_id;

/// Environment variable holding an externally assigned instance id.
pub const ENV_INSTANCE_ID: &str = "ASSURED_JOBS_INSTANCE_ID";
/// Environment variable holding the key namespace.
pub const ENV_NAMESPACE: &str = "ASSURED_JOBS_NS";
/// Environment variable holding the heartbeat interval in seconds.
pub const ENV_HEARTBEAT_INTERVAL: &str = "ASSURED_JOBS_HEARTBEAT_INTERVAL";
/// Environment variable holding the heartbeat TTL in seconds.
pub const ENV_HEARTBEAT_TTL: &str = "ASSURED_JOBS_HEARTBEAT_TTL";
/// Environment variable holding the recovery lock TTL in seconds.
pub const ENV_RECOVERY_LOCK_TTL: &str = "ASSURED_JOBS_RECOVERY_LOCK_TTL";
/// Environment variable holding the number of delayed recovery sweeps.
pub const ENV_DELAYED_RECOVERY_COUNT: &str = "ASSURED_JOBS_DELAYED_RECOVERY_COUNT";
/// Environment variable holding the delay between delayed sweeps in seconds.
pub const ENV_DELAYED_RECOVERY_INTERVAL: &str = "ASSURED_JOBS_DELAYED_RECOVERY_INTERVAL";
/// Environment variable holding the startup grace delay in seconds.
pub const ENV_STARTUP_DELAY: &str = "ASSURED_JOBS_STARTUP_DELAY";

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "assured_jobs";

/// Immutable process-wide configuration.
#[derive(Debug, Clone)]
pub struct AssuredConfig {
    /// Identifier of this process, stable for its lifetime.
    pub instance_id: String,
    /// Prefix for every key written to the shared store.
    pub namespace: String,
    /// Time between liveness marker refreshes.
    pub heartbeat_interval: Duration,
    /// Expiry of the liveness marker. Must exceed `heartbeat_interval`.
    pub heartbeat_ttl: Duration,
    /// Expiry of the recovery lock, bounding a crashed holder's staleness.
    pub recovery_lock_ttl: Duration,
    /// Number of extra sweeps after the startup sweep.
    pub delayed_recovery_count: u32,
    /// Delay before each extra sweep.
    pub delayed_recovery_interval: Duration,
    /// Grace delay before the startup sweep.
    pub startup_delay: Duration,
}

impl Default for AssuredConfig {
    fn default() -> Self {
        Self {
            instance_id: generate_instance_id(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_ttl: Duration::from_secs(45),
            recovery_lock_ttl: Duration::from_secs(300),
            delayed_recovery_count: 1,
            delayed_recovery_interval: Duration::from_secs(300),
            startup_delay: Duration::from_secs(5),
        }
    }
}

impl AssuredConfig {
    /// Create a new builder.
    pub fn builder() -> AssuredConfigBuilder {
        AssuredConfigBuilder::new()
    }

    /// Build a configuration from the process environment.
    ///
    /// Every variable is optional; unset variables fall back to the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(id) = lookup(ENV_INSTANCE_ID) {
            builder = builder.instance_id(id);
        }
        if let Some(ns) = lookup(ENV_NAMESPACE) {
            builder = builder.namespace(ns);
        }
        if let Some(secs) = parse_var(&lookup, ENV_HEARTBEAT_INTERVAL)? {
            builder = builder.heartbeat_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var(&lookup, ENV_HEARTBEAT_TTL)? {
            builder = builder.heartbeat_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var(&lookup, ENV_RECOVERY_LOCK_TTL)? {
            builder = builder.recovery_lock_ttl(Duration::from_secs(secs));
        }
        if let Some(count) = parse_var(&lookup, ENV_DELAYED_RECOVERY_COUNT)? {
            let count = u32::try_from(count).map_err(|_| {
                AssuredError::Config(format!("{} is out of range: {}", ENV_DELAYED_RECOVERY_COUNT, count))
            })?;
            builder = builder.delayed_recovery_count(count);
        }
        if let Some(secs) = parse_var(&lookup, ENV_DELAYED_RECOVERY_INTERVAL)? {
            builder = builder.delayed_recovery_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var(&lookup, ENV_STARTUP_DELAY)? {
            builder = builder.startup_delay(Duration::from_secs(secs));
        }

        builder.build()
    }

    /// Check the invariants every component relies on.
    ///
    /// Run by [`AssuredConfigBuilder::build`] and again before a host starts,
    /// since the fields can also be set directly.
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(AssuredError::Config("instance id must not be empty".to_string()));
        }
        if self.namespace.trim().is_empty() {
            return Err(AssuredError::Config("namespace must not be empty".to_string()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_ttl.is_zero() {
            return Err(AssuredError::Config(
                "heartbeat interval and TTL must be positive".to_string(),
            ));
        }
        if self.recovery_lock_ttl.is_zero() {
            return Err(AssuredError::Config("recovery lock TTL must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_var<F>(lookup: &F, name: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| AssuredError::Config(format!("{} must be an integer, got {:?}: {}", name, raw, e))),
    }
}

/// Builder for AssuredConfig.
#[derive(Debug, Default)]
pub struct AssuredConfigBuilder {
    instance_id: Option<String>,
    config: AssuredConfig,
}

impl AssuredConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an externally assigned instance id instead of a generated one.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat TTL.
    pub fn heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.config.heartbeat_ttl = ttl;
        self
    }

    /// Set the recovery lock TTL.
    pub fn recovery_lock_ttl(mut self, ttl: Duration) -> Self {
        self.config.recovery_lock_ttl = ttl;
        self
    }

    /// Set the number of delayed sweeps after the startup sweep.
    pub fn delayed_recovery_count(mut self, count: u32) -> Self {
        self.config.delayed_recovery_count = count;
        self
    }

    /// Set the delay between delayed sweeps.
    pub fn delayed_recovery_interval(mut self, interval: Duration) -> Self {
        self.config.delayed_recovery_interval = interval;
        self
    }

    /// Set the grace delay before the startup sweep.
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.config.startup_delay = delay;
        self
    }

    /// Build the AssuredConfig.
    pub fn build(self) -> Result<AssuredConfig> {
        let mut config = self.config;
        if let Some(id) = self.instance_id {
            config.instance_id = id;
        }

        config.validate()?;

        if config.heartbeat_interval >= config.heartbeat_ttl {
            tracing::warn!(
                heartbeat_interval = ?config.heartbeat_interval,
                heartbeat_ttl = ?config.heartbeat_ttl,
                "Heartbeat interval is not shorter than its TTL, live instances may be reported dead"
            );
        }

        Ok(config)
    }
}
