//! # assured-core - Crash recovery for background-job workers
//!
//! A worker process that dies mid-job normally loses that job. This crate
//! keeps enough state in a shared store for the surviving fleet to notice and
//! resubmit it:
//! - `Heartbeater` keeps a TTL-bound liveness marker per instance
//! - `TrackingMiddleware` records in-flight jobs of opted-in workers
//! - `Recovery` resubmits jobs tracked by instances without a marker, under a
//!   cluster-wide lock
//! - `RecoveryScheduler` runs recovery at startup and a few times after
//! - `AssuredJobs` wires all of the above into a runtime's lifecycle
//!
//! Storage is behind the `Backend` trait; `MemoryBackend` is an in-process
//! implementation used for tests, `assured-redis` provides the real one.

mod backend;
mod config;
mod enqueue;
mod error;
mod heartbeat;
mod job;
mod keys;
mod memory;
mod middleware;
mod recovery;
mod scheduler;
mod tracker;

// Re-export main types
pub use backend::{Backend, DynBackend, SharedBackend};
pub use config::{
    AssuredConfig, AssuredConfigBuilder, DEFAULT_NAMESPACE, ENV_DELAYED_RECOVERY_COUNT,
    ENV_DELAYED_RECOVERY_INTERVAL, ENV_HEARTBEAT_INTERVAL, ENV_HEARTBEAT_TTL, ENV_INSTANCE_ID,
    ENV_NAMESPACE, ENV_RECOVERY_LOCK_TTL, ENV_STARTUP_DELAY,
};
pub use enqueue::{clear_unique_lock, Enqueuer, NoUniqueLocks, UniqueLocks};
pub use error::{AssuredError, Result};
pub use heartbeat::{generate_instance_id, seconds_since, unix_now, Heartbeater};
pub use job::{JobPayload, Worker, WorkerOptions, DEFAULT_QUEUE};
pub use keys::Keys;
pub use memory::{MemoryBackend, MemoryQueue};
pub use middleware::TrackingMiddleware;
pub use recovery::{Recovery, SweepOutcome, SweepReport};
pub use scheduler::RecoveryScheduler;
pub use tracker::{AssuredJobs, AssuredJobsBuilder, ShutdownReport};

