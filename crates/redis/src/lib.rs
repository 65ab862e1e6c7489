//! Redis backend for assured.
//!
//! Provides the Redis-based store for liveness markers, tracking entries and
//! the recovery lock, plus a Sidekiq-compatible enqueuer and a
//! sidekiq-unique-jobs lock cleaner for resubmitting orphans.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use assured_core::{AssuredConfig, AssuredJobs};
//! use assured_redis::{RedisBackend, RedisEnqueuer};
//!
//! #[tokio::main]
//! async fn main() -> assured_core::Result<()> {
//!     let backend = RedisBackend::new("redis://localhost").await?;
//!     let enqueuer = RedisEnqueuer::with_connection(backend.connection());
//!     let mut assured = AssuredJobs::builder()
//!         .config(AssuredConfig::from_env()?)
//!         .backend(backend)
//!         .enqueuer(enqueuer)
//!         .build()?;
//!     assured.start().await?;
//!     Ok(())
//! }
//! ```

use assured_core::{AssuredError, Backend, Enqueuer, JobPayload, Keys, Result, UniqueLocks};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Batch size hint for SCAN.
const SCAN_COUNT: usize = 500;

/// Redis store for crash-recovery state.
///
/// Holds no namespace of its own; every call names one, so several
/// deployments can share a connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let conn = connect(redis_url).await?;
        Ok(Self { conn })
    }

    /// Create a backend over an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// The underlying connection manager, for sharing with an enqueuer.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// All keys matching `pattern`, collected with SCAN.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| AssuredError::Backend(e.to_string()))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client =
        redis::Client::open(redis_url).map_err(|e| AssuredError::Backend(e.to_string()))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| AssuredError::Backend(e.to_string()))
}

/// Millisecond TTL for `PX`, at least 1.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Backend for RedisBackend {
    // ========== Liveness ==========

    async fn heartbeat(&self, ns: &str, instance_id: &str, at: f64, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(Keys::new(ns).instance(instance_id))
            .arg(at.to_string())
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove_heartbeat(&self, ns: &str, instance_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Keys::new(ns).instance(instance_id))
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn last_heartbeat(&self, ns: &str, instance_id: &str) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(Keys::new(ns).instance(instance_id))
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    async fn live_instances(&self, ns: &str) -> Result<Vec<String>> {
        let keys = Keys::new(ns);
        let markers = self.scan_keys(&keys.instance_pattern()).await?;
        Ok(markers
            .iter()
            .filter_map(|k| keys.instance_id_of(k))
            .map(String::from)
            .collect())
    }

    // ========== Tracking ==========

    async fn track_job(&self, ns: &str, instance_id: &str, jid: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys = Keys::new(ns);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(keys.jobs(instance_id), jid)
            .set(keys.job(jid), payload);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn untrack_job(&self, ns: &str, instance_id: &str, jid: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys = Keys::new(ns);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(keys.jobs(instance_id), jid)
            .del(keys.job(jid));

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn claim_job(&self, ns: &str, instance_id: &str, jid: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let keys = Keys::new(ns);

        // Payload is deleted only by the caller whose SREM removed the member.
        let script = redis::Script::new(
            r#"
            if redis.call('SREM', KEYS[1], ARGV[1]) == 1 then
                redis.call('DEL', KEYS[2])
                return 1
            end
            return 0
            "#,
        );

        let claimed: i32 = script
            .key(keys.jobs(instance_id))
            .key(keys.job(jid))
            .arg(jid)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;

        Ok(claimed == 1)
    }

    async fn tracking_owners(&self, ns: &str) -> Result<Vec<String>> {
        let keys = Keys::new(ns);
        let sets = self.scan_keys(&keys.jobs_pattern()).await?;
        Ok(sets
            .iter()
            .filter_map(|k| keys.owner_of(k))
            .map(String::from)
            .collect())
    }

    async fn tracked_jobs(&self, ns: &str, instance_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut jids: Vec<String> = conn
            .smembers(Keys::new(ns).jobs(instance_id))
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        jids.sort();
        Ok(jids)
    }

    async fn tracked_count(&self, ns: &str, instance_id: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.scard(Keys::new(ns).jobs(instance_id))
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))
    }

    async fn is_tracked_by(&self, ns: &str, instance_id: &str, jid: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(Keys::new(ns).jobs(instance_id), jid)
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))
    }

    async fn job_payload(&self, ns: &str, jid: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(Keys::new(ns).job(jid))
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))
    }

    async fn remove_tracking_set(&self, ns: &str, instance_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Keys::new(ns).jobs(instance_id))
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        Ok(())
    }

    // ========== Recovery lock ==========

    async fn try_acquire_recovery_lock(&self, ns: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // Nil reply means the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(Keys::new(ns).recovery_lock())
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn release_recovery_lock(&self, ns: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Keys::new(ns).recovery_lock())
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn recovery_lock_holder(&self, ns: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(Keys::new(ns).recovery_lock())
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))
    }
}

/// Pushes payloads onto Sidekiq-layout queues.
///
/// `SADD queues <queue>` and `LPUSH queue:<queue> <payload>` in one
/// transaction, with an optional key prefix for namespaced deployments.
#[derive(Clone)]
pub struct RedisEnqueuer {
    conn: ConnectionManager,
    prefix: Option<String>,
}

impl RedisEnqueuer {
    /// Connect to Redis.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let conn = connect(redis_url).await?;
        Ok(Self::with_connection(conn))
    }

    /// Create an enqueuer over an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn, prefix: None }
    }

    /// Prefix queue keys with `prefix:`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Key of the set listing known queues.
    pub fn queues_key(&self) -> String {
        self.prefixed("queues")
    }

    /// Key of the list backing `queue`.
    pub fn queue_key(&self, queue: &str) -> String {
        self.prefixed(&format!("queue:{}", queue))
    }

    fn prefixed(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl Enqueuer for RedisEnqueuer {
    async fn enqueue(&self, job: &JobPayload, raw: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(self.queues_key(), &job.queue)
            .lpush(self.queue_key(&job.queue), raw);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| AssuredError::Enqueue(e.to_string()))?;

        tracing::debug!(jid = %job.jid, queue = %job.queue, "Pushed job onto queue");
        Ok(())
    }
}

/// Clears sidekiq-unique-jobs locks by digest.
#[derive(Clone)]
pub struct RedisUniqueLocks {
    conn: ConnectionManager,
}

/// Sorted set of active digests.
const DIGESTS_KEY: &str = "uniquejobs:digests";
/// Sorted set of digests with an expiry.
const EXPIRING_DIGESTS_KEY: &str = "uniquejobs:expiring_digests";
/// Suffixes of the per-digest lock keys.
const LOCK_SUFFIXES: [&str; 4] = ["QUEUED", "PRIMED", "LOCKED", "INFO"];

impl RedisUniqueLocks {
    /// Create a lock cleaner over an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Every key making up the lock for `digest`.
    pub fn lock_keys(digest: &str) -> Vec<String> {
        std::iter::once(digest.to_string())
            .chain(LOCK_SUFFIXES.iter().map(|s| format!("{}:{}", digest, s)))
            .collect()
    }
}

#[async_trait]
impl UniqueLocks for RedisUniqueLocks {
    async fn clear(&self, digest: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(DIGESTS_KEY, digest)
            .zrem(EXPIRING_DIGESTS_KEY, digest)
            .del(Self::lock_keys(digest));

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| AssuredError::Backend(e.to_string()))?;
        Ok(())
    }
}


// ========== Integration Tests (require Redis) ==========

#[cfg(test)]
mod integration_tests {
    use super::*;
    use assured_core::{AssuredConfig, MemoryQueue, Recovery, SweepOutcome};
    use std::sync::Arc;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn test_namespace() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("assured_test_{}", ts)
    }

    async fn backend() -> RedisBackend {
        RedisBackend::new(&redis_url())
            .await
            .expect("Failed to connect to Redis")
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_heartbeat_and_expiry() {
        let backend = backend().await;
        let ns = test_namespace();

        backend
            .heartbeat(&ns, "a", 1_700_000_000.25, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(backend.live_instances(&ns).await.unwrap(), vec!["a"]);
        assert_eq!(
            backend.last_heartbeat(&ns, "a").await.unwrap(),
            Some(1_700_000_000.25)
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(backend.live_instances(&ns).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_track_and_untrack() {
        let backend = backend().await;
        let ns = test_namespace();

        backend.track_job(&ns, "a", "j1", "{}").await.unwrap();
        backend.track_job(&ns, "a", "j2", "{}").await.unwrap();

        assert_eq!(backend.tracking_owners(&ns).await.unwrap(), vec!["a"]);
        assert_eq!(backend.tracked_jobs(&ns, "a").await.unwrap(), vec!["j1", "j2"]);
        assert_eq!(backend.tracked_count(&ns, "a").await.unwrap(), 2);
        assert!(backend.is_tracked_by(&ns, "a", "j1").await.unwrap());
        assert_eq!(backend.job_payload(&ns, "j1").await.unwrap().as_deref(), Some("{}"));

        backend.untrack_job(&ns, "a", "j1").await.unwrap();
        backend.untrack_job(&ns, "a", "j2").await.unwrap();

        assert!(backend.tracking_owners(&ns).await.unwrap().is_empty());
        assert!(backend.job_payload(&ns, "j1").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_claim_job_succeeds_once() {
        let backend = backend().await;
        let ns = test_namespace();

        backend.track_job(&ns, "a", "j1", "{}").await.unwrap();

        assert!(backend.claim_job(&ns, "a", "j1").await.unwrap());
        assert!(!backend.claim_job(&ns, "a", "j1").await.unwrap());
        assert!(backend.job_payload(&ns, "j1").await.unwrap().is_none());

        backend.track_job(&ns, "b", "j1", "{}").await.unwrap();
        assert!(!backend.claim_job(&ns, "a", "j1").await.unwrap());
        assert!(backend.job_payload(&ns, "j1").await.unwrap().is_some());

        backend.untrack_job(&ns, "b", "j1").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_recovery_lock_is_exclusive() {
        let backend = backend().await;
        let ns = test_namespace();
        let ttl = Duration::from_secs(30);

        assert!(backend.try_acquire_recovery_lock(&ns, "b", ttl).await.unwrap());
        assert!(!backend.try_acquire_recovery_lock(&ns, "c", ttl).await.unwrap());
        assert_eq!(
            backend.recovery_lock_holder(&ns).await.unwrap().as_deref(),
            Some("b")
        );

        backend.release_recovery_lock(&ns).await.unwrap();
        assert!(backend.recovery_lock_holder(&ns).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_concurrent_sweeps_resubmit_once() {
        let backend = backend().await;
        let ns = test_namespace();
        let queue = MemoryQueue::new();

        for i in 0..20 {
            let jid = format!("j{}", i);
            let raw = JobPayload::new("W", jid.as_str()).to_json().unwrap();
            backend.track_job(&ns, "dead", &jid, &raw).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..5 {
            let config = AssuredConfig::builder()
                .instance_id(format!("live-{}", i))
                .namespace(ns.clone())
                .build()
                .unwrap();
            let recovery = Recovery::new(backend.clone(), Arc::new(config), Arc::new(queue.clone()));
            handles.push(tokio::spawn(async move { recovery.sweep().await.unwrap() }));
        }

        let mut resubmitted = 0;
        for handle in handles {
            if let SweepOutcome::Completed(report) = handle.await.unwrap() {
                resubmitted += report.resubmitted;
            }
        }

        assert_eq!(resubmitted, 20);
        assert_eq!(queue.len(), 20);
        assert!(backend.tracking_owners(&ns).await.unwrap().is_empty());
        assert!(backend.recovery_lock_holder(&ns).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_enqueuer_uses_sidekiq_layout() {
        let backend = backend().await;
        let ns = test_namespace();
        let enqueuer = RedisEnqueuer::with_connection(backend.connection()).prefix(ns.clone());
        let raw = r#"{"jid":"abc","class":"HardWorker","queue":"critical","unique_digest":null}"#;
        let job = JobPayload::from_json(raw).unwrap();

        enqueuer.enqueue(&job, raw).await.unwrap();

        let mut conn = backend.connection();
        let queues: Vec<String> = conn.smembers(enqueuer.queues_key()).await.unwrap();
        assert_eq!(queues, vec!["critical"]);
        let pushed: Vec<String> = conn.lrange(enqueuer.queue_key("critical"), 0, -1).await.unwrap();
        assert_eq!(pushed, vec![raw]);

        conn.del::<_, ()>(vec![enqueuer.queues_key(), enqueuer.queue_key("critical")])
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_unique_locks_cleared() {
        let backend = backend().await;
        let digest = format!("uniquejobs:{}", test_namespace());
        let mut conn = backend.connection();

        conn.set::<_, _, ()>(format!("{}:LOCKED", digest), "1").await.unwrap();
        conn.zadd::<_, _, _, ()>(DIGESTS_KEY, &digest, 1.0).await.unwrap();

        RedisUniqueLocks::with_connection(backend.connection())
            .clear(&digest)
            .await
            .unwrap();

        let locked: bool = conn.exists(format!("{}:LOCKED", digest)).await.unwrap();
        assert!(!locked);
        let score: Option<f64> = conn.zscore(DIGESTS_KEY, &digest).await.unwrap();
        assert!(score.is_none());
    }
}
