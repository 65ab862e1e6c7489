//! In-process backend and queue.
//!
//! [`MemoryBackend`] follows the same semantics as the Redis backend (key
//! expiry, sets that vanish when emptied, atomic conditional set) behind a
//! single mutex. Expiry uses `tokio::time::Instant`, so tests running with a
//! paused clock can advance past a TTL.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::Backend;
use crate::enqueue::Enqueuer;
use crate::error::{AssuredError, Result};
use crate::job::JobPayload;
use crate::keys::Keys;

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl State {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
    }

    fn get(&mut self, key: &str) -> Option<String> {
        self.purge_expired();
        self.strings.get(key).map(|entry| entry.value.clone())
    }

    fn set(&mut self, key: String, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.strings.insert(key, StringEntry { value, expires_at });
    }

    fn string_keys_with_prefix(&mut self, prefix: &str) -> Vec<String> {
        self.purge_expired();
        let mut keys: Vec<String> = self
            .strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
        }
        removed
    }
}

/// Backend keeping all state in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key currently present (expired keys excluded), sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut state = self.state();
        state.purge_expired();
        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.sets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn heartbeat(&self, ns: &str, instance_id: &str, at: f64, ttl: Duration) -> Result<()> {
        let key = Keys::new(ns).instance(instance_id);
        self.state().set(key, at.to_string(), Some(ttl));
        Ok(())
    }

    async fn remove_heartbeat(&self, ns: &str, instance_id: &str) -> Result<()> {
        let key = Keys::new(ns).instance(instance_id);
        self.state().strings.remove(&key);
        Ok(())
    }

    async fn last_heartbeat(&self, ns: &str, instance_id: &str) -> Result<Option<f64>> {
        let key = Keys::new(ns).instance(instance_id);
        Ok(self.state().get(&key).and_then(|v| v.parse().ok()))
    }

    async fn live_instances(&self, ns: &str) -> Result<Vec<String>> {
        let keys = Keys::new(ns);
        let markers = self.state().string_keys_with_prefix(&keys.instance_prefix());
        Ok(markers
            .iter()
            .filter_map(|k| keys.instance_id_of(k))
            .map(String::from)
            .collect())
    }

    async fn track_job(&self, ns: &str, instance_id: &str, jid: &str, payload: &str) -> Result<()> {
        let keys = Keys::new(ns);
        let mut state = self.state();
        state
            .sets
            .entry(keys.jobs(instance_id))
            .or_default()
            .insert(jid.to_string());
        state.set(keys.job(jid), payload.to_string(), None);
        Ok(())
    }

    async fn untrack_job(&self, ns: &str, instance_id: &str, jid: &str) -> Result<()> {
        let keys = Keys::new(ns);
        let mut state = self.state();
        state.srem(&keys.jobs(instance_id), jid);
        state.strings.remove(&keys.job(jid));
        Ok(())
    }

    async fn claim_job(&self, ns: &str, instance_id: &str, jid: &str) -> Result<bool> {
        let keys = Keys::new(ns);
        let mut state = self.state();
        if !state.srem(&keys.jobs(instance_id), jid) {
            return Ok(false);
        }
        state.strings.remove(&keys.job(jid));
        Ok(true)
    }

    async fn tracking_owners(&self, ns: &str) -> Result<Vec<String>> {
        let keys = Keys::new(ns);
        let state = self.state();
        let mut owners: Vec<String> = state
            .sets
            .keys()
            .filter_map(|k| keys.owner_of(k))
            .map(String::from)
            .collect();
        owners.sort();
        Ok(owners)
    }

    async fn tracked_jobs(&self, ns: &str, instance_id: &str) -> Result<Vec<String>> {
        let key = Keys::new(ns).jobs(instance_id);
        Ok(self
            .state()
            .sets
            .get(&key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn tracked_count(&self, ns: &str, instance_id: &str) -> Result<usize> {
        let key = Keys::new(ns).jobs(instance_id);
        Ok(self.state().sets.get(&key).map_or(0, BTreeSet::len))
    }

    async fn is_tracked_by(&self, ns: &str, instance_id: &str, jid: &str) -> Result<bool> {
        let key = Keys::new(ns).jobs(instance_id);
        Ok(self
            .state()
            .sets
            .get(&key)
            .is_some_and(|set| set.contains(jid)))
    }

    async fn job_payload(&self, ns: &str, jid: &str) -> Result<Option<String>> {
        let key = Keys::new(ns).job(jid);
        Ok(self.state().get(&key))
    }

    async fn remove_tracking_set(&self, ns: &str, instance_id: &str) -> Result<()> {
        let key = Keys::new(ns).jobs(instance_id);
        self.state().sets.remove(&key);
        Ok(())
    }

    async fn try_acquire_recovery_lock(&self, ns: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let key = Keys::new(ns).recovery_lock();
        let mut state = self.state();
        if state.get(&key).is_some() {
            return Ok(false);
        }
        state.set(key, holder.to_string(), Some(ttl));
        Ok(true)
    }

    async fn release_recovery_lock(&self, ns: &str) -> Result<()> {
        let key = Keys::new(ns).recovery_lock();
        self.state().strings.remove(&key);
        Ok(())
    }

    async fn recovery_lock_holder(&self, ns: &str) -> Result<Option<String>> {
        let key = Keys::new(ns).recovery_lock();
        Ok(self.state().get(&key))
    }
}

/// Enqueuer that records every submitted payload in memory.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    jobs: Arc<Mutex<Vec<(JobPayload, String)>>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads enqueued so far, oldest first.
    pub fn jobs(&self) -> Vec<JobPayload> {
        self.entries().into_iter().map(|(job, _)| job).collect()
    }

    /// Raw payloads enqueued so far, oldest first.
    pub fn raw_jobs(&self) -> Vec<String> {
        self.entries().into_iter().map(|(_, raw)| raw).collect()
    }

    /// Number of payloads enqueued so far.
    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn entries(&self) -> Vec<(JobPayload, String)> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether nothing has been enqueued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Enqueuer for MemoryQueue {
    async fn enqueue(&self, job: &JobPayload, raw: &str) -> Result<()> {
        if job.jid.is_empty() {
            return Err(AssuredError::Enqueue("job has no jid".to_string()));
        }
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((job.clone(), raw.to_string()));
        Ok(())
    }
}
