//! Job payloads and worker options.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Queue used when a payload does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// The serialized description of a job, as handed over by the job runtime.
///
/// Fields this library does not interpret are kept in `extra`. Recovery
/// resubmits the tracked string itself, not a re-serialization of this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Worker class identity.
    pub class: String,
    /// Positional job arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Job id assigned by the runtime.
    pub jid: String,
    /// Queue the job was pulled from.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Digest of an external uniqueness lock held for this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_digest: Option<String>,
    /// Any other runtime metadata (retry counts, timestamps, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

impl JobPayload {
    /// Create a payload with no arguments on the default queue.
    pub fn new(class: impl Into<String>, jid: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args: Vec::new(),
            jid: jid.into(),
            queue: default_queue(),
            unique_digest: None,
            extra: Map::new(),
        }
    }

    /// Set the arguments.
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Set the queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the uniqueness digest.
    pub fn unique_digest(mut self, digest: impl Into<String>) -> Self {
        self.unique_digest = Some(digest.into());
        self
    }

    /// Serialize the payload to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a payload from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Options a worker class declares when it is registered with the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Track executions so they are resubmitted if this process dies.
    pub assured: bool,
}

impl WorkerOptions {
    /// Options for a worker that opts into tracking.
    pub fn assured() -> Self {
        Self { assured: true }
    }
}

/// A worker class as seen by the tracking middleware.
pub trait Worker {
    /// Options declared for this worker class.
    fn options(&self) -> WorkerOptions;
}

impl Worker for WorkerOptions {
    fn options(&self) -> WorkerOptions {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_minimal_fields() {
        let job = JobPayload::from_json(r#"{"class":"W","args":[],"jid":"jid-1","queue":"default"}"#)
            .unwrap();
        assert_eq!(job, JobPayload::new("W", "jid-1"));
        assert!(job.unique_digest.is_none());
        assert!(job.extra.is_empty());
    }

    #[test]
    fn test_payload_defaults_when_missing() {
        let job = JobPayload::from_json(r#"{"class":"W","jid":"jid-1"}"#).unwrap();
        assert_eq!(job.queue, "default");
        assert!(job.args.is_empty());
    }

    #[test]
    fn test_payload_preserves_unknown_fields() {
        let raw = json!({
            "class": "HardWorker",
            "args": [1, "two"],
            "jid": "abc",
            "queue": "critical",
            "unique_digest": "uniquejobs:123",
            "retry": 5,
            "enqueued_at": 1_700_000_000.25
        });

        let job: JobPayload = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(job.unique_digest.as_deref(), Some("uniquejobs:123"));
        assert_eq!(job.extra.get("retry"), Some(&json!(5)));

        let back = serde_json::to_value(&job).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_payload_missing_jid_is_rejected() {
        assert!(JobPayload::from_json(r#"{"class":"W"}"#).is_err());
    }

    #[test]
    fn test_worker_options() {
        assert!(!WorkerOptions::default().options().assured);
        assert!(WorkerOptions::assured().options().assured);
    }
}
