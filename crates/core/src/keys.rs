//! Store key management with namespace support.
//!
//! Layout, all under one namespace prefix:
//!
//! | key                           | value                          |
//! |-------------------------------|--------------------------------|
//! | `<ns>:instance:<instance_id>` | heartbeat timestamp, with TTL  |
//! | `<ns>:jobs:<instance_id>`     | set of tracked job ids         |
//! | `<ns>:job:<jid>`              | JSON job payload               |
//! | `<ns>:recovery_lock`          | holder instance id, with TTL   |

/// Builds store keys for one namespace.
#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    /// Create a new Keys instance with the given namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Get the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Liveness marker of an instance (STRING with TTL).
    pub fn instance(&self, instance_id: &str) -> String {
        format!("{}{}", self.instance_prefix(), instance_id)
    }

    /// Prefix shared by every liveness marker.
    pub fn instance_prefix(&self) -> String {
        format!("{}:instance:", self.namespace)
    }

    /// Glob pattern matching every liveness marker.
    pub fn instance_pattern(&self) -> String {
        format!("{}*", self.instance_prefix())
    }

    /// Set of job ids tracked by an instance (SET).
    pub fn jobs(&self, instance_id: &str) -> String {
        format!("{}{}", self.jobs_prefix(), instance_id)
    }

    /// Prefix shared by every tracking set.
    pub fn jobs_prefix(&self) -> String {
        format!("{}:jobs:", self.namespace)
    }

    /// Glob pattern matching every tracking set.
    pub fn jobs_pattern(&self) -> String {
        format!("{}*", self.jobs_prefix())
    }

    /// Payload of a tracked job (STRING).
    pub fn job(&self, jid: &str) -> String {
        format!("{}:job:{}", self.namespace, jid)
    }

    /// Cluster-wide recovery lock (STRING with TTL).
    pub fn recovery_lock(&self) -> String {
        format!("{}:recovery_lock", self.namespace)
    }

    /// Extract the instance id from a liveness marker key.
    pub fn instance_id_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.instance_prefix())
            .filter(|id| !id.is_empty())
    }

    /// Extract the owning instance id from a tracking set key.
    pub fn owner_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.jobs_prefix())
            .filter(|id| !id.is_empty())
    }
}
