//! Store key layout.
//!
//! Every key lives under a namespace (`rmq` by default). Queue names are
//! bracketed so a queue called `a::b` cannot collide with another key.

/// Key builder for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    namespace: String,
}

/// The keys one queue instance touches, scoped to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Set of all open queue names.
    pub queues: String,
    /// Set of queues consumed on this connection.
    pub connection_queues: String,
    /// Set of consumer names on this connection for this queue.
    pub consumers: String,
    /// List of payloads waiting for a consumer. Right end is the oldest.
    pub ready: String,
    /// List of rejected payloads.
    pub rejected: String,
    /// Sorted set of scheduled payloads, scored by due unix time.
    pub delayed: String,
    /// List of payloads checked out by this connection.
    pub unacked: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn queues(&self) -> String {
        format!("{}::queues", self.namespace)
    }

    pub fn ready(&self, queue: &str) -> String {
        format!("{}::queue::[{queue}]::ready", self.namespace)
    }

    pub fn rejected(&self, queue: &str) -> String {
        format!("{}::queue::[{queue}]::rejected", self.namespace)
    }

    pub fn delayed(&self, queue: &str) -> String {
        format!("{}::queue::[{queue}]::delayed", self.namespace)
    }

    pub fn unacked(&self, connection: &str, queue: &str) -> String {
        format!(
            "{}::connection::{connection}::queue::[{queue}]::unacked",
            self.namespace
        )
    }

    pub fn consumers(&self, connection: &str, queue: &str) -> String {
        format!(
            "{}::connection::{connection}::queue::[{queue}]::consumers",
            self.namespace
        )
    }

    pub fn connection_queues(&self, connection: &str) -> String {
        format!("{}::connection::{connection}::queues", self.namespace)
    }

    /// All keys for `queue` as consumed by `connection`.
    pub fn for_queue(&self, connection: &str, queue: &str) -> QueueKeys {
        QueueKeys {
            queues: self.queues(),
            connection_queues: self.connection_queues(connection),
            consumers: self.consumers(connection, queue),
            ready: self.ready(queue),
            rejected: self.rejected(queue),
            delayed: self.delayed(queue),
            unacked: self.unacked(connection, queue),
        }
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_NAMESPACE)
    }
}
