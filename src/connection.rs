//! Connection identity.
//!
//! A connection names one process's view of the store. Unacked lists and
//! consumer registries are scoped by connection name, so several processes
//! can consume the same queue without sharing in-flight work. Heartbeats
//! and cleanup of dead connections belong to a separate service.

use crate::config::Config;
use crate::config::secrets::ExposeSecret;
use crate::error::Result;
use crate::keys::Keys;
use crate::queue::Queue;
use crate::store::{RedisStore, Store};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// `<tag>-<6 random characters>`, used for connection and consumer names.
pub(crate) fn unique_name(tag: &str) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("{tag}-{}", &token[..6])
}

/// A named connection to the store.
#[derive(Clone)]
pub struct Connection {
    name: String,
    keys: Keys,
    store: Arc<dyn Store>,
}

impl Connection {
    /// Open a connection under the default namespace.
    pub fn new(tag: &str, store: Arc<dyn Store>) -> Self {
        Self::with_keys(tag, Keys::default(), store)
    }

    pub fn with_keys(tag: &str, keys: Keys, store: Arc<dyn Store>) -> Self {
        let name = unique_name(tag);
        info!(connection = %name, namespace = keys.namespace(), "opened connection");
        Self { name, keys, store }
    }

    /// Attach to an existing connection by its full name, e.g. to inspect or
    /// return the unacked deliveries a stopped worker left behind.
    pub fn with_name(name: &str, keys: Keys, store: Arc<dyn Store>) -> Self {
        info!(connection = %name, namespace = keys.namespace(), "attached to connection");
        Self {
            name: name.to_string(),
            keys,
            store,
        }
    }

    /// Connect to the Redis server named by `config`.
    pub async fn connect(tag: &str, config: &Config) -> Result<Self> {
        let store = RedisStore::connect(config.redis_url.expose_secret()).await?;
        Ok(Self::with_keys(
            tag,
            Keys::new(config.namespace.clone()),
            Arc::new(store),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Register `name` as an open queue and return a handle scoped to this
    /// connection.
    pub async fn open_queue(&self, name: &str) -> Result<Queue> {
        self.store.sadd(&self.keys.queues(), name).await?;
        Ok(Queue::new(
            name,
            &self.name,
            self.keys.for_queue(&self.name, name),
            Arc::clone(&self.store),
        ))
    }

    /// Names of every open queue in the namespace.
    pub async fn open_queues(&self) -> Result<Vec<String>> {
        self.store.smembers(&self.keys.queues()).await
    }

    /// Names of the queues this connection has started consuming.
    pub async fn consumed_queues(&self) -> Result<Vec<String>> {
        self.store
            .smembers(&self.keys.connection_queues(&self.name))
            .await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("namespace", &self.keys.namespace())
            .finish()
    }
}
