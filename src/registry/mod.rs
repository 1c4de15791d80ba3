//! Service directory: the KV-backed collaborator nodes register themselves
//! into and discover peers from.
//!
//! Grounded in the original registrar's four-operation shape
//! (`register`/`deregister`/`list`/`watch`) and in this crate's NATS
//! transport layer's connection-resilience style (`transport::nats`):
//! [`NatsKvRegistry`] is the default production implementation, backed by a
//! JetStream key-value bucket rather than a separate Consul-like service,
//! since the teacher crate's dependency stack already carries `async-nats`
//! and JetStream KV gives the same register/list/watch/TTL shape without a
//! second broker dependency (see DESIGN.md).

pub mod mock;
#[cfg(feature = "nats")]
pub mod nats_kv;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A running module instance as registered in the service directory.
///
/// `id` has the canonical form `<moduleType>@<instanceId>` and is globally
/// unique across the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub service: String,
    pub version: String,
    pub address: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(
        module_type: impl Into<String>,
        instance_id: impl Into<String>,
        version: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        let service = module_type.into();
        let instance_id = instance_id.into();
        Self {
            id: format!("{service}@{instance_id}"),
            service,
            version: version.into(),
            address: address.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The instance id half of `<moduleType>@<instanceId>`.
    pub fn instance_id(&self) -> &str {
        self.id.split_once('@').map(|(_, rest)| rest).unwrap_or(&self.id)
    }

    /// The reply-to transport address carried in metadata, if the
    /// registering node recorded one (most transports' node id doubles as
    /// their reply inbox, but an explicit override is honored first).
    pub fn reply_to(&self) -> &str {
        self.metadata.get("reply_to").map(String::as_str).unwrap_or(&self.id)
    }
}

/// The set of nodes sharing a module type and version, as returned by
/// [`Registry::list`].
#[derive(Debug, Clone, Default)]
pub struct Service {
    pub name: String,
    pub nodes: Vec<Node>,
}

/// A change observed by [`Registry::watch`]: a node joined, refreshed its
/// lease, or was evicted (lease lapsed or explicit deregistration).
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(Node),
    Deleted { service: String, node_id: String },
}

/// KV service-directory collaborator. Implementors only need to move node
/// records and config documents; the [`crate::selector::Selector`] layers
/// caching and strategy on top, and [`crate::config`] layers the startup
/// configuration document on top of [`Registry::get`]/[`Registry::put`].
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register `node`, refreshed by the caller every `ttl / 2` per the
    /// lease-renewal contract; a node whose lease lapses is evicted.
    async fn register(&self, node: &Node, ttl: Duration) -> Result<()>;

    async fn deregister(&self, service: &str, node_id: &str) -> Result<()>;

    /// List current nodes for `service`. Returns an empty vec, not an error,
    /// when the service has no registered nodes.
    async fn list(&self, service: &str) -> Result<Vec<Node>>;

    /// Stream of registry changes across all services, used by the selector
    /// to invalidate its cache and by the application shell to evict
    /// server-sessions.
    async fn watch(&self) -> Result<BoxStream<'static, WatchEvent>>;

    /// Fetch an arbitrary config document stored at `key` (e.g.
    /// `config/<processEnv>/server`).
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

pub type SharedRegistry = std::sync::Arc<dyn Registry>;
