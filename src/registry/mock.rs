//! In-memory [`Registry`] used by unit and integration tests, mirroring the
//! shape of [`crate::transport::mock::MockTransport`]: no network I/O, a
//! shared bus so multiple registry handles in one test observe the same
//! state.

use super::{Node, Registry, WatchEvent};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct MockRegistry {
    nodes: DashMap<String, Node>,
    kv: DashMap<String, Vec<u8>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MockRegistry {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self { nodes: DashMap::new(), kv: DashMap::new(), events })
    }
}

impl Default for MockRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self { nodes: DashMap::new(), kv: DashMap::new(), events }
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn register(&self, node: &Node, _ttl: Duration) -> Result<()> {
        self.nodes.insert(node.id.clone(), node.clone());
        let _ = self.events.send(WatchEvent::Put(node.clone()));
        Ok(())
    }

    async fn deregister(&self, service: &str, node_id: &str) -> Result<()> {
        self.nodes.remove(node_id);
        let _ = self.events.send(WatchEvent::Deleted {
            service: service.to_string(),
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    async fn list(&self, service: &str) -> Result<Vec<Node>> {
        Ok(self
            .nodes
            .iter()
            .filter(|e| e.value().service == service)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn watch(&self) -> Result<BoxStream<'static, WatchEvent>> {
        let rx = self.events.subscribe();
        Ok(stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((event, rx)),
                Err(broadcast::error::RecvError::Closed) => None,
                Err(broadcast::error::RecvError::Lagged(_)) => Some((
                    WatchEvent::Deleted { service: String::new(), node_id: String::new() },
                    rx,
                )),
            }
        })
        .boxed())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.kv.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_list_finds_node() {
        let registry = MockRegistry::new();
        let node = Node::new("auth", "i-1", "1.0.0", "127.0.0.1", 4100);
        registry.register(&node, Duration::from_secs(30)).await.unwrap();
        let nodes = registry.list("auth").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "auth@i-1");
    }

    #[tokio::test]
    async fn deregister_removes_node() {
        let registry = MockRegistry::new();
        let node = Node::new("auth", "i-1", "1.0.0", "127.0.0.1", 4100);
        registry.register(&node, Duration::from_secs(30)).await.unwrap();
        registry.deregister("auth", "auth@i-1").await.unwrap();
        assert!(registry.list("auth").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watch_observes_registration() {
        let registry = MockRegistry::new();
        let mut events = registry.watch().await.unwrap();
        let node = Node::new("auth", "i-1", "1.0.0", "127.0.0.1", 4100);
        registry.register(&node, Duration::from_secs(30)).await.unwrap();
        match events.next().await {
            Some(WatchEvent::Put(n)) => assert_eq!(n.id, "auth@i-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn config_put_then_get_round_trips() {
        let registry = MockRegistry::new();
        registry.put("config/dev/server", b"{}".to_vec()).await.unwrap();
        assert_eq!(registry.get("config/dev/server").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(registry.get("config/dev/missing").await.unwrap(), None);
    }
}
