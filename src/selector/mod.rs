//! Strategy-driven node selection layered on the [`crate::registry`].
//!
//! Grounded in the original selector's read-through cache plus
//! pluggable-strategy shape: [`Selector`] caches `Registry::list` results
//! per service name behind a `RwLock` (matching the teacher's preference for
//! `tokio::sync::RwLock` over a raw mutex for read-heavy collaborators, see
//! `transport::nats`'s `CircuitBreaker` guard) and a background task fed by
//! `Registry::watch` invalidates entries and drives the eviction callback
//! the module runtime's server-session cache subscribes to.

use crate::error::{MeshError, Result};
use crate::registry::{Node, SharedRegistry, WatchEvent};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Node-selection strategy: how [`SelectOptions`] turns a filtered node list
/// into the single node a caller gets.
#[derive(Debug, Clone, Copy, Default)]
pub enum Strategy {
    /// Uniform-random pick. Matches the original selector's default.
    #[default]
    Random,
    /// Cycles through candidates in registration order.
    RoundRobin,
    /// Deterministic pick keyed by a caller-supplied hash key (e.g. a
    /// session id), so the same key always lands on the same node as long
    /// as the candidate set doesn't change.
    HashKey(u64),
}

/// Options narrowing a [`Selector::select`] call: an optional predicate over
/// candidate nodes, and the strategy used to pick among survivors.
#[derive(Default)]
pub struct SelectOptions {
    pub filter: Option<Arc<dyn Fn(&Node) -> bool + Send + Sync>>,
    pub strategy: Strategy,
}

impl SelectOptions {
    pub fn with_strategy(strategy: Strategy) -> Self {
        Self { filter: None, strategy }
    }

    pub fn with_filter(mut self, filter: impl Fn(&Node) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn apply_filter(&self, nodes: &[Node]) -> Vec<Node> {
        match &self.filter {
            Some(f) => nodes.iter().filter(|n| f(n)).cloned().collect(),
            None => nodes.to_vec(),
        }
    }
}

#[derive(Default)]
struct ServiceCache {
    nodes: Vec<Node>,
    round_robin_cursor: AtomicUsize,
}

/// Callback invoked when the selector's watcher observes a node eviction;
/// the application shell wires this to its server-session cache's `evict`.
pub type EvictionCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub struct Selector {
    registry: SharedRegistry,
    cache: RwLock<HashMap<String, Arc<ServiceCache>>>,
    eviction_callbacks: RwLock<Vec<EvictionCallback>>,
    watch_cancel: CancellationToken,
}

impl Selector {
    pub fn new(registry: SharedRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cache: RwLock::new(HashMap::new()),
            eviction_callbacks: RwLock::new(Vec::new()),
            watch_cancel: CancellationToken::new(),
        })
    }

    /// Register a callback fired on every node deletion the watcher
    /// observes. The application shell uses this to evict server-sessions.
    pub async fn on_node_removed(&self, callback: EvictionCallback) {
        self.eviction_callbacks.write().await.push(callback);
    }

    /// Spawn the background task that invalidates the cache and fires
    /// eviction callbacks as [`crate::registry::Registry::watch`] reports
    /// changes. Call once per selector; cancelled via [`Selector::stop`].
    pub fn spawn_watch(self: &Arc<Self>) {
        let selector = self.clone();
        tokio::spawn(async move {
            let Ok(mut events) = selector.registry.watch().await else {
                tracing::error!("selector watch subscription failed; cache will not self-invalidate");
                return;
            };
            loop {
                tokio::select! {
                    _ = selector.watch_cancel.cancelled() => break,
                    event = futures::StreamExt::next(&mut events) => {
                        let Some(event) = event else { break };
                        selector.handle_watch_event(event).await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.watch_cancel.cancel();
    }

    async fn handle_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put(node) => {
                self.cache.write().await.remove(&node.service);
            }
            WatchEvent::Deleted { service, node_id } => {
                self.cache.write().await.remove(&service);
                for cb in self.eviction_callbacks.read().await.iter() {
                    cb(&service, &node_id);
                }
            }
        }
    }

    /// Load `service`'s node list, consulting the cache first.
    async fn service_nodes(&self, service: &str) -> Result<Arc<ServiceCache>> {
        if let Some(cached) = self.cache.read().await.get(service) {
            return Ok(cached.clone());
        }
        let nodes = self.registry.list(service).await?;
        let entry = Arc::new(ServiceCache { nodes, round_robin_cursor: AtomicUsize::new(0) });
        self.cache.write().await.insert(service.to_string(), entry.clone());
        Ok(entry)
    }

    /// Select one node for `service` under `options`.
    pub async fn select(&self, service: &str, options: &SelectOptions) -> Result<Node> {
        let cached = self.service_nodes(service).await?;
        let candidates = options.apply_filter(&cached.nodes);
        if candidates.is_empty() {
            return Err(MeshError::server_not_found(service));
        }
        let node = match options.strategy {
            Strategy::Random => candidates
                .choose(&mut rand_thread())
                .cloned()
                .expect("non-empty candidates"),
            Strategy::RoundRobin => {
                let idx = cached.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[idx].clone()
            }
            Strategy::HashKey(key) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                key.hash(&mut hasher);
                let idx = (hasher.finish() as usize) % candidates.len();
                candidates[idx].clone()
            }
        };
        Ok(node)
    }

    /// All current nodes for `service`, unfiltered; used by broadcast-style
    /// callers (`get_by_type`) that want every node rather than one pick.
    pub async fn all(&self, service: &str) -> Result<Vec<Node>> {
        Ok(self.service_nodes(service).await?.nodes.clone())
    }
}

/// `rand`'s thread-local RNG, indirected so selection logic reads the same
/// regardless of which `rand` minor version supplies it.
fn rand_thread() -> impl rand::Rng {
    rand::thread_rng()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mock::MockRegistry;
    use std::time::Duration;

    #[tokio::test]
    async fn select_fails_with_no_nodes() {
        let registry = MockRegistry::new();
        let selector = Selector::new(registry);
        let err = selector.select("auth", &SelectOptions::default()).await.unwrap_err();
        assert!(matches!(err, MeshError::ServerNotFound(_)));
    }

    #[tokio::test]
    async fn select_returns_registered_node() {
        let registry = MockRegistry::new();
        let node = crate::registry::Node::new("auth", "i-1", "1.0.0", "127.0.0.1", 4100);
        registry.register(&node, Duration::from_secs(30)).await.unwrap();
        let selector = Selector::new(registry);
        let picked = selector.select("auth", &SelectOptions::default()).await.unwrap();
        assert_eq!(picked.id, "auth@i-1");
    }

    #[tokio::test]
    async fn round_robin_cycles_through_candidates() {
        let registry = MockRegistry::new();
        for i in 0..3 {
            let node = crate::registry::Node::new("auth", format!("i-{i}"), "1.0.0", "127.0.0.1", 4100 + i);
            registry.register(&node, Duration::from_secs(30)).await.unwrap();
        }
        let selector = Selector::new(registry);
        let opts = SelectOptions::with_strategy(Strategy::RoundRobin);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let node = selector.select("auth", &opts).await.unwrap();
            seen.insert(node.id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn filter_excludes_non_matching_nodes() {
        let registry = MockRegistry::new();
        let a = crate::registry::Node::new("auth", "i-1", "1.0.0", "127.0.0.1", 4100)
            .with_metadata("zone", "us");
        let b = crate::registry::Node::new("auth", "i-2", "1.0.0", "127.0.0.1", 4101)
            .with_metadata("zone", "eu");
        registry.register(&a, Duration::from_secs(30)).await.unwrap();
        registry.register(&b, Duration::from_secs(30)).await.unwrap();
        let selector = Selector::new(registry);
        let opts = SelectOptions::default().with_filter(|n| n.metadata.get("zone").map(String::as_str) == Some("eu"));
        let picked = selector.select("auth", &opts).await.unwrap();
        assert_eq!(picked.id, "auth@i-2");
    }

    #[tokio::test]
    async fn watch_eviction_clears_cache_and_fires_callback() {
        let registry = MockRegistry::new();
        let node = crate::registry::Node::new("auth", "i-1", "1.0.0", "127.0.0.1", 4100);
        registry.register(&node, Duration::from_secs(30)).await.unwrap();
        let selector = Selector::new(registry.clone());
        selector.spawn_watch();

        let evicted = Arc::new(std::sync::Mutex::new(None));
        let evicted2 = evicted.clone();
        selector
            .on_node_removed(Arc::new(move |service, node_id| {
                *evicted2.lock().unwrap() = Some((service.to_string(), node_id.to_string()));
            }))
            .await;

        // warm the cache
        selector.select("auth", &SelectOptions::default()).await.unwrap();
        registry.deregister("auth", "auth@i-1").await.unwrap();

        // give the watch task a turn
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *evicted.lock().unwrap(),
            Some(("auth".to_string(), "auth@i-1".to_string()))
        );
    }
}
