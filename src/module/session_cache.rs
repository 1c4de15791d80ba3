//! Server-session cache: a load-or-store map from node id to the handle a
//! caller uses to reach that node, keyed so concurrent first-access races
//! resolve to a single winner.
//!
//! Grounded in the original manager's `getServerSessionSafe` double-checked
//! lookup. Unlike the Go source's per-session network connection, this
//! crate's [`crate::transport::Transport`] is a shared pub/sub substrate, so
//! a [`ServerSession`] only bundles the target [`Node`] with the caller's
//! already-open [`RpcClient`]; there is nothing per-target to tear down, but
//! [`ServerSession::done`] is kept so eviction has the same shape the
//! original's session-close path had.

use crate::codec::Arg;
use crate::error::Result;
use crate::registry::Node;
use crate::rpc::context::RpcContext;
use crate::rpc::client::RpcClient;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// A resolved handle to a specific remote node, cached by node id.
pub struct ServerSession {
    node: Node,
    client: Arc<RpcClient>,
}

impl ServerSession {
    fn new(node: Node, client: Arc<RpcClient>) -> Self {
        Self { node, client }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub async fn call(&self, method: &str, args: Vec<Arg>, ctx: &RpcContext, timeout: Duration) -> Result<Arg> {
        self.client.call(self.node.reply_to(), method, args, ctx, timeout).await
    }

    pub async fn call_no_reply(&self, method: &str, args: Vec<Arg>, ctx: &RpcContext) -> Result<()> {
        self.client.call_no_reply(self.node.reply_to(), method, args, ctx).await
    }

    /// No-op on this transport; kept so eviction reads the same as the
    /// original's session-close call.
    pub async fn done(&self) {}
}

pub struct ServerSessionCache {
    client: Arc<RpcClient>,
    sessions: DashMap<String, Arc<ServerSession>>,
}

impl ServerSessionCache {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client, sessions: DashMap::new() }
    }

    /// Load the cached session for `node`, or create and store one. Races
    /// between concurrent first accesses resolve to a single winner via
    /// `DashMap::entry`; the loser's freshly-built session is simply dropped,
    /// never disposed, since it shares the cache's single `RpcClient` rather
    /// than owning a connection of its own.
    pub fn get_or_create(&self, node: &Node) -> Arc<ServerSession> {
        self.sessions
            .entry(node.id.clone())
            .or_insert_with(|| Arc::new(ServerSession::new(node.clone(), self.client.clone())))
            .clone()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<ServerSession>> {
        self.sessions.get(node_id).map(|e| e.clone())
    }

    /// Evict `node_id`'s session, e.g. on a watcher-observed deletion.
    pub async fn evict(&self, node_id: &str) {
        if let Some((_, session)) = self.sessions.remove(node_id) {
            session.done().await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockBus, MockTransport};
    use crate::transport::SharedTransport;

    fn cache() -> ServerSessionCache {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "caller"));
        ServerSessionCache::new(Arc::new(RpcClient::new(transport)))
    }

    #[test]
    fn get_or_create_returns_same_session_for_repeat_lookups() {
        let cache = cache();
        let node = Node::new("auth", "i-1", "1.0.0", "10.0.0.1", 4100);
        let a = cache.get_or_create(&node);
        let b = cache.get_or_create(&node);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evict_removes_session() {
        let cache = cache();
        let node = Node::new("auth", "i-1", "1.0.0", "10.0.0.1", 4100);
        cache.get_or_create(&node);
        cache.evict("auth@i-1").await;
        assert_eq!(cache.len(), 0);
        assert!(cache.get("auth@i-1").is_none());
    }
}
