//! `AppHandle`: the narrow discovery facade modules receive in their
//! lifecycle hooks instead of a reference to the application shell itself.
//!
//! Grounded in the original's package-level `app` accessors
//! (`GetServerById`/`GetServersByType`/`GetServerBySelector`/`GetRoute`);
//! this crate rejects the ambient-global version of that pattern (see
//! DESIGN.md) and instead threads an `Arc<AppHandle>` explicitly into every
//! hook that needs it.

use crate::codec::Arg;
use crate::error::{MeshError, Result};
use crate::module::session_cache::{ServerSession, ServerSessionCache};
use crate::registry::Node;
use crate::rpc::client::RpcClient;
use crate::rpc::context::RpcContext;
use crate::selector::{SelectOptions, Selector};
use std::sync::Arc;
use std::time::Duration;

/// Rewrites a requested service name before it's resolved, e.g. to route an
/// environment-suffixed alias to its backing module type. Installed once on
/// the application shell.
pub type RouteRewriter = Arc<dyn Fn(&str) -> String + Send + Sync>;

pub struct AppHandle {
    selector: Arc<Selector>,
    sessions: ServerSessionCache,
    client: Arc<RpcClient>,
    route_rewriter: Option<RouteRewriter>,
}

impl AppHandle {
    pub fn new(selector: Arc<Selector>, client: Arc<RpcClient>, route_rewriter: Option<RouteRewriter>) -> Self {
        Self { selector, sessions: ServerSessionCache::new(client.clone()), client, route_rewriter }
    }

    fn rewrite(&self, service: &str) -> String {
        match &self.route_rewriter {
            Some(f) => f(service),
            None => service.to_string(),
        }
    }

    /// Resolve a node by its exact, globally-unique id (`<type>@<instance>`).
    pub async fn get_by_id(&self, node_id: &str) -> Result<Arc<ServerSession>> {
        let service = node_id.split_once('@').map(|(s, _)| s).unwrap_or(node_id);
        let nodes = self.selector.all(service).await?;
        let node = nodes
            .into_iter()
            .find(|n| n.id == node_id)
            .ok_or_else(|| MeshError::server_not_found(node_id))?;
        Ok(self.sessions.get_or_create(&node))
    }

    /// All live nodes of `module_type`, e.g. for a fan-out broadcast.
    pub async fn get_by_type(&self, module_type: &str) -> Result<Vec<Arc<ServerSession>>> {
        let service = self.rewrite(module_type);
        let nodes = self.selector.all(&service).await?;
        Ok(nodes.iter().map(|n| self.sessions.get_or_create(n)).collect())
    }

    /// Resolve one node of `module_type` under a selection strategy.
    pub async fn get_by_selector(&self, module_type: &str, options: &SelectOptions) -> Result<Arc<ServerSession>> {
        let service = self.rewrite(module_type);
        let node = self.selector.select(&service, options).await?;
        Ok(self.sessions.get_or_create(&node))
    }

    /// Resolve `service` into a session: an explicit `moduleType@instanceId`
    /// is looked up directly, anything else goes through the selector.
    pub async fn get_route(&self, service: &str, options: &SelectOptions) -> Result<Arc<ServerSession>> {
        if service.contains('@') {
            self.get_by_id(service).await
        } else {
            self.get_by_selector(service, options).await
        }
    }

    /// Convenience: resolve and call in one step, using the default
    /// (random) selection strategy.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Arg>,
        ctx: &RpcContext,
        timeout: Duration,
    ) -> Result<Arg> {
        let session = self.get_route(service, &SelectOptions::default()).await?;
        session.call(method, args, ctx, timeout).await
    }

    pub async fn evict_session(&self, node_id: &str) {
        self.sessions.evict(node_id).await;
    }
}
