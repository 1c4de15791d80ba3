//! Module manager: binds registered [`Module`] implementations to their
//! configured instance, builds each one its own node identity, RPC
//! server/client pair and discovery facade, then owns startup and
//! reverse-order shutdown.
//!
//! Grounded in the original manager's two-list model (registered
//! implementations vs. configured-to-run entries) and its validate-then-init
//! algorithm (`module_manager.go`: `validate` walks every configured entry
//! checking global instance-id uniqueness and per-type `processEnv`
//! uniqueness before anything starts; `init` binds settings and launches).
//! Each module instance becomes its own mesh node (`<moduleType>@<instanceId>`),
//! matching the original's one-node-per-running-module-instance shape: the
//! manager wraps the process's single shared [`Transport`] in a
//! [`ScopedTransport`] per instance so each gets its own inbox subject
//! without its own broker connection.

use crate::error::{MeshError, Result};
use crate::module::handle::{AppHandle, RouteRewriter};
use crate::module::{Module, ModuleInitContext, ModuleSettings};
use crate::registry::{Node, SharedRegistry};
use crate::rpc::client::RpcClient;
use crate::rpc::server::RpcServer;
use crate::selector::Selector;
use crate::transport::{ScopedTransport, SharedTransport};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Best-effort local hostname for node metadata, matching the original
/// node registration's `os.Hostname()` call; falls back to `"unknown"`
/// rather than failing startup if the OS call errors.
fn local_hostname() -> String {
    hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "unknown".to_string())
}

/// One configured instance of a module type, as it appears under
/// `module/<type>` in the configuration document.
#[derive(Debug, Clone)]
pub struct ModuleEntry {
    pub instance_id: String,
    pub host: String,
    pub process_env: String,
    pub settings: ModuleSettings,
}

struct RunningModule {
    module: Arc<dyn Module>,
    node_id: String,
    close_tx: watch::Sender<bool>,
    server: Arc<RpcServer>,
    run_join: JoinHandle<Result<()>>,
    server_join: JoinHandle<Result<()>>,
}

/// Owns every module registered in this process plus the configuration's
/// `module/<type>` table, and drives the bound subset through its lifecycle.
pub struct ModuleManager {
    registered: Vec<Arc<dyn Module>>,
    configured: HashMap<String, Vec<ModuleEntry>>,
    process_env: String,
    transport: SharedTransport,
    registry: SharedRegistry,
    selector: Arc<Selector>,
    register_ttl: Duration,
    route_rewriter: Option<RouteRewriter>,
    running: Vec<RunningModule>,
}

impl ModuleManager {
    pub fn new(
        process_env: impl Into<String>,
        configured: HashMap<String, Vec<ModuleEntry>>,
        transport: SharedTransport,
        registry: SharedRegistry,
        selector: Arc<Selector>,
        register_ttl: Duration,
    ) -> Self {
        Self {
            registered: Vec::new(),
            configured,
            process_env: process_env.into(),
            transport,
            registry,
            selector,
            register_ttl,
            route_rewriter: None,
            running: Vec::new(),
        }
    }

    /// Rewrite service names before the discovery facade resolves them; see
    /// [`crate::module::handle::AppHandle`].
    pub fn with_route_rewriter(mut self, rewriter: RouteRewriter) -> Self {
        self.route_rewriter = Some(rewriter);
        self
    }

    /// Register an implementation. Order is preserved and drives both
    /// startup order and (reversed) shutdown order.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.registered.push(module);
    }

    /// Check the configured entries for global invariant violations before
    /// anything starts: every `instanceId` is globally unique, and within a
    /// single module type, every `processEnv` appears at most once. Both are
    /// treated as unrecoverable operator error, matching the original's
    /// `log.Fatal` on the same violations.
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for (module_type, entries) in &self.configured {
            let mut seen_envs = HashSet::new();
            for entry in entries {
                if !seen_ids.insert(entry.instance_id.clone()) {
                    return Err(MeshError::module(format!(
                        "duplicate instanceId '{}' across configured modules",
                        entry.instance_id
                    )));
                }
                if !seen_envs.insert(entry.process_env.clone()) {
                    return Err(MeshError::module(format!(
                        "module type '{module_type}' has more than one entry for processEnv '{}'",
                        entry.process_env
                    )));
                }
            }
        }
        Ok(())
    }

    /// Entries configured to run on this node's active `processEnv`, paired
    /// with the registered implementation each binds to. At most one entry
    /// per type can match once [`ModuleManager::validate`] has passed, since
    /// that invariant rules out two entries of the same type sharing an env.
    fn run_list(&self) -> Vec<(Arc<dyn Module>, ModuleEntry)> {
        self.registered
            .iter()
            .filter_map(|module| {
                let entries = self.configured.get(module.module_type())?;
                let entry = entries.iter().find(|e| e.process_env == self.process_env)?;
                Some((module.clone(), entry.clone()))
            })
            .collect()
    }

    /// Validate, then build each bound module its own node identity and RPC
    /// stack, call `on_init`, and spawn both its server's receive loop and
    /// its own `run` loop, in registration order.
    pub async fn init(&mut self) -> Result<()> {
        self.validate()?;

        for (module, entry) in self.run_list() {
            let node = Node::new(module.module_type(), entry.instance_id.clone(), crate::constants::metadata::MESH_VERSION, entry.host.clone(), 0)
                .with_metadata("hostname", local_hostname())
                .with_metadata("pid", std::process::id().to_string());

            let scoped: SharedTransport = Arc::new(ScopedTransport::new(self.transport.clone(), node.id.clone()));
            let client = Arc::new(RpcClient::new(scoped.clone()));
            let listen_client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = listen_client.listen().await {
                    tracing::error!(error = %e, "rpc client reply listener exited");
                }
            });

            let server = Arc::new(
                RpcServer::new(scoped.clone()).with_registration(self.registry.clone(), node.clone(), self.register_ttl),
            );

            let handle = Arc::new(AppHandle::new(self.selector.clone(), client, self.route_rewriter.clone()));

            // Evict this module's cached session for any node the selector's
            // watcher observes leaving the registry, matching the original
            // manager's "drop the stale server session on watch delete"
            // behavior.
            let eviction_handle = handle.clone();
            self.selector
                .on_node_removed(Arc::new(move |_service, node_id| {
                    let handle = eviction_handle.clone();
                    let node_id = node_id.to_string();
                    tokio::spawn(async move { handle.evict_session(&node_id).await });
                }))
                .await;

            let ctx = ModuleInitContext {
                instance_id: entry.instance_id.clone(),
                process_env: entry.process_env.clone(),
                settings: entry.settings.clone(),
                node: node.clone(),
                server: server.clone(),
            };
            module.on_init(&ctx, handle).await?;

            let (close_tx, close_rx) = watch::channel(false);
            let biz_module = module.clone();
            let run_join = tokio::spawn(async move { biz_module.run(close_rx).await });

            let server_for_run = server.clone();
            let server_join = tokio::spawn(async move { server_for_run.run().await });

            self.running.push(RunningModule {
                module,
                node_id: node.id,
                close_tx,
                server,
                run_join,
                server_join,
            });
        }

        Ok(())
    }

    /// How many modules are bound and running on this node.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Signal every running module to stop (both its business loop and its
    /// RPC server's receive loop), await both tasks, then call
    /// `on_destroy`, all in reverse startup order.
    pub async fn shutdown(&mut self) {
        while let Some(running) = self.running.pop() {
            let _ = running.close_tx.send(true);
            running.server.stop();

            if let Err(e) = running.run_join.await {
                tracing::warn!(node = %running.node_id, error = %e, "module run task failed to join");
            }
            if let Err(e) = running.server_join.await {
                tracing::warn!(node = %running.node_id, error = %e, "rpc server task failed to join");
            }
            if let Err(e) = running.module.on_destroy().await {
                tracing::warn!(node = %running.node_id, error = %e, "on_destroy failed");
            }
        }
    }
}
