//! Module runtime: the lifecycle contract every long-lived service in a
//! mesh process implements, plus the collaborators that bind configured
//! module entries to registered implementations and resolve calls between
//! them at runtime.
//!
//! Grounded in the original module contract's `OnInit`/`Run`/`OnDestroy`
//! triad and the manager's two-list (registered vs. configured-to-run)
//! bookkeeping (`module_manager.go`); [`ModuleManager::init`] implements the
//! same validate-then-bind-then-start algorithm.

pub mod handle;
pub mod manager;
pub mod session_cache;
pub mod timer;

pub use handle::AppHandle;
pub use manager::{ModuleEntry, ModuleManager};
pub use session_cache::{ServerSession, ServerSessionCache};
pub use timer::TimerModule;

use crate::error::Result;
use crate::registry::Node;
use crate::rpc::server::RpcServer;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Settings bound to one configured instance of a module (the `settings` map
/// under its `module/<type>[]` config entry), handed to [`Module::on_init`].
pub type ModuleSettings = HashMap<String, serde_json::Value>;

/// A long-lived service hosted inside a mesh process.
///
/// Every module gets its own globally-unique node id (`<moduleType>@<instanceId>`)
/// and, via the [`AppHandle`] passed into its lifecycle hooks, the ability to
/// call any other module in the mesh without holding a reference to the
/// application shell itself.
#[async_trait]
pub trait Module: Send + Sync {
    /// The module type name this implementation registers under; matched
    /// against configured `module/<type>` entries.
    fn module_type(&self) -> &str;

    /// Called once configuration has bound this instance's settings, before
    /// [`Module::run`]. Registering RPC methods belongs here, on
    /// `ctx.server`; the manager opens `ctx.server`'s inbox and publishes it
    /// into the registry on the module's behalf once `on_init` returns.
    async fn on_init(&self, ctx: &ModuleInitContext, handle: Arc<AppHandle>) -> Result<()>;

    /// Optional hook fired once with the full application configuration
    /// document before any module's `on_init`, letting a module read
    /// settings outside its own entry (e.g. shared `settings` or `nats`
    /// blocks).
    async fn on_app_configuration_loaded(&self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Drive the module's own business loop until `close_signal` fires. The
    /// manager separately drives `ctx.server`'s receive loop on its own
    /// task, so a module with no standalone background work beyond serving
    /// RPCs can implement this as `close_signal.changed().await` and return.
    async fn run(&self, close_signal: watch::Receiver<bool>) -> Result<()>;

    /// Called once, in reverse registration order, after `run` returns
    /// (either because `close_signal` fired or the module exited on its
    /// own).
    async fn on_destroy(&self) -> Result<()> {
        Ok(())
    }
}

/// Settings and identity bound to a module instance at `on_init` time.
#[derive(Clone)]
pub struct ModuleInitContext {
    pub instance_id: String,
    pub process_env: String,
    pub settings: ModuleSettings,
    /// This instance's registry entry (`<moduleType>@<instanceId>`).
    pub node: Node,
    /// This instance's RPC server, scoped to `node.id`'s own inbox subject.
    /// Methods registered here via [`RpcServer::register`]/`register_parallel`
    /// become callable as soon as the manager starts its receive loop.
    pub server: Arc<RpcServer>,
}

impl ModuleInitContext {
    pub fn setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.settings.get(key)
    }
}
