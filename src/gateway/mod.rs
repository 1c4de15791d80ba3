//! Client-facing gateway: accepts external TCP/TLS/WebSocket connections,
//! frames them into the mesh's wire protocol, and exposes the session
//! operations other modules call back through via [`delegate::GatewayDelegate`].
//!
//! Grounded in `gate/base/module.go`'s `GateModule`: a [`crate::module::Module`]
//! that starts whichever listeners its settings configure, registers the
//! delegate's RPC surface on its own server, and tears every live connection
//! down on `on_destroy`.

pub mod agent;
pub mod delegate;
pub mod frame;
pub mod listener;
pub mod session;

pub use agent::{Agent, AgentLearner, AgentState, ConnectionListener, NoopAgentLearner, NoopConnectionListener, RouteHandler};
pub use delegate::{GatewayDelegate, SessionSnapshot};
pub use frame::FrameCodec;
pub use listener::{GatewayListener, ListenerContext};
pub use session::{InMemorySessionStore, Session, SessionStore, SharedSessionStore};

use crate::constants::timeouts::DEFAULT_AGENT_HEARTBEAT_SECS;
use crate::error::Result;
use crate::module::{Module, ModuleInitContext, ModuleSettings};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn setting_str(settings: &ModuleSettings, key: &str) -> Option<String> {
    settings.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn setting_bool(settings: &ModuleSettings, key: &str) -> bool {
    settings.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn setting_u64(settings: &ModuleSettings, key: &str) -> Option<u64> {
    settings.get(key).and_then(|v| v.as_u64())
}

/// Settings bound to one gateway instance, read out of its configured
/// `module/Gateway[]` entry.
struct GatewaySettings {
    tcp_addr: Option<String>,
    ws_addr: Option<String>,
    tls: bool,
    cert_file: Option<String>,
    key_file: Option<String>,
    heartbeat: Duration,
}

impl GatewaySettings {
    fn from_module_settings(settings: &ModuleSettings) -> Self {
        Self {
            tcp_addr: setting_str(settings, "tcpAddr"),
            ws_addr: setting_str(settings, "wsAddr"),
            tls: setting_bool(settings, "tls"),
            cert_file: setting_str(settings, "certFile"),
            key_file: setting_str(settings, "keyFile"),
            heartbeat: Duration::from_secs(setting_u64(settings, "heartbeatSecs").unwrap_or(DEFAULT_AGENT_HEARTBEAT_SECS)),
        }
    }
}

struct RunningGateway {
    delegate: Arc<GatewayDelegate>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Client-facing gateway module. Construct with [`GatewayModule::new`],
/// optionally supplying a business [`ConnectionListener`] and/or a persistent
/// [`SessionStore`] before registering it with the application shell; the
/// framework-built [`GatewayDelegate`] is always installed alongside it.
pub struct GatewayModule {
    connection_listener: Arc<dyn ConnectionListener>,
    store: SharedSessionStore,
    state: RwLock<Option<RunningGateway>>,
}

impl GatewayModule {
    pub fn new() -> Self {
        Self { connection_listener: Arc::new(NoopConnectionListener), store: InMemorySessionStore::new(), state: RwLock::new(None) }
    }

    pub fn with_connection_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.connection_listener = listener;
        self
    }

    pub fn with_session_store(mut self, store: SharedSessionStore) -> Self {
        self.store = store;
        self
    }

    /// Live agent count across every listener on this gateway instance, for
    /// diagnostics or load-aware routing decisions by an integrator.
    pub async fn agent_count(&self) -> usize {
        match self.state.read().await.as_ref() {
            Some(running) => running.delegate.agent_count(),
            None => 0,
        }
    }
}

impl Default for GatewayModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for GatewayModule {
    fn module_type(&self) -> &str {
        "Gateway"
    }

    async fn on_init(&self, ctx: &ModuleInitContext, handle: Arc<crate::module::AppHandle>) -> Result<()> {
        let settings = GatewaySettings::from_module_settings(&ctx.settings);
        let delegate = GatewayDelegate::new(self.store.clone());
        delegate.register_methods(ctx.server.as_ref());

        let codec = Arc::new(FrameCodec::plain());
        let listener_ctx = Arc::new(
            ListenerContext::new(codec, handle, self.store.clone(), settings.heartbeat)
                .with_agent_learner(delegate.clone() as Arc<dyn AgentLearner>)
                .with_connection_listener(self.connection_listener.clone()),
        );

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        if let Some(addr) = settings.tcp_addr.clone() {
            let node_id = ctx.node.id.clone();
            if settings.tls {
                let (cert, key) = (
                    settings.cert_file.clone().ok_or_else(|| crate::error::MeshError::config("Gateway settings: tls=true requires certFile"))?,
                    settings.key_file.clone().ok_or_else(|| crate::error::MeshError::config("Gateway settings: tls=true requires keyFile"))?,
                );
                #[cfg(feature = "tls")]
                {
                    let acceptor = listener::load_tls_acceptor(&cert, &key)?;
                    let ctx = listener_ctx.clone();
                    let cancel = cancel.clone();
                    tasks.push(tokio::spawn(async move {
                        let server = GatewayListener::new(ctx, node_id);
                        if let Err(e) = server.serve_tls(&addr, acceptor, cancel).await {
                            tracing::error!(error = %e, "gateway tls listener exited");
                        }
                    }));
                }
                #[cfg(not(feature = "tls"))]
                {
                    let _ = (cert, key);
                    return Err(crate::error::MeshError::config("Gateway settings request tls=true but this build has no tls feature"));
                }
            } else {
                let ctx = listener_ctx.clone();
                let cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    let server = GatewayListener::new(ctx, node_id);
                    if let Err(e) = server.serve(&addr, cancel).await {
                        tracing::error!(error = %e, "gateway tcp listener exited");
                    }
                }));
            }
        }

        #[cfg(feature = "gateway")]
        if let Some(addr) = settings.ws_addr.clone() {
            let node_id = ctx.node.id.clone();
            let ctx_ws = listener_ctx.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let server = listener::WebSocketListener::new(ctx_ws, node_id);
                if let Err(e) = server.serve(&addr, cancel).await {
                    tracing::error!(error = %e, "gateway websocket listener exited");
                }
            }));
        }

        *self.state.write().await = Some(RunningGateway { delegate, cancel, tasks });
        Ok(())
    }

    async fn run(&self, mut close_signal: watch::Receiver<bool>) -> Result<()> {
        let _ = close_signal.changed().await;
        Ok(())
    }

    async fn on_destroy(&self) -> Result<()> {
        if let Some(running) = self.state.write().await.take() {
            running.cancel.cancel();
            for task in running.tasks {
                let _ = task.await;
            }
            for entry in running.delegate.live_agents() {
                entry.request_close();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mock::MockRegistry;
    use crate::rpc::server::RpcServer;
    use crate::selector::Selector;
    use crate::transport::mock::{MockBus, MockTransport};
    use crate::transport::SharedTransport;

    fn handle() -> Arc<crate::module::AppHandle> {
        let registry = MockRegistry::new();
        let selector = Selector::new(registry);
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "gateway@i-1"));
        let client = Arc::new(crate::rpc::client::RpcClient::new(transport));
        Arc::new(crate::module::AppHandle::new(selector, client, None))
    }

    fn ctx(settings: ModuleSettings) -> ModuleInitContext {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "gateway@i-1"));
        ModuleInitContext {
            instance_id: "i-1".into(),
            process_env: "dev".into(),
            settings,
            node: crate::registry::Node::new("Gateway", "i-1", "0.1.0", "127.0.0.1", 0),
            server: Arc::new(RpcServer::new(transport)),
        }
    }

    #[tokio::test]
    async fn on_init_with_no_addresses_starts_no_listeners() {
        let module = GatewayModule::new();
        module.on_init(&ctx(ModuleSettings::new()), handle()).await.unwrap();
        assert_eq!(module.agent_count().await, 0);
        module.on_destroy().await.unwrap();
    }

    #[tokio::test]
    async fn on_init_starts_a_tcp_listener_when_configured() {
        let bind_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = bind_listener.local_addr().unwrap();
        drop(bind_listener);

        let mut settings = ModuleSettings::new();
        settings.insert("tcpAddr".to_string(), serde_json::json!(addr.to_string()));

        let module = GatewayModule::new();
        module.on_init(&ctx(settings), handle()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        module.on_destroy().await.unwrap();
    }

    #[tokio::test]
    async fn tls_without_cert_file_is_a_config_error() {
        let mut settings = ModuleSettings::new();
        settings.insert("tcpAddr".to_string(), serde_json::json!("127.0.0.1:0"));
        settings.insert("tls".to_string(), serde_json::json!(true));

        let module = GatewayModule::new();
        let err = module.on_init(&ctx(settings), handle()).await.unwrap_err();
        assert!(matches!(err, crate::error::MeshError::Config(_)));
    }
}
