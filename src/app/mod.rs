//! Application shell: the composition root wiring configuration, registry,
//! transport and module runtime together, and driving a node process from
//! startup through graceful shutdown.
//!
//! Grounded in `app/app.go`'s `Run()`, an eleven-step boot sequence (load
//! flags, chdir into `wd`, connect the registry, fetch and parse the
//! configuration document, open the broker connection, build the selector,
//! construct the module manager, fire `onConfigurationLoaded`, register the
//! built-in timer module ahead of user modules, validate and init every
//! configured module, fire `onStartup`) followed by a signal-driven wait and
//! a kill-wait-bounded graceful stop. [`AppShell::run`] keeps that same
//! thirteen-step shape (split slightly further: connecting the registry and
//! the broker are distinct steps here, since this crate's registry is a NATS
//! JetStream KV bucket rather than a separate Consul-like service) one
//! method per step, rather than collapsing it into a single opaque `main`.

use crate::config::{load_from_registry, ServerConfig, StartupArgs};
use crate::error::{MeshError, Result};
use crate::module::handle::RouteRewriter;
use crate::module::{Module, ModuleManager, TimerModule};
use crate::registry::SharedRegistry;
use crate::selector::Selector;
use crate::transport::SharedTransport;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Hook fired once the configuration document has been fetched and parsed,
/// before any module's `on_init`. Mirrors `app/app.go`'s `onConfigurationLoaded`.
pub type ConfigurationLoadedHook = Arc<dyn Fn(&ServerConfig) -> Result<()> + Send + Sync>;

/// Hook fired once every configured module has finished `on_init` and
/// started its `run` loop. Mirrors `app/app.go`'s `onModuleInited`.
pub type ModuleInitedHook = Arc<dyn Fn() + Send + Sync>;

/// Hook fired once the shell has entered its steady-state wait, immediately
/// before blocking for a shutdown signal. Mirrors `app/app.go`'s `onStartup`.
pub type StartupHook = Arc<dyn Fn() + Send + Sync>;

/// A service-broken notification: `(service, nodeId)` of whatever peer the
/// selector's watcher observed being evicted from the registry.
pub type ServiceBrokenHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Future returned by [`AppShell::run`]'s wait-for-shutdown step. Boxed so
/// callers can supply anything from `tokio::signal::ctrl_c()` to a test
/// harness's oneshot without the shell depending on a concrete signal source.
pub type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Collaborator constructors and hooks an integrator supplies before calling
/// [`AppShell::run`]. Everything here is optional except the registry
/// connection and transport, which every mesh node needs.
pub struct AppShellBuilder {
    args: StartupArgs,
    registry: SharedRegistry,
    transport: SharedTransport,
    register_ttl: Duration,
    kill_wait: Duration,
    route_rewriter: Option<RouteRewriter>,
    modules: Vec<Arc<dyn Module>>,
    on_configuration_loaded: Vec<ConfigurationLoadedHook>,
    on_module_inited: Vec<ModuleInitedHook>,
    on_startup: Vec<StartupHook>,
    on_service_broken: Vec<ServiceBrokenHook>,
    shutdown_signal: Option<ShutdownSignal>,
}

impl AppShellBuilder {
    pub fn new(args: StartupArgs, registry: SharedRegistry, transport: SharedTransport) -> Self {
        Self {
            args,
            registry,
            transport,
            register_ttl: Duration::from_secs(crate::constants::timeouts::DEFAULT_REGISTER_TTL_SECS),
            kill_wait: Duration::from_secs(crate::constants::timeouts::DEFAULT_KILL_WAIT_SECS),
            route_rewriter: None,
            modules: Vec::new(),
            on_configuration_loaded: Vec::new(),
            on_module_inited: Vec::new(),
            on_startup: Vec::new(),
            on_service_broken: Vec::new(),
            shutdown_signal: None,
        }
    }

    pub fn with_register_ttl(mut self, ttl: Duration) -> Self {
        self.register_ttl = ttl;
        self
    }

    /// How long [`AppShell::run`]'s graceful stop waits for every module to
    /// finish teardown before giving up and returning anyway, matching the
    /// original's kill-wait deadline so a wedged module can't hang the
    /// process forever.
    pub fn with_kill_wait(mut self, kill_wait: Duration) -> Self {
        self.kill_wait = kill_wait;
        self
    }

    pub fn with_route_rewriter(mut self, rewriter: RouteRewriter) -> Self {
        self.route_rewriter = Some(rewriter);
        self
    }

    /// Register a user module. Order is preserved; the built-in
    /// [`TimerModule`] is always registered ahead of every module added here
    /// (§4.6 step 6 / `app/app.go`'s own timer-module bootstrap).
    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn on_configuration_loaded(mut self, hook: ConfigurationLoadedHook) -> Self {
        self.on_configuration_loaded.push(hook);
        self
    }

    pub fn on_module_inited(mut self, hook: ModuleInitedHook) -> Self {
        self.on_module_inited.push(hook);
        self
    }

    pub fn on_startup(mut self, hook: StartupHook) -> Self {
        self.on_startup.push(hook);
        self
    }

    /// Subscribe to registry eviction notifications. Unlike the original's
    /// single `OnServiceBroken` callback, this crate supports any number of
    /// subscribers (see DESIGN.md): every hook registered here fires on
    /// every eviction the selector's watcher observes.
    pub fn on_service_broken(mut self, hook: ServiceBrokenHook) -> Self {
        self.on_service_broken.push(hook);
        self
    }

    /// Supply the future [`AppShell::run`] awaits before starting graceful
    /// shutdown. Defaults to [`tokio::signal::ctrl_c`] if never called.
    pub fn with_shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(signal);
        self
    }

    pub async fn run(self) -> Result<()> {
        AppShell::run(self).await
    }
}

/// Drives one node process through the full startup-to-shutdown sequence.
/// Stateless beyond what a single [`AppShell::run`] call needs; there's
/// nothing to construct directly, only [`AppShellBuilder::run`] to call.
struct AppShell;

impl AppShell {
    async fn run(builder: AppShellBuilder) -> Result<()> {
        let AppShellBuilder {
            args,
            registry,
            transport,
            register_ttl,
            kill_wait,
            route_rewriter,
            modules,
            on_configuration_loaded,
            on_module_inited,
            on_startup,
            on_service_broken,
            shutdown_signal,
        } = builder;

        // Step 1: chdir into the configured working directory, before
        // anything else (relative config/log paths resolve against it).
        if let Some(wd) = &args.wd {
            std::env::set_current_dir(wd).map_err(|e| MeshError::config(format!("chdir to '{wd}': {e}")))?;
        }

        let process_env = args.resolved_process_env();
        tracing::info!(process_env = %process_env, "application shell starting");

        // Step 2: fetch and parse the configuration document. The registry
        // connection itself is already live by the time it reaches here;
        // opening it is the caller's job (see `AppShellBuilder::new`),
        // mirroring the original's split between connecting to Consul and
        // reading a document back out of it.
        let config = load_from_registry(&registry, &process_env).await?;

        // Step 3: fire configuration-loaded hooks.
        for hook in &on_configuration_loaded {
            hook(&config)?;
        }

        // Step 4: build the selector and start its background cache-invalidation watch.
        let selector = Selector::new(registry.clone());
        selector.spawn_watch();
        for hook in on_service_broken {
            selector.on_node_removed(Arc::new(move |service, node_id| hook(service, node_id))).await;
        }

        // Step 5: construct the module manager over the configured entries.
        let mut manager = ModuleManager::new(process_env, config.module_entries(), transport, registry.clone(), selector, register_ttl);
        if let Some(rewriter) = route_rewriter {
            manager = manager.with_route_rewriter(rewriter);
        }

        // Step 6: register the built-in timer module ahead of every user
        // module, after giving each a look at the parsed configuration
        // document (`app/app.go`'s per-module `onAppConfigurationLoaded`
        // hook, fired ahead of `on_init` so a module can validate or cache
        // settings outside its own `module/<type>` entry).
        let config_value = serde_json::to_value(&config)
            .map_err(|e| MeshError::config(format!("serializing configuration for module hooks: {e}")))?;
        let timer_module: Arc<dyn Module> = Arc::new(TimerModule::new());
        timer_module.on_app_configuration_loaded(&config_value).await?;
        manager.register(timer_module);
        for module in modules {
            module.on_app_configuration_loaded(&config_value).await?;
            manager.register(module);
        }

        // Step 7-8: validate configured entries, then bind settings and
        // start every module matching this node's processEnv.
        manager.init().await?;
        tracing::info!(running = manager.running_count(), "modules initialized");

        // Step 9: fire module-inited hooks.
        for hook in &on_module_inited {
            hook();
        }

        // Step 10: fire startup hooks, immediately before the steady-state wait.
        for hook in &on_startup {
            hook();
        }
        tracing::info!("application shell ready");

        // Step 11: wait for a shutdown signal.
        match shutdown_signal {
            Some(signal) => signal.await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        tracing::info!("shutdown signal received, beginning graceful stop");

        // Step 12-13: graceful stop, bounded by the kill-wait deadline; a
        // module wedged in `on_destroy` doesn't hang the process forever.
        match tokio::time::timeout(kill_wait, manager.shutdown()).await {
            Ok(()) => tracing::info!("graceful shutdown complete"),
            Err(_) => {
                tracing::warn!(kill_wait = ?kill_wait, "graceful shutdown did not finish within the kill-wait deadline, aborting process");
                std::process::abort();
            }
        }

        Ok(())
    }
}

/// Test-only clock-free shutdown signal: fires as soon as the returned
/// sender is dropped or sent to, for driving [`AppShellBuilder::run`] to
/// completion without waiting on a real OS signal.
#[cfg(test)]
pub fn test_shutdown_signal() -> (tokio::sync::oneshot::Sender<()>, ShutdownSignal) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let fut: ShutdownSignal = Box::pin(async move {
        let _ = rx.await;
    });
    (tx, fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleInitContext, ModuleSettings};
    use crate::registry::mock::MockRegistry;
    use crate::transport::mock::{MockBus, MockTransport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::watch;

    struct RecordingModule {
        inited: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Module for RecordingModule {
        fn module_type(&self) -> &str {
            "recording"
        }

        async fn on_init(&self, _ctx: &ModuleInitContext, _handle: Arc<crate::module::AppHandle>) -> Result<()> {
            self.inited.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn run(&self, mut close_signal: watch::Receiver<bool>) -> Result<()> {
            let _ = close_signal.changed().await;
            Ok(())
        }
    }

    async fn published_registry(document: serde_json::Value) -> SharedRegistry {
        let registry: SharedRegistry = MockRegistry::new();
        registry.put("config/dev/server", serde_json::to_vec(&document).unwrap()).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn run_inits_registered_module_and_stops_on_signal() {
        let document = serde_json::json!({
            "rpc_log": false,
            "module": { "recording": [{"id": "i-1", "host": "127.0.0.1", "env": "dev", "settings": {}}] },
            "nats": {"addr": "nats://localhost:4222"}
        });
        let registry = published_registry(document).await;
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "node-a"));

        let inited = Arc::new(AtomicBool::new(false));
        let (tx, signal) = test_shutdown_signal();

        let startup_fired = Arc::new(AtomicBool::new(false));
        let startup_fired_hook = startup_fired.clone();

        let args = StartupArgs { wd: None, env: Some("dev".into()), consul: None, log: None, bi: None, pprof: None };
        let builder = AppShellBuilder::new(args, registry, transport)
            .with_module(Arc::new(RecordingModule { inited: inited.clone() }))
            .on_startup(Arc::new(move || startup_fired_hook.store(true, Ordering::SeqCst)))
            .with_shutdown_signal(signal);

        let run = tokio::spawn(builder.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(inited.load(Ordering::SeqCst));
        assert!(startup_fired.load(Ordering::SeqCst));

        let _ = tx.send(());
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_propagates_configuration_loaded_hook_errors() {
        let document = serde_json::json!({
            "rpc_log": false,
            "module": {},
            "nats": {"addr": "nats://localhost:4222"}
        });
        let registry = published_registry(document).await;
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "node-a"));
        let (_tx, signal) = test_shutdown_signal();

        let args = StartupArgs { wd: None, env: Some("dev".into()), consul: None, log: None, bi: None, pprof: None };
        let builder = AppShellBuilder::new(args, registry, transport)
            .on_configuration_loaded(Arc::new(|_| Err(MeshError::config("rejected by test hook"))))
            .with_shutdown_signal(signal);

        let err = builder.run().await.unwrap_err();
        assert!(matches!(err, MeshError::Config(_)));
    }
}
