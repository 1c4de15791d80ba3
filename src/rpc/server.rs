//! RPC server: subscribes to a node's method-call subject, dispatches
//! incoming `RpcInfo` requests against a registered method table, and
//! publishes `ResultInfo` back to the caller's reply subject.
//!
//! Grounded in the original `RPCServer` (`rpc_server.go`): `Register`/
//! `RegisterGO` become [`RpcServer::register`]/[`RpcServer::register_parallel`],
//! `_runFunc`'s panic recovery becomes a `catch_unwind`-equivalent guard
//! around the spawned dispatch task (a panic inside an `async fn` can't be
//! caught with `std::panic::catch_unwind` directly, so the handler future is
//! driven on a dedicated task and its join result inspected instead), and the
//! goroutine/inline branch becomes [`DispatchMode`].

use crate::codec::Arg;
use crate::constants::{limits, timeouts};
use crate::error::{MeshError, Result};
use crate::registry::{Node, SharedRegistry};
use crate::rpc::context::RpcContext;
use crate::rpc::handler::{DispatchMode, HandlerFn, NoopListener, RegisteredMethod, RpcListener};
use crate::rpc::message::{ResultInfo, RpcInfo};
use crate::transport::SharedTransport;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Self-registration state for a server whose inbox should be published
/// into the service directory on `run` and withdrawn on `stop`, matching the
/// `Created -> Initialized (inbox open, registered in directory) -> Running
/// -> Draining -> Stopped` state machine from the original `RPCServer`.
struct Registration {
    registry: SharedRegistry,
    node: Node,
    ttl: Duration,
}

pub struct RpcServer {
    transport: SharedTransport,
    methods: DashMap<String, RegisteredMethod>,
    listener: Arc<dyn RpcListener>,
    dispatch_budget: Arc<Semaphore>,
    running: AtomicBool,
    shutdown: CancellationToken,
    registration: Option<Registration>,
}

impl RpcServer {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            transport,
            methods: DashMap::new(),
            listener: Arc::new(NoopListener),
            dispatch_budget: Arc::new(Semaphore::new(limits::DEFAULT_PARALLEL_DISPATCH_BUDGET)),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            registration: None,
        }
    }

    /// Publish `node` into `registry` (refreshed every `ttl / 2`) once
    /// [`RpcServer::run`] opens the inbox, and withdraw it again on
    /// [`RpcServer::stop`]. Deregistration precedes transport teardown.
    pub fn with_registration(mut self, registry: SharedRegistry, node: Node, ttl: Duration) -> Self {
        self.registration = Some(Registration { registry, node, ttl });
        self
    }

    pub fn set_listener(&mut self, listener: Arc<dyn RpcListener>) {
        self.listener = listener;
    }

    /// Register a method dispatched inline on the server's receive loop.
    pub fn register(&self, name: impl Into<String>, handler: HandlerFn) {
        let name = name.into();
        self.methods.insert(
            name.clone(),
            RegisteredMethod { name, mode: DispatchMode::Serial, handler },
        );
    }

    /// Register a method dispatched onto its own task, bounded by the
    /// server's parallel-dispatch semaphore.
    pub fn register_parallel(&self, name: impl Into<String>, handler: HandlerFn) {
        let name = name.into();
        self.methods.insert(
            name.clone(),
            RegisteredMethod { name, mode: DispatchMode::Parallel, handler },
        );
    }

    pub fn deregister(&self, name: &str) {
        self.methods.remove(name);
    }

    /// Subscribe to this node's call subject and dispatch requests until
    /// `shutdown` is triggered or cancelled via [`RpcServer::stop`].
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let subject = format!("{}.{}", crate::constants::subjects::RPC_SUBJECT_PREFIX, self.transport.node_id());
        let mut stream = self.transport.subscribe(&subject).await?;

        let renew_cancel = CancellationToken::new();
        if let Some(reg) = &self.registration {
            reg.registry.register(&reg.node, reg.ttl).await?;
            let reg_clone = reg.registry.clone();
            let node = reg.node.clone();
            let interval = reg.ttl / 2;
            let cancel = renew_cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately; skip it, registration just happened
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = reg_clone.register(&node, interval * 2).await {
                                tracing::warn!(node = %node.id, error = %e, "registry lease renewal failed");
                            }
                        }
                    }
                }
            });
        }

        self.running.store(true, Ordering::SeqCst);
        tracing::info!(node = %self.transport.node_id(), "rpc server running");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = stream.next() => {
                    let Some(msg) = msg else { break };
                    let Ok(info) = rmp_serde::from_slice::<RpcInfo>(&msg.payload) else { continue };

                    // Serial methods (and anything unregistered, so the
                    // not-found hook fires promptly) run inline on this
                    // receive task: this is the documented, probably
                    // throughput-limiting choice of serializing every
                    // serial method behind the one receive loop, kept
                    // deliberately rather than silently widened. Parallel
                    // methods get their own task so the receive loop isn't
                    // blocked on them.
                    match self.methods.get(&info.method).map(|m| m.mode) {
                        Some(DispatchMode::Parallel) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_inbound(info, msg.reply_to).await;
                            });
                        }
                        Some(DispatchMode::Serial) | None => {
                            self.handle_inbound(info, msg.reply_to).await;
                        }
                    }
                }
            }
        }

        renew_cancel.cancel();
        if let Some(reg) = &self.registration {
            if let Err(e) = reg.registry.deregister(&reg.node.service, &reg.node.id).await {
                tracing::warn!(node = %reg.node.id, error = %e, "deregistration failed during shutdown");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn handle_inbound(&self, info: RpcInfo, reply_to: Option<String>) {
        if info.is_expired() {
            self.listener.on_timeout(&info.method);
            if info.reply {
                self.reply(&info, reply_to, Err(MeshError::timeout(&info.method))).await;
            }
            return;
        }

        let args = match info.decode_args() {
            Ok(args) => args,
            Err(e) => {
                if info.reply {
                    self.reply(&info, reply_to, Err(e)).await;
                }
                return;
            }
        };
        for arg in &args {
            if let Err(e) = crate::codec::validate_tag(&arg.tag) {
                if info.reply {
                    self.reply(&info, reply_to, Err(e)).await;
                }
                return;
            }
        }

        // The caller's context travels as a `context`-tagged args[0]; strip
        // it back off before the registered handler ever sees the argument
        // list it asked for.
        let (ctx, args) = match args.split_first() {
            Some((first, rest)) if first.tag == crate::codec::CONTEXT_TAG => {
                (RpcContext::from_context_arg(first).unwrap_or_default(), rest.to_vec())
            }
            _ => (RpcContext::default(), args),
        };
        self.listener.before_handle(&info.method, &ctx);

        let Some(method) = self.methods.get(&info.method).map(|m| m.clone()) else {
            self.listener.no_found_function(&info.method);
            if info.reply {
                self.reply(&info, reply_to, Err(MeshError::no_found_function(&info.method))).await;
            }
            return;
        };

        let start = Instant::now();

        let result = match method.mode {
            DispatchMode::Serial => self.dispatch(&method, ctx, args).await,
            DispatchMode::Parallel => {
                let Ok(_permit) = self.dispatch_budget.clone().acquire_owned().await else {
                    return;
                };
                self.dispatch(&method, ctx, args).await
            }
        };

        match &result {
            Ok(_) => self.listener.on_complete(&info.method, start.elapsed()),
            Err(e) => self.listener.on_error(&info.method, e),
        }

        if info.reply {
            self.reply(&info, reply_to, result).await;
        }
    }

    /// Run the handler under a panic guard and treat a panic as a
    /// `MeshError::HandlerPanic`, matching the original server's
    /// `recover()`-wrapped dispatch. Deliberately does *not* spawn its own
    /// task: whether this call runs inline on the receive loop (serial) or
    /// on a task the caller already spawned (parallel) is decided by
    /// `RpcServer::run`/`handle_inbound`, not here — spawning again here
    /// would silently parallelize "serial" methods against each other.
    async fn dispatch(&self, method: &RegisteredMethod, ctx: RpcContext, args: Vec<Arg>) -> Result<Arg> {
        let handler = method.handler.clone();
        let method_name = method.name.clone();
        match AssertUnwindSafe(handler(ctx, args)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(MeshError::handler_panic(format!("{method_name}: {}", panic_message(&panic)))),
        }
    }

    async fn reply(&self, info: &RpcInfo, reply_to: Option<String>, result: Result<Arg>) {
        let exec_time = 0;
        let result_info = match result {
            Ok(arg) => ResultInfo::ok(info.cid.clone(), info.method.clone(), arg, exec_time),
            Err(e) => ResultInfo::err(info.cid.clone(), info.method.clone(), e.to_string()),
        };
        let Ok(payload) = rmp_serde::to_vec_named(&result_info) else { return };
        let subject = reply_to.unwrap_or_else(|| info.reply_to.clone());
        let _ = self.transport.publish(&subject, payload).await;
    }
}

pub fn default_call_timeout() -> Duration {
    timeouts::DEFAULT_RPC_CALL_TIMEOUT
}

/// Best-effort extraction of a panic payload's message, for folding into
/// `MeshError::HandlerPanic`. `std::panic::catch_unwind`'s payload is
/// `Box<dyn Any + Send>`; most panics carry a `&str` or `String`.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockBus, MockTransport};

    fn echo_handler() -> HandlerFn {
        Arc::new(|_ctx, args| {
            Box::pin(async move { Ok(args.into_iter().next().unwrap_or(Arg::new("null", vec![]))) })
        })
    }

    fn test_info(method: &str, expired: i64, reply: bool) -> RpcInfo {
        RpcInfo {
            cid: "c1".into(),
            method: method.into(),
            reply_to: "mesh.rpc.reply.caller".into(),
            expired,
            reply,
            args_type: vec![],
            args: vec![],
            caller: "caller".into(),
            hostname: "host-caller".into(),
        }
    }

    #[tokio::test]
    async fn no_found_function_fires_listener() {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "node-a"));
        let server = Arc::new(RpcServer::new(transport));
        let info = test_info("missing", RpcInfo::now_millis() + 5000, false);
        server.handle_inbound(info, None).await;
    }

    #[tokio::test]
    async fn panicking_handler_replies_with_handler_panic_without_crashing_the_server() {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "node-a"));
        let server = Arc::new(RpcServer::new(transport));
        server.register(
            "boom",
            Arc::new(|_ctx, _args| Box::pin(async move { panic!("intentional test panic") })),
        );
        let info = test_info("boom", RpcInfo::now_millis() + 5000, false);
        // Should not abort the test process; the panic is caught and turned
        // into an error reply.
        server.handle_inbound(info, None).await;
    }

    #[tokio::test]
    async fn expired_request_sends_a_timeout_reply_instead_of_dispatching() {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus.clone(), "node-a"));
        let server = Arc::new(RpcServer::new(transport));
        server.register("slow", echo_handler());

        let reply_subject = "mesh.rpc.reply.caller";
        let caller_transport: SharedTransport = Arc::new(MockTransport::new(bus, "caller"));
        let mut sub = caller_transport.subscribe(reply_subject).await.unwrap();

        let info = test_info("slow", RpcInfo::now_millis() - 1000, true);
        server.handle_inbound(info, None).await;

        let msg = sub.next().await.expect("expired request should still produce a reply");
        let result: ResultInfo = rmp_serde::from_slice(&msg.payload).unwrap();
        assert!(!result.is_ok());
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unsupported_tag_replies_with_error_instead_of_dispatching() {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus.clone(), "node-a"));
        let server = Arc::new(RpcServer::new(transport));
        server.register("echo", echo_handler());

        let reply_subject = "mesh.rpc.reply.caller";
        let caller_transport: SharedTransport = Arc::new(MockTransport::new(bus, "caller"));
        let mut sub = caller_transport.subscribe(reply_subject).await.unwrap();

        let mut info = test_info("echo", RpcInfo::now_millis() + 5000, true);
        info.args_type = vec!["frobnicate@Widget".into()];
        info.args = vec![vec![1, 2, 3]];
        server.handle_inbound(info, None).await;

        let msg = sub.next().await.expect("unsupported tag should still produce a reply");
        let result: ResultInfo = rmp_serde::from_slice(&msg.payload).unwrap();
        assert!(!result.is_ok());
        assert!(result.error.unwrap().contains("unsupported tag"));
    }

    #[tokio::test]
    async fn context_tagged_arg0_is_stripped_before_the_handler_sees_its_arguments() {
        use crate::codec::FromArg;
        use crate::rpc::context::{RpcContext, TranslatableContextKeyRegistry};

        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus.clone(), "node-a"));
        let server = Arc::new(RpcServer::new(transport));
        server.register(
            "echo",
            Arc::new(|_ctx, args| Box::pin(async move { Ok(args.into_iter().next().unwrap()) })),
        );

        let ctx = RpcContext::new_root();
        let registry = TranslatableContextKeyRegistry::new();
        let context_arg = ctx.to_context_arg(&registry).unwrap();
        let payload_arg = 7i32.to_arg().unwrap();

        let reply_subject = "mesh.rpc.reply.caller";
        let caller_transport: SharedTransport = Arc::new(MockTransport::new(bus, "caller"));
        let mut sub = caller_transport.subscribe(reply_subject).await.unwrap();

        let mut info = test_info("echo", RpcInfo::now_millis() + 5000, true);
        let (args_type, args) = RpcInfo::encode_args(&[context_arg, payload_arg]);
        info.args_type = args_type;
        info.args = args;

        server.handle_inbound(info, None).await;

        let msg = sub.next().await.expect("echo should reply");
        let result: ResultInfo = rmp_serde::from_slice(&msg.payload).unwrap();
        assert!(result.is_ok());
        let reply_arg = result.into_arg().unwrap();
        assert_eq!(i32::from_arg(&reply_arg).unwrap(), 7);
    }

    #[tokio::test]
    async fn registered_method_dispatches_serially() {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "node-a"));
        let server = RpcServer::new(transport);
        server.register("echo", echo_handler());
        assert!(server.methods.contains_key("echo"));
    }

    #[tokio::test]
    async fn deregister_removes_method() {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "node-a"));
        let server = RpcServer::new(transport);
        server.register("echo", echo_handler());
        server.deregister("echo");
        assert!(!server.methods.contains_key("echo"));
    }
}
