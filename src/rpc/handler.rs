//! Registered-method table and the handler function type RPC methods are
//! stored as.

use crate::codec::Arg;
use crate::error::Result;
use crate::rpc::context::RpcContext;
use futures::future::BoxFuture;
use std::sync::Arc;

/// A registered RPC method body.
///
/// Go's original reflective dispatch (`runFunc` materializing arguments via
/// `reflect.Value`) has no Rust analogue: methods are boxed trait objects
/// closing over whatever argument/return conversion the registrant wants,
/// keyed purely by name at registration time.
pub type HandlerFn = Arc<
    dyn Fn(RpcContext, Vec<Arg>) -> BoxFuture<'static, Result<Arg>> + Send + Sync,
>;

/// Dispatch mode a method was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Run inline on the server's dispatch task (Go: non-goroutine function).
    Serial,
    /// Spawn onto the runtime, bounded by the server's dispatch semaphore
    /// (Go: `FunctionInfo.Goroutine == true`).
    Parallel,
}

#[derive(Clone)]
pub struct RegisteredMethod {
    pub name: String,
    pub mode: DispatchMode,
    pub handler: HandlerFn,
}

/// Listener hooks mirroring the original `RPCListener` interface: observe
/// dispatch lifecycle without being in the request/response path.
pub trait RpcListener: Send + Sync {
    fn no_found_function(&self, _method: &str) {}
    fn before_handle(&self, _method: &str, _ctx: &RpcContext) {}
    fn on_timeout(&self, _method: &str) {}
    fn on_error(&self, _method: &str, _err: &crate::error::MeshError) {}
    fn on_complete(&self, _method: &str, _exec_time: std::time::Duration) {}
}

/// A no-op listener used when the caller doesn't care to observe dispatch.
#[derive(Default)]
pub struct NoopListener;

impl RpcListener for NoopListener {}
