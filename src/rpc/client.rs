//! RPC client: turns a method name and argument list into an `RpcInfo`
//! request, correlates the reply by id, and resolves a future once the
//! matching `ResultInfo` arrives or the deadline passes.
//!
//! Grounded in the original `RPCClient` (`rpc_client.go`). The original
//! subscribed once to a per-process reply inbox and fanned replies out to
//! per-call buffered channels keyed by correlation id in a `sync.Map`, with
//! a manual `select` against `ctx.Done()` for cancellation. This client
//! keeps the same shape: [`RpcClient::listen`] drives the inbox
//! subscription and calls [`RpcClient::complete`] for each reply, while
//! [`RpcClient::call`] registers a `oneshot::Sender` in a `DashMap` and
//! races it against `tokio::time::timeout`. Rust's ownership model means
//! there's no equivalent of the original's double-close hazard on the
//! callback channel (a `oneshot::Sender` can only be consumed once, and
//! dropping it is always safe), so the `close_callback_chan` recover-guard
//! has no counterpart here.

use crate::codec::Arg;
use crate::error::{MeshError, Result};
use crate::rpc::context::{default_context_key_registry, RpcContext};
use crate::rpc::message::{ResultInfo, RpcInfo};
use crate::transport::SharedTransport;
use dashmap::DashMap;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

pub struct RpcClient {
    transport: SharedTransport,
    pending: DashMap<String, oneshot::Sender<ResultInfo>>,
    hostname: String,
}

impl RpcClient {
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport, pending: DashMap::new(), hostname: local_hostname() }
    }

    /// Subscribe to this node's reply inbox and fan incoming `ResultInfo`
    /// replies out to whichever `call` is waiting on them. Runs until the
    /// subscription ends; spawn this once per client at startup.
    pub async fn listen(&self) -> Result<()> {
        let subject = reply_inbox_subject(self.transport.node_id());
        let mut stream = self.transport.subscribe(&subject).await?;
        while let Some(msg) = stream.next().await {
            if let Ok(result) = rmp_serde::from_slice::<ResultInfo>(&msg.payload) {
                self.complete(result);
            }
        }
        Ok(())
    }

    /// Call `method` on `target_node`, waiting up to `timeout` for a reply.
    /// The current task-local [`RpcContext`]'s translatable subset travels as
    /// `args[0]`, a `context`-tagged argument the server strips back off
    /// before dispatch.
    pub async fn call(
        &self,
        target_node: &str,
        method: &str,
        args: Vec<Arg>,
        ctx: &RpcContext,
        timeout: Duration,
    ) -> Result<Arg> {
        let cid = Uuid::new_v4().simple().to_string();
        let deadline = RpcInfo::now_millis() + timeout.as_millis() as i64;
        let info = self.build_info(cid.clone(), method, args, ctx, deadline, true)?;
        let payload = rmp_serde::to_vec_named(&info)?;
        let subject = format!("{}.{}", crate::constants::subjects::RPC_SUBJECT_PREFIX, target_node);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(cid.clone(), tx);

        if let Err(e) = self.transport.publish(&subject, payload).await {
            self.pending.remove(&cid);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Self::resolve(result),
            Ok(Err(_)) => {
                self.pending.remove(&cid);
                Err(MeshError::internal("reply channel dropped"))
            }
            Err(_) => {
                self.pending.remove(&cid);
                Err(MeshError::timeout(method.to_string()))
            }
        }
    }

    /// Fire-and-forget call: publish the request with `reply: false` and
    /// return as soon as the transport accepts the publish.
    pub async fn call_no_reply(
        &self,
        target_node: &str,
        method: &str,
        args: Vec<Arg>,
        ctx: &RpcContext,
    ) -> Result<()> {
        let deadline = RpcInfo::now_millis() + Duration::from_secs(30).as_millis() as i64;
        let cid = Uuid::new_v4().simple().to_string();
        let info = self.build_info(cid, method, args, ctx, deadline, false)?;
        let payload = rmp_serde::to_vec_named(&info)?;
        let subject = format!("{}.{}", crate::constants::subjects::RPC_SUBJECT_PREFIX, target_node);
        self.transport.publish(&subject, payload).await
    }

    fn build_info(
        &self,
        cid: String,
        method: &str,
        args: Vec<Arg>,
        ctx: &RpcContext,
        deadline: i64,
        reply: bool,
    ) -> Result<RpcInfo> {
        let registry = default_context_key_registry();
        let mut wire_args = Vec::with_capacity(args.len() + 1);
        wire_args.push(ctx.to_context_arg(&registry)?);
        wire_args.extend(args);
        let (args_type, args) = RpcInfo::encode_args(&wire_args);
        Ok(RpcInfo {
            cid,
            method: method.to_string(),
            reply_to: reply_inbox_subject(self.transport.node_id()),
            expired: deadline,
            reply,
            args_type,
            args,
            caller: self.transport.node_id().to_string(),
            hostname: self.hostname.clone(),
        })
    }

    /// Resolve a reply delivered via [`RpcClient::listen`] against whichever
    /// call is waiting for its correlation id. A reply with no matching
    /// pending call (already timed out, or a stray duplicate) is dropped.
    pub fn complete(&self, result: ResultInfo) {
        if let Some((_, tx)) = self.pending.remove(&result.cid) {
            let _ = tx.send(result);
        }
    }

    fn resolve(result: ResultInfo) -> Result<Arg> {
        if let Some(err) = result.error.clone() {
            return Err(MeshError::remote(err));
        }
        result.into_arg().ok_or_else(|| MeshError::internal("reply carried neither result nor error"))
    }
}

/// Best-effort local hostname, matching the original node registration's
/// `os.Hostname()` call; falls back to `"unknown"` rather than failing the
/// client if the OS call errors.
fn local_hostname() -> String {
    hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "unknown".to_string())
}

pub fn reply_inbox_subject(node_id: &str) -> String {
    crate::constants::subjects::RPC_REPLY_SUBJECT_PATTERN.replace("{node_id}", node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FromArg;
    use crate::transport::mock::{MockBus, MockTransport};
    use std::sync::Arc;

    #[tokio::test]
    async fn call_no_reply_publishes_without_waiting() {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "caller"));
        let client = RpcClient::new(transport);
        let ctx = RpcContext::new_root();
        let res = client.call_no_reply("callee", "ping", vec![], &ctx).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn call_times_out_with_no_responder() {
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "caller"));
        let client = RpcClient::new(transport);
        let ctx = RpcContext::new_root();
        let res = client
            .call("ghost-node", "ping", vec![], &ctx, Duration::from_millis(50))
            .await;
        assert!(res.is_err());
    }

    #[test]
    fn resolve_maps_error_to_remote() {
        let result = ResultInfo::err("c", "m", "boom");
        let resolved = RpcClient::resolve(result);
        assert!(matches!(resolved, Err(MeshError::Remote(_))));
    }

    #[tokio::test]
    async fn call_resolves_via_listen_loop() {
        let bus = MockBus::new();
        let caller_transport: SharedTransport = Arc::new(MockTransport::new(bus.clone(), "caller"));
        let callee_transport: SharedTransport = Arc::new(MockTransport::new(bus.clone(), "callee"));
        let client = Arc::new(RpcClient::new(caller_transport));

        let listener_client = client.clone();
        tokio::spawn(async move {
            let _ = listener_client.listen().await;
        });

        // Simulate the callee node's server replying to whatever request it
        // receives, mimicking RpcServer::handle_inbound's reply path.
        let mut sub = callee_transport
            .subscribe(&format!("{}.callee", crate::constants::subjects::RPC_SUBJECT_PREFIX))
            .await
            .unwrap();
        let responder_transport = callee_transport.clone();
        tokio::spawn(async move {
            if let Some(msg) = sub.next().await {
                let info: RpcInfo = rmp_serde::from_slice(&msg.payload).unwrap();
                let result = ResultInfo::ok(info.cid, info.method, Arg::new("bool", vec![1]), 1);
                let reply_subject = reply_inbox_subject("caller");
                let payload = rmp_serde::to_vec_named(&result).unwrap();
                let _ = responder_transport.publish(&reply_subject, payload).await;
            }
        });

        let ctx = RpcContext::new_root();
        let result = client
            .call("callee", "ping", vec![], &ctx, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.tag, "bool");
    }

    #[tokio::test]
    async fn call_prepends_a_context_tagged_argument() {
        let bus = MockBus::new();
        let caller_transport: SharedTransport = Arc::new(MockTransport::new(bus.clone(), "caller"));
        let callee_transport: SharedTransport = Arc::new(MockTransport::new(bus.clone(), "callee"));
        let client = Arc::new(RpcClient::new(caller_transport));
        let listener_client = client.clone();
        tokio::spawn(async move {
            let _ = listener_client.listen().await;
        });

        let mut sub = callee_transport
            .subscribe(&format!("{}.callee", crate::constants::subjects::RPC_SUBJECT_PREFIX))
            .await
            .unwrap();
        tokio::spawn(async move {
            if let Some(msg) = sub.next().await {
                let info: RpcInfo = rmp_serde::from_slice(&msg.payload).unwrap();
                assert_eq!(info.args_type.first().map(String::as_str), Some(crate::codec::CONTEXT_TAG));
                let result = ResultInfo::ok(info.cid, info.method, Arg::new("bool", vec![1]), 0);
                let payload = rmp_serde::to_vec_named(&result).unwrap();
                let _ = callee_transport.publish(&reply_inbox_subject("caller"), payload).await;
            }
        });

        let ctx = RpcContext::new_root();
        let result = client
            .call("callee", "ping", vec![42i32.to_arg().unwrap()], &ctx, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.tag, "bool");
    }
}
