//! Transport adapter: the publish/subscribe substrate the RPC layer is
//! mediated over. Abstracted behind a trait so the RPC server/client can be
//! exercised against an in-memory [`mock::MockTransport`] in tests without a
//! live broker, and so a different broker could stand in for NATS later
//! without touching `rpc::server`/`rpc::client`.

#[cfg(feature = "nats")]
pub mod nats;

pub mod mock;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A single message received off a subscription.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Subject to publish a reply to, if the underlying transport supports
    /// request/reply natively (NATS does, via its own inbox subject).
    pub reply_to: Option<String>,
}

/// Transport-agnostic publish/subscribe substrate.
///
/// Implementors only need to move bytes; message shape (RpcInfo/ResultInfo
/// encoding) is entirely the RPC layer's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Publish to `subject` expecting a single reply within `timeout`.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>>;

    /// Subscribe to `subject`, returning a stream of inbound messages.
    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, InboundMessage>>;

    /// Node identity this transport instance is connecting as, used to build
    /// the per-node reply inbox subject.
    fn node_id(&self) -> &str;
}

/// Shared, cloneable handle to a transport implementation.
pub type SharedTransport = std::sync::Arc<dyn Transport>;

/// A [`Transport`] that delegates all I/O to a shared broker connection but
/// reports a different `node_id`.
///
/// One process hosts many modules, each with its own globally-unique
/// `<moduleType>@<instanceId>` node id, but they don't each need their own
/// broker connection: the module runtime opens a single [`Transport`] at
/// application-shell startup and hands every module a [`ScopedTransport`]
/// wrapping it, so each module's [`crate::rpc::RpcServer`]/[`crate::rpc::RpcClient`]
/// subscribes under its own subject without a redundant reconnect per module.
pub struct ScopedTransport {
    inner: SharedTransport,
    node_id: String,
}

impl ScopedTransport {
    pub fn new(inner: SharedTransport, node_id: impl Into<String>) -> Self {
        Self { inner, node_id: node_id.into() }
    }
}

#[async_trait]
impl Transport for ScopedTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.inner.publish(subject, payload).await
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>> {
        self.inner.request(subject, payload, timeout).await
    }

    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, InboundMessage>> {
        self.inner.subscribe(subject).await
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }
}
