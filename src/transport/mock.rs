//! In-process transport used by tests: an in-memory publish/subscribe bus
//! with no network I/O, so the RPC server and client can be exercised
//! end-to-end without a live NATS broker.

use super::{InboundMessage, Transport};
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Shared in-memory bus backing one or more [`MockTransport`] handles. Tests
/// create one bus and hand a `MockTransport` per simulated node to the
/// collaborators under test.
#[derive(Default)]
pub struct MockBus {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<InboundMessage>>>,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn publish(&self, subject: &str, payload: Vec<u8>, reply_to: Option<String>) {
        if let Some(subs) = self.subscribers.get(subject) {
            for tx in subs.iter() {
                let _ = tx.send(InboundMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply_to: reply_to.clone(),
                });
            }
        }
    }

    fn subscribe(&self, subject: &str) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(subject.to_string()).or_default().push(tx);
        rx
    }
}

pub struct MockTransport {
    bus: Arc<MockBus>,
    node_id: String,
}

impl MockTransport {
    pub fn new(bus: Arc<MockBus>, node_id: impl Into<String>) -> Self {
        Self { bus, node_id: node_id.into() }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.bus.publish(subject, payload, None);
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, wait: Duration) -> Result<Vec<u8>> {
        let reply_subject = format!("_mock_reply.{}", uuid::Uuid::new_v4());
        let mut rx = self.bus.subscribe(&reply_subject);
        self.bus.publish(subject, payload, Some(reply_subject));
        let msg = timeout(wait, rx.recv())
            .await
            .map_err(|_| MeshError::timeout(subject.to_string()))?
            .ok_or_else(|| MeshError::transport("reply channel closed"))?;
        Ok(msg.payload)
    }

    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, InboundMessage>> {
        let rx = self.bus.subscribe(subject);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })
        .boxed())
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Helper for request/reply-style tests: publish a reply to `reply_to` as a
/// server handler would via the transport's own reply subject.
pub async fn reply(bus: &Arc<MockBus>, reply_to: &str, payload: Vec<u8>) {
    bus.publish(reply_to, payload, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = MockBus::new();
        let t = MockTransport::new(bus, "node-1");
        let mut sub = t.subscribe("foo").await.unwrap();
        t.publish("foo", b"hi".to_vec()).await.unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(msg.payload, b"hi");
    }

    #[tokio::test]
    async fn request_times_out_with_no_responder() {
        let bus = MockBus::new();
        let t = MockTransport::new(bus, "node-1");
        let res = t.request("nobody", b"x".to_vec(), Duration::from_millis(50)).await;
        assert!(res.is_err());
    }
}
