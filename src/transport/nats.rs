//! NATS-backed [`Transport`] implementation: the default broker substrate
//! the RPC server/client publish and subscribe through.
//!
//! Connection resilience (circuit breaker, reconnect bookkeeping) is
//! grounded in this crate's previous NATS transport layer; the publish/
//! subscribe/request surface is narrowed down to exactly what the RPC layer
//! needs instead of a generic envelope-sender abstraction.

use super::{InboundMessage, Transport};
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Connection lifecycle state, surfaced for observability and to gate
/// reconnect attempts behind a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
    CircuitOpen,
    CircuitHalfOpen,
}

#[derive(Debug)]
struct CircuitBreaker {
    failure_count: u32,
    failure_threshold: u32,
    last_failure: Option<Instant>,
    recovery_timeout: Duration,
    state: ConnectionState,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_count: 0,
            failure_threshold,
            last_failure: None,
            recovery_timeout,
            state: ConnectionState::Connected,
        }
    }

    fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = ConnectionState::Connected;
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.failure_count >= self.failure_threshold {
            self.state = ConnectionState::CircuitOpen;
        }
    }

    fn can_attempt(&mut self) -> bool {
        match self.state {
            ConnectionState::CircuitOpen => {
                if self.last_failure.map(|t| t.elapsed() >= self.recovery_timeout).unwrap_or(false) {
                    self.state = ConnectionState::CircuitHalfOpen;
                    true
                } else {
                    false
                }
            }
            _ => true,
        }
    }
}

/// NATS-backed transport. One instance per node; `node_id` seeds the node's
/// private reply-inbox subject used by [`Transport::request`].
pub struct NatsTransport {
    client: async_nats::Client,
    node_id: String,
    breaker: RwLock<CircuitBreaker>,
    reconnect_attempts: AtomicU32,
}

impl NatsTransport {
    /// Connect to `addr`, retrying per `max_reconnects` as configured on the
    /// `async_nats` connector itself (NATS handles the retry loop; this
    /// wrapper only tracks circuit-breaker state around request/publish
    /// calls made after the connection is established).
    pub async fn connect(addr: &str, node_id: impl Into<String>, max_reconnects: usize) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .max_reconnects(Some(max_reconnects))
            .connect(addr)
            .await?;
        Ok(Self {
            client,
            node_id: node_id.into(),
            breaker: RwLock::new(CircuitBreaker::new(5, Duration::from_secs(30))),
            reconnect_attempts: AtomicU32::new(0),
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.breaker.read().await.state
    }

    async fn guarded<T, F>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        {
            let mut breaker = self.breaker.write().await;
            if !breaker.can_attempt() {
                return Err(MeshError::transport("NATS circuit breaker open"));
            }
        }
        match op.await {
            Ok(v) => {
                self.breaker.write().await.record_success();
                Ok(v)
            }
            Err(e) => {
                self.breaker.write().await.record_failure();
                self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.guarded(async {
            self.client
                .publish(subject.to_string(), payload.into())
                .await
                .map_err(|e| MeshError::transport(e.to_string()))
        })
        .await
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        self.guarded(async {
            let fut = self.client.request(subject.to_string(), payload.into());
            let msg = tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| MeshError::timeout(subject.to_string()))?
                .map_err(|e| MeshError::transport(e.to_string()))?;
            Ok(msg.payload.to_vec())
        })
        .await
    }

    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, InboundMessage>> {
        let sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| MeshError::transport(e.to_string()))?;
        Ok(sub
            .map(|msg| InboundMessage {
                subject: msg.subject.to_string(),
                payload: msg.payload.to_vec(),
                reply_to: msg.reply.map(|r| r.to_string()),
            })
            .boxed())
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_breaker_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(1));
        assert!(breaker.can_attempt());
        breaker.record_failure();
        assert!(breaker.can_attempt());
        breaker.record_failure();
        assert_eq!(breaker.state, ConnectionState::CircuitOpen);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn circuit_breaker_recovers_after_success() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(1));
        breaker.record_failure();
        assert_eq!(breaker.state, ConnectionState::CircuitOpen);
        // Simulate recovery timeout elapsed by constructing a fresh breaker
        // with zero timeout instead of sleeping in a unit test.
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.can_attempt());
        breaker.record_success();
        assert_eq!(breaker.state, ConnectionState::Connected);
    }
}
