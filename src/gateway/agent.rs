//! Client agent: the per-connection read/write loop pair, frame codec,
//! heartbeat enforcement, and default topic dispatch (§4.7).
//!
//! Grounded in the original agent's two-goroutine (read/write) shape and
//! its read-deadline-as-heartbeat contract; `tokio::io::split` plus a
//! dedicated write task stand in for the two goroutines, and
//! `tokio::time::timeout` around each frame read enforces the deadline the
//! same way a `SetReadDeadline` call does on the Go side.

use crate::constants::gateway::RPC_CLIENT_MSG;
use crate::constants::limits::DEFAULT_AGENT_SEND_CHANNEL_CAPACITY;
use crate::error::{MeshError, Result};
use crate::gateway::frame::FrameCodec;
use crate::gateway::session::{Session, SharedSessionStore};
use crate::module::handle::AppHandle;
use crate::rpc::context::RpcContext;
use crate::selector::SelectOptions;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle, matching the original's `Accepted -> Handshaking
/// -> Ready -> Closing -> Closed` state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Accepted,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

impl AgentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Accepted,
            1 => Self::Handshaking,
            2 => Self::Ready,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// A caller-installed handler that takes over frame dispatch entirely,
/// bypassing the gateway's default `moduleType/methodId` topic splitting.
/// Installed once on the [`crate::gateway::listener::GatewayListener`].
pub type RouteHandler = Arc<
    dyn Fn(Arc<Session>, String, Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync,
>;

/// Business-facing lifecycle hooks, fired on agent `Ready` and `Closed`
/// transitions.
#[async_trait::async_trait]
pub trait ConnectionListener: Send + Sync {
    async fn on_connect(&self, _session: Arc<Session>) {}
    async fn on_disconnect(&self, _session: Arc<Session>) {}
}

pub struct NoopConnectionListener;

#[async_trait::async_trait]
impl ConnectionListener for NoopConnectionListener {}

/// The gateway's own internal bookkeeping hook, distinct from the
/// business-facing [`ConnectionListener`] above.
///
/// Grounded in the original `Delegate`'s dual role (`gate/base/delegate.go`):
/// it implements `IAgentLearner` to track every live agent in its own session
/// map (for `Load`/`Bind`/.../`Broadcast` to operate on) *and* separately
/// forwards to whatever business `SessionLearner` the integrator installed.
/// This crate keeps that as two distinct traits on two distinct parameters
/// rather than one object wearing both hats, so [`run_agent`] doesn't need to
/// know the gateway's delegate type at all.
#[async_trait::async_trait]
pub trait AgentLearner: Send + Sync {
    async fn on_ready(&self, _agent: Arc<Agent>) {}
    async fn on_closed(&self, _agent: Arc<Agent>) {}
}

pub struct NoopAgentLearner;

#[async_trait::async_trait]
impl AgentLearner for NoopAgentLearner {}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(s: AgentState) -> Self {
        Self(AtomicU8::new(s as u8))
    }

    fn get(&self) -> AgentState {
        AgentState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, s: AgentState) {
        self.0.store(s as u8, Ordering::SeqCst);
    }
}

/// A single client connection: owns its wire I/O exclusively, carries one
/// [`Session`], and dispatches inbound frames into the mesh via
/// [`AppHandle`].
pub struct Agent {
    pub session: Arc<Session>,
    state: AtomicState,
    outbound: mpsc::Sender<Vec<u8>>,
    codec: Arc<FrameCodec>,
    handle: Arc<AppHandle>,
    store: SharedSessionStore,
    heartbeat_timeout: Duration,
    close_signal: CancellationToken,
}

impl Agent {
    /// Build an agent and its outbound channel. The caller (the TCP
    /// `run_agent` loop below, or the WebSocket listener) owns driving the
    /// actual wire I/O; this just assembles the shared dispatch state.
    pub(crate) fn new(
        session: Arc<Session>,
        codec: Arc<FrameCodec>,
        handle: Arc<AppHandle>,
        store: SharedSessionStore,
        heartbeat_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, outbound_rx) = mpsc::channel(DEFAULT_AGENT_SEND_CHANNEL_CAPACITY);
        let agent = Arc::new(Self {
            session,
            state: AtomicState::new(AgentState::Handshaking),
            outbound,
            codec,
            handle,
            store,
            heartbeat_timeout,
            close_signal: CancellationToken::new(),
        });
        (agent, outbound_rx)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn state(&self) -> AgentState {
        self.state.get()
    }

    pub(crate) fn mark_ready(&self) {
        self.state.set(AgentState::Ready);
    }

    pub(crate) fn mark_closed(&self) {
        self.state.set(AgentState::Closed);
    }

    /// Encode and enqueue `(topic, payload)` for the write loop. Returns
    /// [`MeshError::gateway`] ("TooManyUnsent"-equivalent) if the bounded
    /// outbound channel is full rather than blocking the caller.
    pub fn send_pack(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let frame = self.codec.encode(topic, payload)?;
        self.outbound
            .try_send(frame)
            .map_err(|_| MeshError::gateway("TooManyUnsent: agent outbound channel is full"))
    }

    fn close(&self) {
        self.state.set(AgentState::Closing);
    }

    /// Request this connection close from outside the read loop, e.g. the
    /// gateway's `Close` RPC method (§4.7) acting on a session id. Marks the
    /// state `Closing` immediately and unblocks `receive_loop`'s next
    /// iteration the same tick, rather than waiting out the heartbeat
    /// timeout; `run_agent` finishes the transition to `Closed` once the
    /// read loop actually returns.
    pub fn request_close(&self) {
        self.state.set(AgentState::Closing);
        self.close_signal.cancel();
    }
}

/// Drive one accepted connection to completion: spawns the write loop,
/// runs the read loop inline, and returns once the connection closes for
/// any reason. `listener` is notified on `Ready`/`Closed`; `route` overrides
/// the default topic dispatch when installed.
#[allow(clippy::too_many_arguments)]
pub async fn run_agent<R, W>(
    reader: R,
    writer: W,
    codec: Arc<FrameCodec>,
    handle: Arc<AppHandle>,
    store: SharedSessionStore,
    session: Arc<Session>,
    heartbeat_timeout: Duration,
    agent_learner: Arc<dyn AgentLearner>,
    listener: Arc<dyn ConnectionListener>,
    route: Option<RouteHandler>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (agent, outbound_rx) = Agent::new(session.clone(), codec, handle, store, heartbeat_timeout);

    let write_task = tokio::spawn(send_loop(writer, outbound_rx));

    agent.mark_ready();
    agent_learner.on_ready(agent.clone()).await;
    listener.on_connect(session.clone()).await;
    tracing::info!(session = %session.session_id, "agent ready");

    receive_loop(&agent, reader, route).await;

    agent.close();
    write_task.abort();
    agent.mark_closed();
    agent_learner.on_closed(agent.clone()).await;
    listener.on_disconnect(session.clone()).await;
    tracing::info!(session = %session.session_id, "agent closed");
}

async fn send_loop<W: AsyncWrite + Unpin>(mut writer: W, mut outbound_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::warn!(error = %e, "agent write failed, closing connection");
            break;
        }
    }
}

async fn receive_loop<R: AsyncRead + Unpin>(agent: &Arc<Agent>, mut reader: R, route: Option<RouteHandler>) {
    loop {
        let read = tokio::time::timeout(agent.heartbeat_timeout, agent.codec.read_frame(&mut reader));
        let frame = tokio::select! {
            _ = agent.close_signal.cancelled() => {
                tracing::info!(session = %agent.session.session_id, "agent closed by request");
                break;
            }
            result = read => match result {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => continue, // zero-length body: keep-alive, no dispatch
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "agent frame decode failed, closing connection");
                    break;
                }
                Err(_) => {
                    tracing::info!(session = %agent.session.session_id, "agent heartbeat timed out");
                    break;
                }
            },
        };

        let (topic, payload) = frame;
        dispatch_frame(agent, route.clone(), topic, payload).await;
    }
}

/// Route one decoded `(topic, payload)` pair: through `route` if the caller
/// installed one, otherwise through [`default_dispatch`]. Shared between the
/// TCP read loop above and the WebSocket listener, which decodes whole
/// messages rather than a byte stream but dispatches identically.
pub(crate) async fn dispatch_frame(agent: &Arc<Agent>, route: Option<RouteHandler>, topic: String, payload: Vec<u8>) {
    let result = match route {
        Some(handler) => handler(agent.session.clone(), topic, payload).await,
        None => default_dispatch(agent, topic, payload).await,
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "agent frame dispatch failed");
    }
}

/// Default topic dispatch: split `moduleType/methodId`, resolve the target
/// node (sticky via a prior session-settings binding, else selector), and
/// fire `RPC_CLIENT_MSG(sessionId, methodId, payload)` at it without
/// waiting for a reply — the target answers the client asynchronously via
/// the gateway's own `Send` RPC method (§4.7 scenario 5).
async fn default_dispatch(agent: &Arc<Agent>, topic: String, payload: Vec<u8>) -> Result<()> {
    let Some((module_type, method_id)) = topic.split_once('/') else {
        return Err(MeshError::gateway(format!("topic '{topic}' is not 'moduleType/methodId'")));
    };

    let sticky = agent.session.get(module_type).await;
    let session_id = agent.session.session_id.clone();
    let ctx = RpcContext::new_root();

    let session_for_route = agent.handle.clone();
    let route_session = agent.session.clone();
    let store = agent.store.clone();

    let target = match sticky {
        Some(node_id) => session_for_route.get_by_id(&node_id).await,
        None => session_for_route.get_by_selector(module_type, &SelectOptions::default()).await,
    }?;

    if sticky.is_none() {
        route_session.set(module_type, &target.node().id, store.as_ref()).await?;
    }

    let args = vec![
        crate::codec::Arg::new("string", session_id.into_bytes()),
        crate::codec::Arg::new("string", method_id.as_bytes().to_vec()),
        crate::codec::Arg::new("bytes", payload),
    ];
    target.call_no_reply(RPC_CLIENT_MSG, args, &ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::InMemorySessionStore;
    use crate::registry::mock::MockRegistry;
    use crate::rpc::client::RpcClient;
    use crate::selector::Selector;
    use crate::transport::mock::{MockBus, MockTransport};
    use crate::transport::SharedTransport;

    fn handle() -> Arc<AppHandle> {
        let registry = MockRegistry::new();
        let selector = Selector::new(registry);
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "gateway@i-1"));
        let client = Arc::new(RpcClient::new(transport));
        Arc::new(AppHandle::new(selector, client, None))
    }

    #[tokio::test]
    async fn send_pack_encodes_and_enqueues() {
        let (tx, mut rx) = mpsc::channel(4);
        let agent = Agent {
            session: Session::new("127.0.0.1", "tcp", "gateway@i-1"),
            state: AtomicState::new(AgentState::Ready),
            outbound: tx,
            codec: Arc::new(FrameCodec::plain()),
            handle: handle(),
            store: InMemorySessionStore::new(),
            heartbeat_timeout: Duration::from_secs(90),
            close_signal: tokio_util::sync::CancellationToken::new(),
        };
        agent.send_pack("a/b", b"hi").unwrap();
        let frame = rx.recv().await.unwrap();
        let total_len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(total_len, frame.len());
    }

    #[tokio::test]
    async fn send_pack_reports_overflow_on_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let agent = Agent {
            session: Session::new("127.0.0.1", "tcp", "gateway@i-1"),
            state: AtomicState::new(AgentState::Ready),
            outbound: tx,
            codec: Arc::new(FrameCodec::plain()),
            handle: handle(),
            store: InMemorySessionStore::new(),
            heartbeat_timeout: Duration::from_secs(90),
            close_signal: tokio_util::sync::CancellationToken::new(),
        };
        agent.send_pack("a", b"1").unwrap();
        let err = agent.send_pack("a", b"2").unwrap_err();
        assert!(matches!(err, MeshError::Gateway(_)));
    }

    #[tokio::test]
    async fn default_dispatch_rejects_topic_without_slash() {
        let agent = Arc::new(Agent {
            session: Session::new("127.0.0.1", "tcp", "gateway@i-1"),
            state: AtomicState::new(AgentState::Ready),
            outbound: mpsc::channel(4).0,
            codec: Arc::new(FrameCodec::plain()),
            handle: handle(),
            store: InMemorySessionStore::new(),
            heartbeat_timeout: Duration::from_secs(90),
            close_signal: CancellationToken::new(),
        });
        let err = default_dispatch(&agent, "no-slash".to_string(), vec![]).await.unwrap_err();
        assert!(matches!(err, MeshError::Gateway(_)));
    }
}
