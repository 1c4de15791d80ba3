//! TCP, TLS and optional WebSocket accept loops: turn incoming connections
//! into [`Session`]/[`Agent`] pairs and hand each off to [`run_agent`] (or,
//! for WebSocket, an equivalent message-based loop).
//!
//! Grounded in `gate/base/module.go`'s `Run`, which conditionally starts a
//! `network.WSServer` and/or `network.TCPServer` based on which addresses are
//! configured, optionally wrapped in TLS when `opts.TLS` is set. This crate
//! keeps the same "start whichever listeners are configured" shape but splits
//! it into a dedicated accept-loop type the gateway module owns rather than
//! running the loop inline in the module's own `run`.

use crate::error::{MeshError, Result};
use crate::gateway::agent::{
    dispatch_frame, Agent, AgentLearner, ConnectionListener, NoopAgentLearner, NoopConnectionListener, RouteHandler,
};
use crate::gateway::frame::FrameCodec;
use crate::gateway::session::{Session, SharedSessionStore};
use crate::module::handle::AppHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Everything an accept loop needs to turn an accepted socket into a running
/// [`crate::gateway::agent::Agent`].
pub struct ListenerContext {
    pub codec: Arc<FrameCodec>,
    pub handle: Arc<AppHandle>,
    pub store: SharedSessionStore,
    pub heartbeat_timeout: Duration,
    pub agent_learner: Arc<dyn AgentLearner>,
    pub connection_listener: Arc<dyn ConnectionListener>,
    pub route: Option<RouteHandler>,
}

impl ListenerContext {
    pub fn new(codec: Arc<FrameCodec>, handle: Arc<AppHandle>, store: SharedSessionStore, heartbeat_timeout: Duration) -> Self {
        Self {
            codec,
            handle,
            store,
            heartbeat_timeout,
            agent_learner: Arc::new(NoopAgentLearner),
            connection_listener: Arc::new(NoopConnectionListener),
            route: None,
        }
    }

    pub fn with_agent_learner(mut self, agent_learner: Arc<dyn AgentLearner>) -> Self {
        self.agent_learner = agent_learner;
        self
    }

    pub fn with_connection_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.connection_listener = listener;
        self
    }

    pub fn with_route(mut self, route: RouteHandler) -> Self {
        self.route = Some(route);
        self
    }
}

/// A plain-TCP (optionally TLS-wrapped) accept loop: one [`Session`]/`Agent`
/// pair per connection, each driven on its own task. Shut down by cancelling
/// the token passed to [`GatewayListener::serve`]/`serve_tls`.
pub struct GatewayListener {
    ctx: Arc<ListenerContext>,
    server_id: String,
}

impl GatewayListener {
    pub fn new(ctx: Arc<ListenerContext>, server_id: impl Into<String>) -> Self {
        Self { ctx, server_id: server_id.into() }
    }

    /// Bind `addr` and accept plaintext connections until `cancel` fires.
    pub async fn serve(&self, addr: &str, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(|e| MeshError::transport(format!("bind {addr}: {e}")))?;
        tracing::info!(addr, "gateway tcp listener accepting connections");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "gateway accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let ip = peer.ip().to_string();
                    let (reader, writer) = stream.into_split();
                    self.spawn_agent(reader, writer, ip, "tcp");
                }
            }
        }
        Ok(())
    }

    /// Bind `addr` and accept TLS connections, handshaking each accepted
    /// socket through `acceptor` before handing it to the same agent loop
    /// the plaintext listener uses.
    #[cfg(feature = "tls")]
    pub async fn serve_tls(
        &self,
        addr: &str,
        acceptor: tokio_rustls::TlsAcceptor,
        cancel: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(|e| MeshError::transport(format!("bind {addr}: {e}")))?;
        tracing::info!(addr, "gateway tls listener accepting connections");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "gateway accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let ip = peer.ip().to_string();
                    let acceptor = acceptor.clone();
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let (reader, writer) = tokio::io::split(tls_stream);
                            self.spawn_agent(reader, writer, ip, "tls");
                        }
                        Err(e) => tracing::warn!(error = %e, "gateway tls handshake failed"),
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_agent<R, W>(&self, reader: R, writer: W, ip: String, network: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session::new(ip, network, self.server_id.clone());
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            crate::gateway::agent::run_agent(
                reader,
                writer,
                ctx.codec.clone(),
                ctx.handle.clone(),
                ctx.store.clone(),
                session,
                ctx.heartbeat_timeout,
                ctx.agent_learner.clone(),
                ctx.connection_listener.clone(),
                ctx.route.clone(),
            )
            .await;
        });
    }
}

/// Loads a [`tokio_rustls::TlsAcceptor`] from a PEM certificate chain and
/// private key, the way `gate/base/module.go` builds its `tls.Config` from
/// `opts.CertFile`/`KeyFile`.
#[cfg(feature = "tls")]
pub fn load_tls_acceptor(cert_file: &str, key_file: &str) -> Result<tokio_rustls::TlsAcceptor> {
    use std::io::BufReader;

    let cert_bytes = std::fs::read(cert_file).map_err(|e| MeshError::config(format!("read {cert_file}: {e}")))?;
    let key_bytes = std::fs::read(key_file).map_err(|e| MeshError::config(format!("read {key_file}: {e}")))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_bytes.as_slice()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MeshError::config(format!("parse {cert_file}: {e}")))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_bytes.as_slice()))
        .map_err(|e| MeshError::config(format!("parse {key_file}: {e}")))?
        .ok_or_else(|| MeshError::config(format!("{key_file} contains no private key")))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| MeshError::config(format!("build tls config: {e}")))?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

/// A WebSocket accept loop. Each socket gets its own [`Agent`], but frames
/// arrive as whole messages rather than a byte stream, so this drives its
/// own read/write loops directly against the agent instead of going through
/// [`run_agent`] (grounded in the same doc note on
/// [`crate::gateway::agent::dispatch_frame`]).
#[cfg(feature = "gateway")]
pub struct WebSocketListener {
    ctx: Arc<ListenerContext>,
    server_id: String,
}

#[cfg(feature = "gateway")]
impl WebSocketListener {
    pub fn new(ctx: Arc<ListenerContext>, server_id: impl Into<String>) -> Self {
        Self { ctx, server_id: server_id.into() }
    }

    pub async fn serve(&self, addr: &str, cancel: CancellationToken) -> Result<()> {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let listener = TcpListener::bind(addr).await.map_err(|e| MeshError::transport(format!("bind {addr}: {e}")))?;
        tracing::info!(addr, "gateway websocket listener accepting connections");

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "gateway accept failed");
                        continue;
                    }
                },
            };

            let ctx = self.ctx.clone();
            let server_id = self.server_id.clone();
            let ip = peer.ip().to_string();
            let child_cancel = cancel.clone();

            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        tracing::warn!(error = %e, "websocket handshake failed");
                        return;
                    }
                };
                let (mut sink, mut stream) = ws.split();
                let session = Session::new(ip, "ws", server_id);
                let (agent, mut outbound_rx) = Agent::new(
                    session.clone(),
                    ctx.codec.clone(),
                    ctx.handle.clone(),
                    ctx.store.clone(),
                    ctx.heartbeat_timeout,
                );

                let write_task = tokio::spawn(async move {
                    while let Some(frame) = outbound_rx.recv().await {
                        if sink.send(Message::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                });

                agent.mark_ready();
                ctx.agent_learner.on_ready(agent.clone()).await;
                ctx.connection_listener.on_connect(session.clone()).await;

                loop {
                    let next = tokio::time::timeout(ctx.heartbeat_timeout, stream.next());
                    let message = tokio::select! {
                        _ = child_cancel.cancelled() => break,
                        result = next => match result {
                            Ok(Some(Ok(message))) => message,
                            Ok(Some(Err(e))) => {
                                tracing::debug!(error = %e, "websocket read failed, closing connection");
                                break;
                            }
                            Ok(None) => break,
                            Err(_) => {
                                tracing::info!(session = %session.session_id, "agent heartbeat timed out");
                                break;
                            }
                        },
                    };

                    let bytes = match message {
                        Message::Binary(bytes) => bytes,
                        Message::Close(_) => break,
                        Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_) => continue,
                    };
                    match ctx.codec.decode_frame(&bytes) {
                        Ok(Some((topic, payload))) => dispatch_frame(&agent, ctx.route.clone(), topic, payload).await,
                        Ok(None) => continue, // keep-alive
                        Err(e) => {
                            tracing::debug!(error = %e, "websocket frame decode failed, closing connection");
                            break;
                        }
                    }
                }

                write_task.abort();
                agent.mark_closed();
                ctx.agent_learner.on_closed(agent.clone()).await;
                ctx.connection_listener.on_disconnect(session.clone()).await;
                tracing::info!(session = %session.session_id, "websocket agent closed");
            });
        }
        Ok(())
    }
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
    use tokio::io::AsyncWriteExt as _;

    fn handle() -> Arc<AppHandle> {
        let registry = MockRegistry::new();
        let selector = Selector::new(registry);
        let bus = MockBus::new();
        let transport: SharedTransport = Arc::new(MockTransport::new(bus, "gateway@i-1"));
        let client = Arc::new(RpcClient::new(transport));
        Arc::new(AppHandle::new(selector, client, None))
    }

    #[tokio::test]
    async fn accepted_connection_gets_its_own_agent() {
        let ctx = Arc::new(ListenerContext::new(
            Arc::new(FrameCodec::plain()),
            handle(),
            InMemorySessionStore::new(),
            Duration::from_secs(90),
        ));
        let server = GatewayListener::new(ctx, "gateway@i-1");
        let cancel = CancellationToken::new();

        let bind_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = bind_listener.local_addr().unwrap();
        drop(bind_listener);

        let server_cancel = cancel.clone();
        let addr_string = addr.to_string();
        let serve_task = tokio::spawn(async move { server.serve(&addr_string, server_cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(&2u16.to_le_bytes()).await.unwrap(); // zero-length keep-alive frame

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let _ = serve_task.await;
    }
}
