//! Gateway delegate: the per-gateway-node session registry and the ten RPC
//! methods other modules call to act on a connected client.
//!
//! Grounded in `gate/base/delegate.go`'s `Delegate`, which plays two roles at
//! once: the `IAgentLearner` that tracks every live `Agent` by session id
//! (`Connect`/`DisConnect`), and the RPC-facing `OnRpcLoad`/`OnRpcBind`/.../
//! `OnRpcBroadcast` handlers other modules reach through `gateway.Call`. This
//! crate keeps the same split but expresses it as two traits on one type:
//! [`crate::gateway::agent::AgentLearner`] for the session-map bookkeeping,
//! and [`GatewayDelegate::register_methods`] for the RPC surface, both
//! implemented by this one struct so there's a single source of truth for
//! "which sessions are live right now".

use crate::codec::{from_msgpack_arg, to_msgpack_arg, Arg, FromArg};
use crate::error::{MeshError, Result};
use crate::gateway::agent::{Agent, AgentLearner};
use crate::gateway::session::SharedSessionStore;
use crate::rpc::server::RpcServer;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Everything a remote caller can learn about a session via `Load`, without
/// handing out the live [`Agent`] itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub ip: String,
    pub network: String,
    pub settings: HashMap<String, String>,
}

/// Per-gateway-node-local registry of connected agents, plus the RPC methods
/// `gate/base/module.go`'s `Init` registers against `this.GetServer()`.
///
/// All ten methods operate only on sessions local to this gateway instance,
/// matching the original: there is no cross-node session lookup, a caller
/// must already have resolved the owning gateway node (typically because the
/// client's own default-dispatch sticky binding routed the reply there).
pub struct GatewayDelegate {
    agents: DashMap<String, Arc<Agent>>,
    agent_count: AtomicUsize,
    store: SharedSessionStore,
}

impl GatewayDelegate {
    pub fn new(store: SharedSessionStore) -> Arc<Self> {
        Arc::new(Self { agents: DashMap::new(), agent_count: AtomicUsize::new(0), store })
    }

    pub fn agent_count(&self) -> usize {
        self.agent_count.load(Ordering::SeqCst)
    }

    pub fn get_agent(&self, session_id: &str) -> Option<Arc<Agent>> {
        self.agents.get(session_id).map(|e| e.clone())
    }

    /// Every agent currently live on this gateway, e.g. to close them all on
    /// module shutdown.
    pub fn live_agents(&self) -> Vec<Arc<Agent>> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    async fn snapshot(&self, agent: &Agent) -> SessionSnapshot {
        SessionSnapshot {
            session_id: agent.session.session_id.clone(),
            user_id: agent.session.user_id().await,
            ip: agent.session.ip.clone(),
            network: agent.session.network.clone(),
            settings: agent.session.settings_snapshot().await,
        }
    }

    fn require_agent(&self, session_id: &str) -> Result<Arc<Agent>> {
        self.get_agent(session_id)
            .ok_or_else(|| MeshError::gateway(format!("no session '{session_id}' on this gateway")))
    }

    fn arg_at(args: &[Arg], index: usize) -> Result<&Arg> {
        args.get(index).ok_or_else(|| MeshError::codec(format!("missing RPC argument at index {index}")))
    }

    async fn load(&self, args: Vec<Arg>) -> Result<Arg> {
        let session_id = String::from_arg(Self::arg_at(&args, 0)?)?;
        let agent = self.require_agent(&session_id)?;
        to_msgpack_arg("SessionSnapshot", &self.snapshot(&agent).await)
    }

    async fn bind(&self, args: Vec<Arg>) -> Result<Arg> {
        let session_id = String::from_arg(Self::arg_at(&args, 0)?)?;
        let user_id = String::from_arg(Self::arg_at(&args, 1)?)?;
        let agent = self.require_agent(&session_id)?;
        agent.session.bind(&user_id, self.store.as_ref()).await?;
        ().to_arg()
    }

    async fn unbind(&self, args: Vec<Arg>) -> Result<Arg> {
        let session_id = String::from_arg(Self::arg_at(&args, 0)?)?;
        let agent = self.require_agent(&session_id)?;
        agent.session.unbind().await;
        ().to_arg()
    }

    async fn push(&self, args: Vec<Arg>) -> Result<Arg> {
        let session_id = String::from_arg(Self::arg_at(&args, 0)?)?;
        let settings: HashMap<String, String> = from_msgpack_arg(Self::arg_at(&args, 1)?)?;
        let agent = self.require_agent(&session_id)?;
        agent.session.push(settings, self.store.as_ref()).await?;
        ().to_arg()
    }

    async fn set(&self, args: Vec<Arg>) -> Result<Arg> {
        let session_id = String::from_arg(Self::arg_at(&args, 0)?)?;
        let key = String::from_arg(Self::arg_at(&args, 1)?)?;
        let value = String::from_arg(Self::arg_at(&args, 2)?)?;
        let agent = self.require_agent(&session_id)?;
        agent.session.set(&key, &value, self.store.as_ref()).await?;
        ().to_arg()
    }

    async fn del(&self, args: Vec<Arg>) -> Result<Arg> {
        let session_id = String::from_arg(Self::arg_at(&args, 0)?)?;
        let key = String::from_arg(Self::arg_at(&args, 1)?)?;
        let agent = self.require_agent(&session_id)?;
        agent.session.del(&key, self.store.as_ref()).await?;
        ().to_arg()
    }

    async fn send(&self, args: Vec<Arg>) -> Result<Arg> {
        let session_id = String::from_arg(Self::arg_at(&args, 0)?)?;
        let topic = String::from_arg(Self::arg_at(&args, 1)?)?;
        let body = Vec::<u8>::from_arg(Self::arg_at(&args, 2)?)?;
        let agent = self.require_agent(&session_id)?;
        agent.send_pack(&topic, &body)?;
        ().to_arg()
    }

    /// Whether `sessionId` is currently connected to this gateway.
    ///
    /// The original (`OnRpcConnected`) returns `agent.IsClosed()` under the
    /// name `Connected`, which inverts the name against the value — almost
    /// certainly a latent bug, since every caller of a method named
    /// `Connected` would read a `true` result as "yes, connected". This
    /// implementation reports the sense the name promises; see DESIGN.md.
    async fn connected(&self, args: Vec<Arg>) -> Result<Arg> {
        let session_id = String::from_arg(Self::arg_at(&args, 0)?)?;
        let is_connected = self.get_agent(&session_id).is_some();
        is_connected.to_arg()
    }

    async fn close(&self, args: Vec<Arg>) -> Result<Arg> {
        let session_id = String::from_arg(Self::arg_at(&args, 0)?)?;
        let agent = self.require_agent(&session_id)?;
        agent.request_close();
        ().to_arg()
    }

    /// Send `(topic, body)` to every session live on this gateway, returning
    /// the number of sessions it was enqueued for.
    async fn broadcast(&self, args: Vec<Arg>) -> Result<Arg> {
        let topic = String::from_arg(Self::arg_at(&args, 0)?)?;
        let body = Vec::<u8>::from_arg(Self::arg_at(&args, 1)?)?;
        let mut sent = 0i64;
        for entry in self.agents.iter() {
            if entry.value().send_pack(&topic, &body).is_ok() {
                sent += 1;
            }
        }
        sent.to_arg()
    }

    /// Register all ten methods on `server`, matching the original's
    /// `RegisterGO` (goroutine/parallel dispatch) for every gateway method.
    pub fn register_methods(self: &Arc<Self>, server: &RpcServer) {
        macro_rules! register {
            ($name:literal, $method:ident) => {
                let me = self.clone();
                server.register_parallel($name, Arc::new(move |_ctx, args| {
                    let me = me.clone();
                    Box::pin(async move { me.$method(args).await })
                }));
            };
        }
        register!("Load", load);
        register!("Bind", bind);
        register!("UnBind", unbind);
        register!("Push", push);
        register!("Set", set);
        register!("Del", del);
        register!("Send", send);
        register!("Connected", connected);
        register!("Close", close);
        register!("Broadcast", broadcast);
    }
}

#[async_trait::async_trait]
impl AgentLearner for GatewayDelegate {
    async fn on_ready(&self, agent: Arc<Agent>) {
        self.agents.insert(agent.session.session_id.clone(), agent);
        self.agent_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_closed(&self, agent: Arc<Agent>) {
        if self.agents.remove(&agent.session.session_id).is_some() {
            self.agent_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
