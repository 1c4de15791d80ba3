//! # nodemesh
//!
//! A distributed, modular application framework: long-lived application
//! instances (**nodes**) register themselves into a shared directory,
//! discover each other through it, and call into one another's **modules**
//! over an RPC substrate mediated by a message broker. A built-in
//! **gateway** module bridges that mesh out to external TCP/TLS/WebSocket
//! clients.
//!
//! ## Layout
//!
//! - [`registry`] — the service directory nodes register into and watch.
//! - [`transport`] — the publish/subscribe substrate the RPC layer rides on.
//! - [`rpc`] — request/reply dispatch, context propagation, wire codec.
//! - [`selector`] — read-through node selection over the registry, with
//!   strategies for picking among several instances of the same module type.
//! - [`module`] — the `Module` trait, the manager that owns a node's module
//!   lifecycle, and the handle modules use to call out to each other.
//! - [`gateway`] — the client-facing frame protocol, connection/session
//!   state machine, and the built-in [`gateway::GatewayModule`].
//! - [`config`] — startup flags and the configuration document shape.
//! - [`app`] — the application shell composition root tying the above
//!   together into one node process.
//! - [`codec`] — the wire tagging scheme RPC arguments and results use.
//! - [`crypto`] — process-wide TLS crypto provider initialization.
//! - [`error`] — the crate's error type and `Result` alias.
//! - [`constants`] — shared defaults, subjects and environment variable names.
//!
//! ## Quick start
//!
//! A binary that wants to run a node composes an [`app::AppShellBuilder`]
//! over a concrete [`registry::Registry`] and [`transport::Transport`], and
//! registers whatever [`module::Module`]s it needs before calling `run`:
//!
//! ```no_run
//! # async fn example() -> nodemesh::error::Result<()> {
//! use nodemesh::app::AppShellBuilder;
//! use nodemesh::config::StartupArgs;
//! use nodemesh::registry::nats_kv::NatsKvRegistry;
//! use nodemesh::transport::nats::NatsTransport;
//! use std::sync::Arc;
//!
//! let args = StartupArgs { wd: None, env: None, consul: None, log: None, bi: None, pprof: None };
//! let registry = Arc::new(NatsKvRegistry::connect("nats://localhost:4222", "nodemesh-registry").await?);
//! let transport = Arc::new(NatsTransport::connect("nats://localhost:4222", "node-a", 60).await?);
//!
//! AppShellBuilder::new(args, registry, transport).run().await
//! # }
//! ```

pub mod app;
pub mod codec;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod module;
pub mod registry;
pub mod rpc;
pub mod selector;
pub mod transport;

// Crypto provider initialization (prominently exported for discoverability,
// mirroring how widely this gets called: every gateway TLS listener and
// every NATS TLS connection needs the process-wide provider installed
// exactly once before it touches rustls).
pub use crypto::ensure_crypto_provider;

/// Commonly used types for integrators composing an application shell.
pub mod prelude {
    pub use crate::app::{AppShellBuilder, ConfigurationLoadedHook, ModuleInitedHook, ServiceBrokenHook, StartupHook};
    pub use crate::config::{ServerConfig, StartupArgs};
    pub use crate::error::{MeshError, Result};
    pub use crate::module::{AppHandle, Module, ModuleInitContext, ModuleSettings};
    pub use crate::registry::{Node, Registry, SharedRegistry};
    pub use crate::rpc::client::RpcClient;
    pub use crate::rpc::server::RpcServer;
    pub use crate::selector::{SelectOptions, Selector, Strategy};
    pub use crate::transport::{SharedTransport, Transport};
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
