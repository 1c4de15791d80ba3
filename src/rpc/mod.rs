//! RPC substrate: wire messages, context propagation, and the client/server
//! halves that exchange them over a [`crate::transport::Transport`].

pub mod client;
pub mod context;
pub mod handler;
pub mod message;
pub mod server;

pub use client::RpcClient;
pub use context::RpcContext;
pub use handler::{DispatchMode, HandlerFn, NoopListener, RegisteredMethod, RpcListener};
pub use message::{ResultInfo, RpcInfo};
pub use server::RpcServer;
