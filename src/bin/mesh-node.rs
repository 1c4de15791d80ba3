//! Generic mesh node entry point: resolves startup flags, connects the
//! registry and transport, and hands control to the application shell.
//!
//! Grounded in `app/app.go`'s `main()`/flag-parsing shell, reworked onto
//! `clap` for flag parsing and `tracing-subscriber` for log setup the way
//! this crate's dependency stack carries them (see DESIGN.md).

use clap::Parser;
use nodemesh::app::AppShellBuilder;
use nodemesh::config::StartupArgs;
use nodemesh::error::Result;
use nodemesh::registry::nats_kv::NatsKvRegistry;
use nodemesh::registry::SharedRegistry;
use nodemesh::transport::nats::NatsTransport;
use nodemesh::transport::SharedTransport;
use std::sync::Arc;

fn init_tracing(log_path: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match log_path {
        Some(path) => {
            tracing::warn!(path, "file logging is not wired up yet, falling back to stdout");
            subscriber.init();
        }
        None => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = StartupArgs::parse();
    init_tracing(args.log.as_deref());

    nodemesh::ensure_crypto_provider()?;

    let registry_addr = args.resolved_registry_addr();
    let process_env = args.resolved_process_env();
    let node_id = format!("mesh-node@{}", uuid::Uuid::new_v4());

    let registry: SharedRegistry = Arc::new(NatsKvRegistry::connect(&registry_addr, "nodemesh-registry").await?);
    let transport: SharedTransport = Arc::new(NatsTransport::connect(&registry_addr, node_id, 60).await?);

    tracing::info!(process_env = %process_env, registry = %registry_addr, "mesh-node starting");

    AppShellBuilder::new(args, registry, transport).run().await
}
