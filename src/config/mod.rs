//! Startup configuration: the JSON document pulled from the registry KV
//! store at `config/<processEnv>/server`, and the CLI flags that decide
//! where to find it.
//!
//! Grounded in the original's `consul`-flag-driven config fetch
//! (`config_loader.go`), reworked onto this crate's KV-over-NATS registry;
//! `figment` layers the document over environment variables the way the
//! teacher's config stack layers its own sources, and `clap` derives the
//! startup flags the same way the teacher's CLI entry point does.

pub mod loader;

pub use loader::load_from_registry;

use crate::module::manager::ModuleEntry;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Command-line flags accepted by a mesh node binary.
///
/// Flags override environment variables; [`StartupArgs::process_env`]
/// resolves from `--env`, then `MESH_PROCESS_ENV`, then
/// [`crate::constants::registry::DEFAULT_PROCESS_ENV`].
#[derive(Debug, Parser, Clone)]
#[command(name = "mesh-node", about = "Run a nodemesh application shell")]
pub struct StartupArgs {
    /// Working directory to chdir into before anything else loads.
    #[arg(long)]
    pub wd: Option<String>,

    /// Process environment label (`dev`, `staging`, `prod`, ...), selecting
    /// which configured module entries bind to this node.
    #[arg(long)]
    pub env: Option<String>,

    /// Registry (KV directory) address, e.g. a NATS server URL.
    #[arg(long)]
    pub consul: Option<String>,

    /// Log output path; stdout if unset.
    #[arg(long)]
    pub log: Option<String>,

    /// Business-intelligence log output path.
    #[arg(long)]
    pub bi: Option<String>,

    /// Optional diagnostics listener address. The original's `pprof` flag
    /// has no direct Rust analogue; this crate repurposes the flag to toggle
    /// a `tokio-console`/metrics endpoint instead (see DESIGN.md).
    #[arg(long)]
    pub pprof: Option<String>,
}

impl StartupArgs {
    pub fn resolved_process_env(&self) -> String {
        self.env
            .clone()
            .or_else(|| std::env::var(crate::constants::env_vars::MESH_PROCESS_ENV).ok())
            .unwrap_or_else(|| crate::constants::registry::DEFAULT_PROCESS_ENV.to_string())
    }

    pub fn resolved_registry_addr(&self) -> String {
        self.consul
            .clone()
            .or_else(|| std::env::var(crate::constants::env_vars::MESH_CONSUL_ADDR).ok())
            .unwrap_or_else(|| crate::constants::network::DEFAULT_NATS_URL.to_string())
    }
}

/// NATS connection settings as they appear in the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatsConfig {
    pub addr: String,
    #[serde(default)]
    pub max_reconnects: Option<usize>,
}

/// A raw configured module entry as it appears in JSON, before it's bound to
/// a [`ModuleEntry`] (which carries `HashMap<String, serde_json::Value>`
/// settings rather than the raw JSON object this type deserializes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawModuleEntry {
    pub id: String,
    pub host: String,
    pub env: String,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl From<RawModuleEntry> for ModuleEntry {
    fn from(raw: RawModuleEntry) -> Self {
        ModuleEntry {
            instance_id: raw.id,
            host: raw.host,
            process_env: raw.env,
            settings: raw.settings.into_iter().collect(),
        }
    }
}

/// The full `config/<processEnv>/server` document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub rpc_log: bool,
    #[serde(default)]
    pub module: HashMap<String, Vec<RawModuleEntry>>,
    pub nats: NatsConfig,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub log: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub bi: serde_json::Map<String, serde_json::Value>,
}

impl ServerConfig {
    /// Bind this document's `module` table into the [`ModuleEntry`] shape
    /// [`crate::module::ModuleManager`] consumes.
    pub fn module_entries(&self) -> HashMap<String, Vec<ModuleEntry>> {
        self.module
            .iter()
            .map(|(ty, entries)| (ty.clone(), entries.iter().cloned().map(ModuleEntry::from).collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let json = serde_json::json!({
            "rpc_log": true,
            "module": {
                "auth": [{"id": "i-1", "host": "10.0.0.1", "env": "dev", "settings": {"k": "v"}}]
            },
            "nats": {"addr": "nats://localhost:4222", "max_reconnects": 10}
        });
        let config: ServerConfig = serde_json::from_value(json).unwrap();
        assert!(config.rpc_log);
        assert_eq!(config.nats.addr, "nats://localhost:4222");
        let entries = config.module_entries();
        assert_eq!(entries["auth"][0].instance_id, "i-1");
        assert_eq!(
            entries["auth"][0].settings.get("k").and_then(|v| v.as_str()),
            Some("v")
        );
    }

    #[test]
    fn startup_args_fall_back_to_default_process_env() {
        let args = StartupArgs { wd: None, env: None, consul: None, log: None, bi: None, pprof: None };
        // Only assert the fallback constant when the environment variable
        // genuinely isn't set, so this test doesn't depend on process state
        // left behind by another test or the host shell.
        if std::env::var(crate::constants::env_vars::MESH_PROCESS_ENV).is_err() {
            assert_eq!(args.resolved_process_env(), crate::constants::registry::DEFAULT_PROCESS_ENV);
        }
    }
}
