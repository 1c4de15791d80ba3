//! Fetches the startup configuration document from the registry and layers
//! environment-variable overrides on top via `figment`, the same two-source
//! layering style the teacher's configuration stack uses.

use crate::config::ServerConfig;
use crate::constants::registry::CONFIG_KEY_PATTERN;
use crate::error::{MeshError, Result};
use crate::registry::SharedRegistry;
use figment::providers::{Env, Format, Json};
use figment::Figment;

/// Fetch and parse `config/<processEnv>/server` from `registry`, with any
/// `MESH_`-prefixed environment variable overriding a matching top-level
/// field (e.g. `MESH_NATS__ADDR` overrides `nats.addr`).
pub async fn load_from_registry(registry: &SharedRegistry, process_env: &str) -> Result<ServerConfig> {
    let key = CONFIG_KEY_PATTERN.replace("{env}", process_env);
    let bytes = registry
        .get(&key)
        .await?
        .ok_or_else(|| MeshError::config(format!("no configuration document at '{key}'")))?;
    let document = String::from_utf8(bytes).map_err(|e| MeshError::config(e.to_string()))?;

    Figment::new()
        .merge(Json::string(&document))
        .merge(Env::prefixed("MESH_").split("__"))
        .extract()
        .map_err(|e| MeshError::config(format!("invalid configuration document at '{key}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mock::MockRegistry;

    #[tokio::test]
    async fn loads_document_published_under_the_expected_key() {
        let registry: SharedRegistry = MockRegistry::new();
        let document = serde_json::json!({
            "rpc_log": false,
            "module": {},
            "nats": {"addr": "nats://localhost:4222"}
        });
        registry
            .put("config/dev/server", serde_json::to_vec(&document).unwrap())
            .await
            .unwrap();

        let config = load_from_registry(&registry, "dev").await.unwrap();
        assert_eq!(config.nats.addr, "nats://localhost:4222");
    }

    #[tokio::test]
    async fn missing_document_is_a_config_error() {
        let registry: SharedRegistry = MockRegistry::new();
        let err = load_from_registry(&registry, "dev").await.unwrap_err();
        assert!(matches!(err, MeshError::Config(_)));
    }
}
