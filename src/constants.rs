//! Default values shared across the RPC substrate, registry, module runtime
//! and gateway. Centralized so config layering has a single place to fall
//! back to when a setting is absent.

use std::time::Duration;

/// Default timeout values
pub mod timeouts {
    use super::*;

    /// Default NATS connection timeout in milliseconds
    pub const DEFAULT_NATS_CONNECTION_TIMEOUT_MS: u64 = 5000;

    /// Default NATS reconnect backoff in milliseconds
    pub const DEFAULT_NATS_RECONNECT_TIMEOUT_MS: u64 = 2000;

    /// Default NATS request timeout in milliseconds
    pub const DEFAULT_NATS_REQUEST_TIMEOUT_MS: u64 = 30000;

    /// Default RPC call deadline when the caller doesn't specify one.
    pub const DEFAULT_RPC_CALL_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default graceful shutdown ("kill-wait") deadline for the application
    /// shell: if module teardown hasn't finished by this point, the process
    /// aborts rather than hang.
    pub const DEFAULT_KILL_WAIT_SECS: u64 = 60;

    /// Default registry lease TTL; nodes are evicted if not refreshed within
    /// this window.
    pub const DEFAULT_REGISTER_TTL_SECS: u64 = 30;

    /// Default registry lease renewal interval (half the TTL, matching the
    /// renew-at-half-TTL behavior of the original registrar).
    pub const DEFAULT_REGISTER_INTERVAL_SECS: u64 = DEFAULT_REGISTER_TTL_SECS / 2;

    /// Default gateway read-deadline used as the heartbeat timeout: if no
    /// bytes arrive from a connected agent within this window, the
    /// connection is considered dead and closed.
    pub const DEFAULT_AGENT_HEARTBEAT_SECS: u64 = 90;

    /// Default write deadline for a single gateway frame write.
    pub const DEFAULT_AGENT_WRITE_TIMEOUT_SECS: u64 = 30;

    /// Default graceful shutdown timeout for module teardown.
    pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
}

/// NATS subject patterns.
pub mod subjects {
    /// Subject prefix all RPC traffic for a node publishes/subscribes under.
    pub const RPC_SUBJECT_PREFIX: &str = "mesh.rpc";

    /// Per-node inbox subject pattern for reply delivery: `mesh.rpc.reply.<nodeId>`.
    pub const RPC_REPLY_SUBJECT_PATTERN: &str = "mesh.rpc.reply.{node_id}";
}

/// Network addresses and ports.
pub mod network {
    /// Default NATS server URL.
    pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

    /// Default NATS port.
    pub const DEFAULT_NATS_PORT: u16 = 4222;

    /// Default bind address for all interfaces (gateway listeners).
    pub const DEFAULT_BIND_ALL_INTERFACES: &str = "0.0.0.0";

    /// Default bind address for localhost-only listeners.
    pub const DEFAULT_BIND_LOCALHOST: &str = "127.0.0.1";
}

/// Network and concurrency limits.
pub mod limits {
    /// Default maximum pending RPC replies awaiting correlation before the
    /// client applies backpressure.
    pub const DEFAULT_NATS_MAX_PENDING_MESSAGES: usize = 512;

    /// Default maximum reconnect attempts for the NATS transport.
    pub const DEFAULT_NATS_MAX_RECONNECT_ATTEMPTS: usize = 60;

    /// Default bound on a gateway agent's outbound send channel; beyond this
    /// the send loop drops the connection rather than buffer unboundedly.
    pub const DEFAULT_AGENT_SEND_CHANNEL_CAPACITY: usize = 256;

    /// Default semaphore budget for methods registered with parallel
    /// ("goroutine-style") dispatch.
    pub const DEFAULT_PARALLEL_DISPATCH_BUDGET: usize = 128;
}

/// Environment variable names recognized by the configuration loader.
pub mod env_vars {
    pub const MESH_NATS_URL: &str = "MESH_NATS_URL";
    pub const MESH_LOG_LEVEL: &str = "MESH_LOG_LEVEL";
    pub const MESH_PROCESS_ENV: &str = "MESH_PROCESS_ENV";
    pub const MESH_WORKDIR: &str = "MESH_WORKDIR";
    pub const MESH_CONSUL_ADDR: &str = "MESH_CONSUL_ADDR";
}

/// Version and metadata constants.
pub mod metadata {
    /// Crate version exposed in node registration metadata.
    pub const MESH_VERSION: &str = "0.1.0";

    /// Default service name used when a module doesn't set one explicitly.
    pub const DEFAULT_SERVICE_NAME: &str = "mesh-service";
}

/// Registry (service directory) constants.
pub mod registry {
    /// JetStream KV bucket backing the node directory.
    pub const DEFAULT_KV_BUCKET: &str = "mesh-registry";

    /// Default processEnv label when none is configured.
    pub const DEFAULT_PROCESS_ENV: &str = "dev";

    /// KV key pattern for a configured node's server JSON document, rooted
    /// under the processEnv label: `config/<processEnv>/server`.
    pub const CONFIG_KEY_PATTERN: &str = "config/{env}/server";
}

/// Gateway frame codec and listener constants.
pub mod gateway {
    /// Maximum total frame size (`u16::MAX`), matching the `u16 totalLen`
    /// prefix's range.
    pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

    /// Body buffers at or under this size are served from a reusable pool;
    /// larger packets fall back to a one-off allocation.
    pub const POOLED_BODY_SIZE: usize = 4096;

    /// Number of buffers kept warm in the body buffer pool.
    pub const BODY_POOL_CAPACITY: usize = 256;

    /// AES-128 key length in bytes for the optional frame encryption.
    pub const AES_KEY_LEN: usize = 16;

    /// The single constant RPC method name the gateway invokes on whatever
    /// node a default-dispatched client frame resolves to.
    pub const RPC_CLIENT_MSG: &str = "RPC_CLIENT_MSG";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_positive() {
        assert!(timeouts::DEFAULT_RPC_CALL_TIMEOUT.as_secs() > 0);
        assert!(timeouts::DEFAULT_KILL_WAIT_SECS > 0);
        assert!(timeouts::DEFAULT_NATS_REQUEST_TIMEOUT_MS >= timeouts::DEFAULT_NATS_CONNECTION_TIMEOUT_MS);
    }

    #[test]
    fn register_interval_is_half_ttl() {
        assert_eq!(
            timeouts::DEFAULT_REGISTER_INTERVAL_SECS * 2,
            timeouts::DEFAULT_REGISTER_TTL_SECS
        );
    }

    #[test]
    fn nats_url_has_scheme() {
        assert!(network::DEFAULT_NATS_URL.starts_with("nats://"));
    }
}
