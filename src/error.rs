//! Error types for the mesh framework.
//!
//! Covers every failure surface the codec, RPC substrate, registry, module
//! runtime, application shell and gateway can raise. Individual collaborators
//! keep their own narrower error enums where useful (see `codec::CodecError`)
//! and fold them into `MeshError` at the boundary.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Crate-wide error type.
#[derive(Debug, Error, Clone)]
pub enum MeshError {
    /// Argument codec encode/decode failures.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration loading or validation errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors (JSON, MessagePack).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transport-level errors (NATS connect/publish/subscribe, gateway I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// An RPC call was dispatched to a method that isn't registered.
    #[error("no such function: {0}")]
    NoFoundFunction(String),

    /// An RPC call exceeded its deadline before a reply arrived.
    #[error("rpc call to '{0}' timed out")]
    Timeout(String),

    /// The remote handler returned an application-level error string.
    #[error("remote error: {0}")]
    Remote(String),

    /// A registered handler panicked during dispatch.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// Module registration/startup invariant violations (duplicate instance id,
    /// duplicate (moduleType, processEnv) pair, settings mismatch).
    #[error("module error: {0}")]
    Module(String),

    /// Registry/selector errors (KV unavailable, no nodes for service).
    #[error("registry error: {0}")]
    Registry(String),

    /// No node could be resolved for the requested service or selector.
    #[error("no server available for '{0}'")]
    ServerNotFound(String),

    /// Gateway frame or session errors.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Cryptographic failures in the gateway frame codec.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Generic internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),

    /// An argument's wire tag doesn't match any known primitive or
    /// recognized composite-tag prefix (`msgpack@`, `marshal@`).
    #[error("unsupported tag: {0}")]
    UnsupportedTag(String),
}

impl MeshError {
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn no_found_function(method: impl Into<String>) -> Self {
        Self::NoFoundFunction(method.into())
    }

    pub fn timeout(method: impl Into<String>) -> Self {
        Self::Timeout(method.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn handler_panic(msg: impl Into<String>) -> Self {
        Self::HandlerPanic(msg.into())
    }

    pub fn module(msg: impl Into<String>) -> Self {
        Self::Module(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn server_not_found(target: impl Into<String>) -> Self {
        Self::ServerNotFound(target.into())
    }

    pub fn gateway(msg: impl Into<String>) -> Self {
        Self::Gateway(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn unsupported_tag(tag: impl Into<String>) -> Self {
        Self::UnsupportedTag(tag.into())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for MeshError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("msgpack encode: {err}"))
    }
}

impl From<rmp_serde::decode::Error> for MeshError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("msgpack decode: {err}"))
    }
}

#[cfg(feature = "nats")]
impl From<async_nats::ConnectError> for MeshError {
    fn from(err: async_nats::ConnectError) -> Self {
        Self::Transport(format!("NATS connect failed: {err}"))
    }
}

#[cfg(feature = "nats")]
impl From<async_nats::PublishError> for MeshError {
    fn from(err: async_nats::PublishError) -> Self {
        Self::Transport(format!("NATS publish failed: {err}"))
    }
}

#[cfg(feature = "nats")]
impl From<async_nats::SubscribeError> for MeshError {
    fn from(err: async_nats::SubscribeError) -> Self {
        Self::Transport(format!("NATS subscribe failed: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for MeshError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_and_display() {
        let err = MeshError::no_found_function("user.login");
        assert_eq!(err.to_string(), "no such function: user.login");
    }

    #[test]
    fn result_alias_compiles() {
        fn f() -> Result<u8> {
            Err(MeshError::internal("boom"))
        }
        assert!(f().is_err());
    }

    #[test]
    fn timeout_variant_matches() {
        let err = MeshError::timeout("gate.push");
        assert!(matches!(err, MeshError::Timeout(_)));
    }

    #[test]
    fn unsupported_tag_variant_matches() {
        let err = MeshError::unsupported_tag("frobnicate@Widget");
        assert!(matches!(err, MeshError::UnsupportedTag(_)));
        assert_eq!(err.to_string(), "unsupported tag: frobnicate@Widget");
    }
}
