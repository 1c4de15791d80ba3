//! RPC context propagation: trace/span ids that follow a call across hops,
//! plus a process-wide registry of "translatable" context keys that get
//! carried as a `context`-tagged argument instead of being dropped at the
//! RPC boundary.
//!
//! Grounded in the original substrate's `context` argument tag (built from
//! `getTranslatableCtxKeys()`) and in this crate's own `envelope::context`
//! task-local pattern, generalized from envelope metadata to arbitrary
//! caller-registered keys.

use crate::codec::{Arg, CONTEXT_TAG};
use crate::error::{MeshError, Result};
use dashmap::DashMap;
use once_cell_context::CONTEXT_REGISTRY;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task_local;
use uuid::Uuid;

task_local! {
    static CURRENT_RPC_CONTEXT: Option<RpcContext>;
}

/// Context carried alongside an RPC call: trace id stable across the whole
/// call chain, span id fresh per hop, and a bag of translatable values that
/// travel with the call.
#[derive(Debug, Clone, Default)]
pub struct RpcContext {
    pub trace_id: String,
    pub span_id: String,
    values: HashMap<String, Value>,
}

impl RpcContext {
    /// Start a brand-new trace (root of a call chain).
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: Uuid::new_v4().simple().to_string(),
            values: HashMap::new(),
        }
    }

    /// Derive a child span for an outgoing call: same trace, fresh span.
    pub fn child_span(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().simple().to_string(),
            values: self.values.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    /// Get the context installed for the currently-running task, if any.
    pub fn current() -> Option<Self> {
        CURRENT_RPC_CONTEXT.try_with(|c| c.clone()).unwrap_or(None)
    }

    /// Run a future with this context installed as the current one.
    pub async fn scope<F, R>(self, f: F) -> R
    where
        F: std::future::Future<Output = R>,
    {
        CURRENT_RPC_CONTEXT.scope(Some(self), f).await
    }

    /// Keep only the keys registered in `registry`, the subset that actually
    /// crosses the RPC boundary as a `context` arg. Callers that don't
    /// maintain their own [`TranslatableContextKeyRegistry`] can pass the
    /// process-wide default via [`default_context_key_registry`].
    pub fn translatable_subset(&self, registry: &TranslatableContextKeyRegistry) -> HashMap<String, Value> {
        self.values
            .iter()
            .filter(|(k, _)| registry.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Encode this context's trace/span ids and translatable subset into a
    /// `context`-tagged `Arg`, for prepending as `args[0]` on an outgoing
    /// call. Mirrors the original substrate building its `context` argument
    /// from `getTranslatableCtxKeys()` right before `RPCInfo` goes on the wire.
    pub fn to_context_arg(&self, registry: &TranslatableContextKeyRegistry) -> Result<Arg> {
        let wire = ContextWire {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            values: self.translatable_subset(registry),
        };
        Ok(Arg::new(CONTEXT_TAG, serde_json::to_vec(&wire)?))
    }

    /// Reconstruct a context from a `context`-tagged `Arg` previously built
    /// by [`RpcContext::to_context_arg`].
    pub fn from_context_arg(arg: &Arg) -> Result<Self> {
        if arg.tag != CONTEXT_TAG {
            return Err(MeshError::codec(format!(
                "expected '{CONTEXT_TAG}' tagged argument, got '{}'",
                arg.tag
            )));
        }
        let wire: ContextWire = serde_json::from_slice(&arg.bytes)?;
        Ok(Self { trace_id: wire.trace_id, span_id: wire.span_id, values: wire.values })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextWire {
    trace_id: String,
    span_id: String,
    values: HashMap<String, Value>,
}

/// Process-wide registry of context keys that should be propagated across
/// RPC boundaries. Modules register keys they care about (e.g. the gateway
/// module registers its session key) during startup; unregistered keys
/// never leave the process.
#[derive(Debug, Default)]
pub struct TranslatableContextKeyRegistry {
    keys: DashMap<String, ()>,
}

impl TranslatableContextKeyRegistry {
    pub fn new() -> Self {
        Self { keys: DashMap::new() }
    }

    pub fn register(&self, key: impl Into<String>) {
        self.keys.insert(key.into(), ());
    }

    pub fn registered_keys(&self) -> Vec<String> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }
}

/// Shared handle to the process-wide registry, analogous to `mqrpc.RegTransContextKey`
/// being a package-level function in the original.
pub type SharedContextKeyRegistry = Arc<TranslatableContextKeyRegistry>;

mod once_cell_context {
    use super::TranslatableContextKeyRegistry;
    use std::sync::OnceLock;

    pub struct LazyRegistry(OnceLock<TranslatableContextKeyRegistry>);

    impl LazyRegistry {
        pub const fn new() -> Self {
            Self(OnceLock::new())
        }

        pub fn registered_keys(&self) -> Vec<String> {
            self.0.get_or_init(TranslatableContextKeyRegistry::new).registered_keys()
        }

        pub fn register(&self, key: impl Into<String>) {
            self.0.get_or_init(TranslatableContextKeyRegistry::new).register(key);
        }
    }

    pub static CONTEXT_REGISTRY: LazyRegistry = LazyRegistry::new();
}

/// Register a context key as translatable across RPC boundaries, on the
/// process-wide default registry. Tests and integrators that want isolation
/// should construct their own [`TranslatableContextKeyRegistry`] instead and
/// pass it explicitly to [`RpcContext::translatable_subset`].
pub fn register_translatable_key(key: impl Into<String>) {
    CONTEXT_REGISTRY.register(key);
}

/// The process-wide default registry, populated by [`register_translatable_key`].
pub fn default_context_key_registry() -> TranslatableContextKeyRegistry {
    let reg = TranslatableContextKeyRegistry::new();
    for key in CONTEXT_REGISTRY.registered_keys() {
        reg.register(key);
    }
    reg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_span_keeps_trace_id() {
        let root = RpcContext::new_root();
        let child = root.child_span();
        assert_eq!(root.trace_id, child.trace_id);
        assert_ne!(root.span_id, child.span_id);
    }

    #[test]
    fn translatable_subset_filters_unregistered_keys() {
        let registry = TranslatableContextKeyRegistry::new();
        registry.register("session");
        let mut ctx = RpcContext::new_root();
        ctx.set("session", Value::String("s1".into()));
        ctx.set("untracked", Value::Bool(true));
        let subset = ctx.translatable_subset(&registry);
        assert!(subset.contains_key("session"));
        assert!(!subset.contains_key("untracked"));
    }

    #[test]
    fn context_arg_round_trips_trace_and_translatable_values() {
        let registry = TranslatableContextKeyRegistry::new();
        registry.register("session");
        let mut ctx = RpcContext::new_root();
        ctx.set("session", Value::String("s1".into()));
        ctx.set("untracked", Value::Bool(true));

        let arg = ctx.to_context_arg(&registry).unwrap();
        assert_eq!(arg.tag, CONTEXT_TAG);

        let back = RpcContext::from_context_arg(&arg).unwrap();
        assert_eq!(back.trace_id, ctx.trace_id);
        assert_eq!(back.span_id, ctx.span_id);
        assert_eq!(back.get("session"), Some(&Value::String("s1".into())));
        assert!(back.get("untracked").is_none());
    }

    #[test]
    fn from_context_arg_rejects_wrong_tag() {
        let arg = Arg::new("int", vec![0]);
        assert!(RpcContext::from_context_arg(&arg).is_err());
    }

    #[tokio::test]
    async fn current_context_is_scoped() {
        assert!(RpcContext::current().is_none());
        let ctx = RpcContext::new_root();
        let trace = ctx.trace_id.clone();
        ctx.scope(async move {
            assert_eq!(RpcContext::current().unwrap().trace_id, trace);
        })
        .await;
        assert!(RpcContext::current().is_none());
    }
}
