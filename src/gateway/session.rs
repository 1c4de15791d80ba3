//! Gateway session: the per-connection state object backend modules mutate
//! through the gateway's RPC-facing operations (§4.7), plus the pluggable
//! persistence collaborator `Bind` consults.
//!
//! Grounded in the original session's `(sessionId, userId, ip, network,
//! serverId, settings, traceId, spanId)` shape and its reader/writer-locked
//! `settings` map; this crate uses `tokio::sync::RwLock` rather than a raw
//! mutex for the same read-heavy-external-readers reason `selector::mod`
//! chose `RwLock` over `Mutex` for its service cache.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Per-connection state carried across RPCs to backend modules.
///
/// `sessionId` is generated once by the agent and stable for the
/// connection's lifetime; `userId` is empty until [`Session::bind`].
pub struct Session {
    pub session_id: String,
    pub ip: String,
    pub network: String,
    pub server_id: String,
    user_id: RwLock<String>,
    settings: RwLock<HashMap<String, String>>,
    pub trace_id: String,
    pub span_id: String,
}

impl Session {
    pub fn new(ip: impl Into<String>, network: impl Into<String>, server_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            session_id: Uuid::new_v4().simple().to_string(),
            ip: ip.into(),
            network: network.into(),
            server_id: server_id.into(),
            user_id: RwLock::new(String::new()),
            settings: RwLock::new(HashMap::new()),
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: Uuid::new_v4().simple().to_string(),
        })
    }

    pub async fn user_id(&self) -> String {
        self.user_id.read().await.clone()
    }

    pub async fn is_bound(&self) -> bool {
        !self.user_id.read().await.is_empty()
    }

    /// Bind this session to `user_id`, merging any prior state the store
    /// has for that user. Returns the merged settings snapshot.
    pub async fn bind(
        &self,
        user_id: &str,
        store: &dyn SessionStore,
    ) -> Result<HashMap<String, String>> {
        *self.user_id.write().await = user_id.to_string();
        let prior = store.load(user_id).await?.unwrap_or_default();
        {
            let mut settings = self.settings.write().await;
            for (k, v) in &prior {
                settings.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        let snapshot = self.settings.read().await.clone();
        store.save(user_id, &snapshot).await?;
        Ok(snapshot)
    }

    /// Clear the bound user id. Existing settings are left in place (the
    /// original distinguishes "unbound" from "settings cleared"); a fresh
    /// `bind` later re-merges from the store.
    pub async fn unbind(&self) {
        *self.user_id.write().await = String::new();
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.settings.read().await.get(key).cloned()
    }

    /// Set `key` and, if bound, persist the full settings snapshot through
    /// `store`.
    pub async fn set(&self, key: &str, value: &str, store: &dyn SessionStore) -> Result<()> {
        self.settings.write().await.insert(key.to_string(), value.to_string());
        self.persist_if_bound(store).await
    }

    pub async fn del(&self, key: &str, store: &dyn SessionStore) -> Result<()> {
        self.settings.write().await.remove(key);
        self.persist_if_bound(store).await
    }

    /// Replace the settings map wholesale (`Push`) and persist if bound.
    pub async fn push(&self, settings: HashMap<String, String>, store: &dyn SessionStore) -> Result<()> {
        *self.settings.write().await = settings;
        self.persist_if_bound(store).await
    }

    pub async fn settings_snapshot(&self) -> HashMap<String, String> {
        self.settings.read().await.clone()
    }

    async fn persist_if_bound(&self, store: &dyn SessionStore) -> Result<()> {
        let user_id = self.user_id.read().await.clone();
        if user_id.is_empty() {
            return Ok(());
        }
        let snapshot = self.settings.read().await.clone();
        store.save(&user_id, &snapshot).await
    }
}

/// Persistence collaborator consulted on `Bind` and after every settings
/// mutation once a session is bound. Supplements the distilled spec, which
/// leaves persistence optional; this crate ships [`InMemorySessionStore`]
/// as the default and lets integrators swap in a real one.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<HashMap<String, String>>>;
    async fn save(&self, user_id: &str, settings: &HashMap<String, String>) -> Result<()>;
}

/// Default in-process [`SessionStore`]: keyed by `userId`, lost on restart.
#[derive(Default)]
pub struct InMemorySessionStore {
    data: dashmap::DashMap<String, HashMap<String, String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, user_id: &str) -> Result<Option<HashMap<String, String>>> {
        Ok(self.data.get(user_id).map(|e| e.clone()))
    }

    async fn save(&self, user_id: &str, settings: &HashMap<String, String>) -> Result<()> {
        self.data.insert(user_id.to_string(), settings.clone());
        Ok(())
    }
}

pub type SharedSessionStore = Arc<dyn SessionStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_id_is_empty_before_bind() {
        let session = Session::new("127.0.0.1", "tcp", "gateway@i-1");
        assert!(!session.is_bound().await);
        assert_eq!(session.user_id().await, "");
    }

    #[tokio::test]
    async fn bind_sets_user_id_and_merges_prior_settings() {
        let store = InMemorySessionStore::new();
        store
            .save("u-1", &HashMap::from([("theme".to_string(), "dark".to_string())]))
            .await
            .unwrap();
        let session = Session::new("127.0.0.1", "tcp", "gateway@i-1");
        let merged = session.bind("u-1", store.as_ref()).await.unwrap();
        assert!(session.is_bound().await);
        assert_eq!(merged.get("theme").map(String::as_str), Some("dark"));
    }

    #[tokio::test]
    async fn unbind_clears_user_id_but_keeps_settings() {
        let store = InMemorySessionStore::new();
        let session = Session::new("127.0.0.1", "tcp", "gateway@i-1");
        session.bind("u-1", store.as_ref()).await.unwrap();
        session.set("k", "v", store.as_ref()).await.unwrap();
        session.unbind().await;
        assert!(!session.is_bound().await);
        assert_eq!(session.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn set_persists_only_once_bound() {
        let store = InMemorySessionStore::new();
        let session = Session::new("127.0.0.1", "tcp", "gateway@i-1");
        session.set("k", "v", store.as_ref()).await.unwrap();
        assert!(store.load("").await.unwrap().is_none());

        session.bind("u-1", store.as_ref()).await.unwrap();
        session.set("k2", "v2", store.as_ref()).await.unwrap();
        let persisted = store.load("u-1").await.unwrap().unwrap();
        assert_eq!(persisted.get("k2").map(String::as_str), Some("v2"));
    }
}
