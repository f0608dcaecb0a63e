//! Server-side session storage.
//!
//! By default sessions travel inside the encrypted cookie itself and no
//! store is involved. Deployments that want server-side state (instant
//! revocation, cookies that carry only an id) plug a [`SessionStore`] into
//! the provider; the cookie then holds a random session id and the params
//! live behind this trait.

use crate::session::SessionParams;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Backing store for session parameters keyed by session id.
///
/// Implementations need only last-write-wins semantics; the gateway reads
/// once at request start and writes at most once at request end.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Option<SessionParams>;
    async fn save(&self, session_id: &str, params: SessionParams);
    async fn clear(&self, session_id: &str);
}

/// In-process store. Suitable for single-instance deployments and tests;
/// anything load-balanced wants a shared implementation instead.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionParams>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Option<SessionParams> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    async fn save(&self, session_id: &str, params: SessionParams) {
        self.sessions
            .write()
            .unwrap()
            .insert(session_id.to_string(), params);
    }

    async fn clear(&self, session_id: &str) {
        self.sessions.write().unwrap().remove(session_id);
    }
}
