//! Process-wide session store. Creation and removal travel through the
//! command executor so every replica converges on the same session set.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A login session: opaque id, the principal it authenticates, and its
/// expiry. Timestamps are epoch milliseconds stamped by the originating
/// command, never read from the clock during apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub principal: String,
    pub created_at_millis: i64,
    pub expires_at_millis: i64,
}

impl Session {
    pub fn new(principal: &str, now_millis: i64, ttl_millis: i64) -> Session {
        Session {
            id: Uuid::new_v4().to_string(),
            principal: principal.to_string(),
            created_at_millis: now_millis,
            expires_at_millis: now_millis + ttl_millis,
        }
    }

    pub fn expired_at(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at_millis
    }
}

/// In-memory session registry with lazy TTL eviction.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<String, Session>,
}

impl SessionManager {
    pub fn new() -> SessionManager {
        SessionManager::default()
    }

    pub fn create(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Resolves a live session; an expired one is evicted on the way out.
    pub fn get(&self, id: &str, now_millis: i64) -> Option<Session> {
        let session = self.sessions.get(id)?.clone();
        if session.expired_at(now_millis) {
            self.sessions.remove(id);
            return None;
        }
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
