//! Cross-listener session tracking.
//!
//! Sessions refer to their listener by id only; the registry is the single
//! place that knows which sessions exist right now. Entries are registered
//! when a transport finishes authentication and removed by the session's
//! own teardown path.

use crate::store::Protocol;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Snapshot data about one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub listener_id: i64,
    pub listener_name: String,
    pub protocol: Protocol,
    pub username: String,
    pub remote_address: String,
    pub connected_at: DateTime<Utc>,
}

/// Ability to force-close one session. Implemented per transport.
#[async_trait]
pub trait SessionCloser: Send + Sync {
    async fn close(&self);
}

struct Registered {
    info: SessionInfo,
    closer: Arc<dyn SessionCloser>,
}

/// Registry of all live sessions across all listeners.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Registered>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    pub fn register(&self, info: SessionInfo, closer: Arc<dyn SessionCloser>) {
        self.sessions.insert(info.session_id, Registered { info, closer });
    }

    /// Remove a session, returning its info if it was present.
    pub fn remove(&self, session_id: &Uuid) -> Option<SessionInfo> {
        self.sessions.remove(session_id).map(|(_, r)| r.info)
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Request closure of one session. Returns whether it existed.
    pub async fn close(&self, session_id: &Uuid) -> bool {
        // Clone the closer out so no map guard is held across the await.
        let closer = self.sessions.get(session_id).map(|entry| entry.closer.clone());
        match closer {
            Some(closer) => {
                closer.close().await;
                true
            }
            None => false,
        }
    }

    /// Request closure of every session belonging to `listener_id`,
    /// returning how many were asked to close.
    pub async fn close_for_listener(&self, listener_id: i64) -> usize {
        let closers: Vec<Arc<dyn SessionCloser>> = self
            .sessions
            .iter()
            .filter(|entry| entry.info.listener_id == listener_id)
            .map(|entry| entry.closer.clone())
            .collect();
        for closer in &closers {
            closer.close().await;
        }
        closers.len()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").field("sessions", &self.sessions.len()).finish()
    }
}
