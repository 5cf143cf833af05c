//! Activity events and their fan-out to subscribers.
//!
//! Every request a session handles produces one [`ActivityEvent`]. The
//! [`ActivityRouter`] persists it through the store's bounded spool and
//! broadcasts it to registered [`ActivityListener`]s. Emission never blocks
//! the request path: a subscriber that cannot keep up observes a gap and a
//! logged drop count instead of applying backpressure.

use crate::store::activity::ActivitySpool;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slog::Logger;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;

const BROADCAST_DEPTH: usize = 256;

/// One observed activity, mirroring the row persisted to the store.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    /// The listener the session came through; `None` for system events.
    pub listener_id: Option<i64>,
    pub username: String,
    pub action: String,
    pub path: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(listener_id: Option<i64>, username: impl AsRef<str>, action: impl AsRef<str>, path: impl AsRef<str>, success: bool) -> ActivityEvent {
        ActivityEvent {
            listener_id,
            username: username.as_ref().to_string(),
            action: action.as_ref().to_string(),
            path: path.as_ref().to_string(),
            success,
            timestamp: Utc::now(),
        }
    }
}

/// A subscriber to activity events. Implementations are invoked once per
/// event, in per-session order; ordering across sessions is not defined.
#[async_trait]
pub trait ActivityListener: Send + Sync + Debug {
    async fn receive_activity(&self, event: ActivityEvent);
}

#[async_trait]
impl ActivityListener for Arc<dyn ActivityListener> {
    async fn receive_activity(&self, event: ActivityEvent) {
        self.as_ref().receive_activity(event).await
    }
}

/// An [`ActivityListener`] that does nothing.
#[derive(Debug)]
pub struct NopListener;

#[async_trait]
impl ActivityListener for NopListener {
    async fn receive_activity(&self, _event: ActivityEvent) {}
}

/// Routes activity events to the store spool and to all subscribers.
/// Cheap to clone; clones share the underlying channels.
#[derive(Clone)]
pub struct ActivityRouter {
    spool: ActivitySpool,
    broadcast: broadcast::Sender<ActivityEvent>,
    logger: Logger,
}

impl ActivityRouter {
    /// Build the router and its store writer task. Must be called from
    /// within a Tokio runtime.
    pub fn new(store: Store, logger: Logger) -> ActivityRouter {
        let (broadcast, _) = broadcast::channel(BROADCAST_DEPTH);
        ActivityRouter {
            spool: ActivitySpool::new(store, logger.clone()),
            broadcast,
            logger,
        }
    }

    /// Record one event: enqueue for persistence and broadcast to
    /// subscribers. Never blocks, never fails the caller.
    pub fn record(&self, event: ActivityEvent) {
        self.spool
            .enqueue(event.listener_id, &event.username, &event.action, &event.path, event.success);
        // An error here only means there is no subscriber right now.
        let _ = self.broadcast.send(event);
    }

    /// Attach a subscriber. A dedicated forwarding task drives it so a slow
    /// implementation can only lag (and lose events), never stall emitters.
    pub fn subscribe(&self, listener: Arc<dyn ActivityListener>) {
        let mut rx = self.broadcast.subscribe();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => listener.receive_activity(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        slog::warn!(logger, "slow activity subscriber lost events"; "skipped" => skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// How many records the persistence spool has dropped.
    pub fn dropped(&self) -> u64 {
        self.spool.dropped()
    }
}

impl Debug for ActivityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRouter").finish()
    }
}
