//! The supervisor: owns the listener set, the session registry and the
//! activity fan-out. The process bootstrap builds one supervisor and passes
//! it whatever surfaces need to administer the server; there is no global
//! state behind it.

use super::listener::{Listener, ListenerError};
use super::session::{SessionInfo, SessionRegistry};
use super::{ServerContext, SYSTEM_USER};
use crate::auth::StoreAuthenticator;
use crate::authz::Authorizer;
use crate::config::CoreConfig;
use crate::notification::{ActivityEvent, ActivityListener, ActivityRouter};
use crate::store::{Store, StoreError};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use slog::Logger;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no such listener")]
    UnknownListener,
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Manages all listeners of one server process.
pub struct Supervisor {
    ctx: Arc<ServerContext>,
    listeners: DashMap<i64, Arc<Listener>>,
    logger: Logger,
}

impl Supervisor {
    /// Wire up the shared server context. Must be called from within a
    /// Tokio runtime; spawns the activity writer and, when retention is
    /// configured, the daily purge task.
    pub async fn new(store: Store, config: CoreConfig, host_key: ssh_key::PrivateKey, logger: Logger) -> Result<Supervisor, SupervisorError> {
        let activities = ActivityRouter::new(store.clone(), logger.new(slog::o!("subsystem" => "activity")));
        let ctx = Arc::new(ServerContext {
            authenticator: Arc::new(StoreAuthenticator::new(store.clone())),
            authorizer: Arc::new(Authorizer::new(store.clone(), logger.new(slog::o!("subsystem" => "authz")))),
            registry: Arc::new(SessionRegistry::new()),
            activities,
            config,
            host_key: Arc::new(host_key),
            logger: logger.clone(),
            store,
        });
        let supervisor = Supervisor {
            ctx,
            listeners: DashMap::new(),
            logger,
        };
        supervisor.warn_weak_default_credential().await?;
        supervisor.spawn_retention_task();
        Ok(supervisor)
    }

    async fn warn_weak_default_credential(&self) -> Result<(), SupervisorError> {
        if self.ctx.store.default_credential_intact().await? {
            slog::warn!(self.logger, "the default admin credential is still in place; change it");
            self.ctx
                .activities
                .record(ActivityEvent::new(None, "admin", "WEAK_DEFAULT_CREDENTIAL", "", true));
        }
        Ok(())
    }

    fn spawn_retention_task(&self) {
        let Some(days) = self.ctx.config.activity_retention_days else {
            return;
        };
        let store = self.ctx.store.clone();
        let logger = self.logger.new(slog::o!("subsystem" => "retention"));
        tokio::spawn(async move {
            loop {
                let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
                match store.purge_activities_older_than(cutoff).await {
                    Ok(0) => {}
                    Ok(purged) => slog::info!(logger, "purged old activity rows"; "rows" => purged),
                    Err(err) => slog::warn!(logger, "activity purge failed"; "error" => %err),
                }
                tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)).await;
            }
        });
    }

    /// Start every listener whose enabled flag is set. A listener that
    /// fails to start is logged and skipped; the others still come up.
    pub async fn start_all_enabled(&self) -> Result<(), SupervisorError> {
        for row in self.ctx.store.list_listeners().await? {
            if !row.enabled {
                continue;
            }
            if let Err(err) = self.start_listener(row.id).await {
                slog::error!(self.logger, "listener failed to start";
                    "listener" => %row.name, "port" => row.port, "error" => %err);
                self.ctx.activities.record(ActivityEvent::new(
                    Some(row.id),
                    SYSTEM_USER,
                    "LISTENER_ERROR",
                    format!("{}:{}", row.binding_ip, row.port),
                    false,
                ));
            }
        }
        Ok(())
    }

    /// Start one listener by id, reading its current configuration from
    /// the store.
    pub async fn start_listener(&self, id: i64) -> Result<(), SupervisorError> {
        // Clone the entry out; a map guard must not be held across awaits.
        let existing = self.listeners.get(&id).map(|entry| Arc::clone(entry.value()));
        if let Some(existing) = existing {
            if existing.is_running().await {
                return Err(ListenerError::AlreadyRunning.into());
            }
        }
        let row = self.ctx.store.listener_by_id(id).await?.ok_or(SupervisorError::UnknownListener)?;
        let listener = Arc::new(Listener::new(row, self.ctx.clone()));
        listener.start().await?;
        self.listeners.insert(id, listener);
        Ok(())
    }

    pub async fn stop_listener(&self, id: i64) -> Result<(), SupervisorError> {
        let listener = self
            .listeners
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SupervisorError::UnknownListener)?;
        listener.stop().await?;
        Ok(())
    }

    pub async fn restart_listener(&self, id: i64) -> Result<(), SupervisorError> {
        if let Some(listener) = self.listeners.get(&id).map(|entry| Arc::clone(entry.value())) {
            listener.stop().await?;
        }
        self.start_listener(id).await
    }

    pub async fn is_running(&self, id: i64) -> bool {
        let listener = self.listeners.get(&id).map(|entry| Arc::clone(entry.value()));
        match listener {
            Some(listener) => listener.is_running().await,
            None => false,
        }
    }

    /// Snapshot of all live sessions across listeners.
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.ctx.registry.snapshot()
    }

    /// Ask one session to close. Returns whether such a session existed.
    pub async fn disconnect_session(&self, session_id: Uuid) -> bool {
        self.ctx.registry.close(&session_id).await
    }

    /// Register an activity subscriber. See
    /// [`ActivityRouter::subscribe`](crate::notification::ActivityRouter::subscribe)
    /// for the delivery guarantees.
    pub fn subscribe(&self, listener: Arc<dyn ActivityListener>) {
        self.ctx.activities.subscribe(listener)
    }

    /// Stop all running listeners, draining each within the configured
    /// deadline.
    pub async fn shutdown(&self) {
        let ids: Vec<i64> = self.listeners.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Err(err) = self.stop_listener(id).await {
                slog::warn!(self.logger, "stopping listener failed"; "id" => id, "error" => %err);
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").field("listeners", &self.listeners.len()).finish()
    }
}
