//! One bound network endpoint and its lifecycle.

use super::shutdown::Notifier;
use super::{ServerContext, SYSTEM_USER};
use crate::notification::ActivityEvent;
use crate::store::{ListenerRow, Protocol};
use slog::Logger;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener as TcpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Why a listener could not change state.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// `start()` on a listener that is already running.
    #[error("listener is already running")]
    AlreadyRunning,
    /// `start()` on a listener whose enabled flag is off.
    #[error("listener is disabled")]
    Disabled,
    /// Bad address, invalid port, or a bind collision.
    #[error("could not bind listener: {0}")]
    Io(#[from] io::Error),
}

enum State {
    Stopped,
    Running { shutdown: Arc<Notifier>, accept_task: JoinHandle<()> },
}

/// A configured endpoint that can be started and stopped. The accept loop
/// and all sessions run on their own tasks; the `Listener` value is only
/// the lifecycle handle.
pub struct Listener {
    row: ListenerRow,
    ctx: Arc<ServerContext>,
    state: Mutex<State>,
    logger: Logger,
}

impl Listener {
    pub(crate) fn new(row: ListenerRow, ctx: Arc<ServerContext>) -> Listener {
        let logger = ctx
            .logger
            .new(slog::o!("listener" => row.name.clone(), "protocol" => row.protocol.to_string()));
        Listener {
            row,
            ctx,
            state: Mutex::new(State::Stopped),
            logger,
        }
    }

    pub fn id(&self) -> i64 {
        self.row.id
    }

    pub fn row(&self) -> &ListenerRow {
        &self.row
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, State::Running { .. })
    }

    /// Bind the endpoint and start accepting. Fails on a running or
    /// disabled listener and on any bind problem.
    pub async fn start(&self) -> Result<(), ListenerError> {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Running { .. }) {
            return Err(ListenerError::AlreadyRunning);
        }
        if !self.row.enabled {
            return Err(ListenerError::Disabled);
        }
        if self.row.port == 0 {
            return Err(ListenerError::Io(io::Error::new(io::ErrorKind::InvalidInput, "port must be in 1..=65535")));
        }
        let ip: IpAddr = self
            .row
            .binding_ip
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bad binding address: {}", e)))?;
        let addr = SocketAddr::new(ip, self.row.port);
        let socket = TcpSocket::bind(addr).await?;
        slog::info!(self.logger, "listener started"; "addr" => %addr);

        let shutdown = Arc::new(Notifier::new());
        let ctx = self.ctx.clone();
        let row = self.row.clone();
        let task_shutdown = shutdown.clone();
        let task_logger = self.logger.clone();
        let accept_task = tokio::spawn(async move {
            match row.protocol {
                Protocol::Sftp => crate::sftp::serve(socket, row, ctx, task_shutdown).await,
                Protocol::Ftp => crate::ftp::serve(socket, row, ctx, task_shutdown).await,
            }
            slog::debug!(task_logger, "accept loop ended");
        });
        self.ctx.activities.record(ActivityEvent::new(
            Some(self.row.id),
            SYSTEM_USER,
            "LISTENER_STARTED",
            addr.to_string(),
            true,
        ));
        *state = State::Running { shutdown, accept_task };
        Ok(())
    }

    /// Drain and stop. Stops accepting, asks every session of this
    /// listener to close, waits up to the shutdown deadline and then
    /// terminates whatever is left. A stopped listener is left untouched.
    pub async fn stop(&self) -> Result<(), ListenerError> {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, State::Stopped);
        let State::Running { shutdown, accept_task } = previous else {
            return Ok(());
        };
        slog::info!(self.logger, "stopping listener");
        shutdown.notify();
        let closed = self.ctx.registry.close_for_listener(self.row.id).await;
        if closed > 0 {
            slog::debug!(self.logger, "asked sessions to close"; "count" => closed);
        }
        let deadline = self.ctx.config.shutdown_deadline;
        if tokio::time::timeout(deadline, shutdown.linger()).await.is_err() {
            slog::warn!(self.logger, "drain deadline expired, terminating"; "deadline_secs" => deadline.as_secs());
        }
        accept_task.abort();
        self.ctx.activities.record(ActivityEvent::new(
            Some(self.row.id),
            SYSTEM_USER,
            "LISTENER_STOPPED",
            format!("{}:{}", self.row.binding_ip, self.row.port),
            true,
        ));
        Ok(())
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("row", &self.row).finish()
    }
}
