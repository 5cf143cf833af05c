//! The SSH transport: accepts connections, authenticates against the
//! store, and hands the `sftp` subsystem channel to the
//! [`SftpHandler`](handler::SftpHandler).
//!
//! Each session owns an [`IdleTimer`] reset by every SFTP request; a
//! watchdog task force-disconnects the transport when it expires, emitting
//! an `IDLE_TIMEOUT` activity. The watchdog runs on its own task so a
//! request blocked in disk I/O cannot keep the timer from firing.

pub mod handler;
pub mod handles;

use crate::auth::{Credentials, Principal};
use crate::notification::ActivityEvent;
use crate::server::shutdown::{Notifier, Watcher};
use crate::server::{ServerContext, SessionCloser, SessionInfo};
use crate::store::ListenerRow;
use async_trait::async_trait;
use chrono::Utc;
use self::handler::SftpHandler;
use russh::keys::PublicKey;
use russh::server::{Auth, Config, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, Disconnect};
use slog::Logger;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

/// Problems getting the SSH host key ready.
#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error("host key io error")]
    Io(#[from] std::io::Error),
    #[error("host key encoding error")]
    Key(#[from] ssh_key::Error),
}

/// Load the Ed25519 host key, generating and persisting one on first
/// start.
pub fn load_or_generate_host_key(path: &Path, logger: &Logger) -> Result<PrivateKey, HostKeyError> {
    if path.exists() {
        return Ok(PrivateKey::read_openssh_file(path)?);
    }
    slog::info!(logger, "generating ssh host key"; "path" => %path.display());
    let key = PrivateKey::random(&mut ssh_key::rand_core::OsRng, Algorithm::Ed25519)?;
    key.write_openssh_file(path, LineEnding::LF)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(key)
}

/// Tracks when the session last saw a request.
#[derive(Debug, Clone)]
pub(crate) struct IdleTimer {
    last: Arc<StdMutex<tokio::time::Instant>>,
}

impl IdleTimer {
    pub(crate) fn new() -> IdleTimer {
        IdleTimer {
            last: Arc::new(StdMutex::new(tokio::time::Instant::now())),
        }
    }

    pub(crate) fn touch(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = tokio::time::Instant::now();
    }

    pub(crate) fn deadline(&self, timeout: Duration) -> tokio::time::Instant {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last + timeout
    }
}

/// Run the SSH accept loop on an already-bound socket until the listener
/// drains.
pub(crate) async fn serve(socket: TcpListener, row: ListenerRow, ctx: Arc<ServerContext>, shutdown: Arc<Notifier>) {
    let logger = ctx.logger.new(slog::o!("listener" => row.name.clone()));
    let host_key_pem = ctx
        .host_key
        .to_openssh(LineEnding::LF)
        .expect("encode host key for russh");
    let host_key = russh::keys::PrivateKey::from_openssh(host_key_pem.as_bytes()).expect("decode host key for russh");
    let config = Arc::new(Config {
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    });
    let mut acceptor = SshAcceptor {
        row,
        ctx,
        shutdown: shutdown.clone(),
    };
    let mut watcher = shutdown.subscribe();
    tokio::select! {
        result = acceptor.run_on_socket(config, &socket) => {
            if let Err(err) = result {
                slog::error!(logger, "ssh accept loop failed"; "error" => %err);
            }
        }
        _ = watcher.listen() => {}
    }
}

struct SshAcceptor {
    row: ListenerRow,
    ctx: Arc<ServerContext>,
    shutdown: Arc<Notifier>,
}

impl Server for SshAcceptor {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> SshSession {
        let peer = peer_addr.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string());
        let session_id = Uuid::new_v4();
        let logger = self.ctx.logger.new(slog::o!(
            "listener" => self.row.name.clone(),
            "peer" => peer.clone(),
            "session" => session_id.to_string(),
        ));
        slog::debug!(logger, "incoming ssh connection");
        SshSession {
            ctx: self.ctx.clone(),
            row: self.row.clone(),
            peer,
            session_id,
            principal: None,
            channels: HashMap::new(),
            timer: IdleTimer::new(),
            idle_stop: None,
            registered: false,
            _watcher: self.shutdown.subscribe(),
            logger,
        }
    }
}

pub(crate) struct SshSession {
    ctx: Arc<ServerContext>,
    row: ListenerRow,
    peer: String,
    session_id: Uuid,
    principal: Option<Principal>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    timer: IdleTimer,
    idle_stop: Option<watch::Sender<bool>>,
    registered: bool,
    _watcher: Watcher,
    logger: Logger,
}

impl SshSession {
    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    fn record_login(&self, success: bool) {
        let action = if success { "LOGIN" } else { "LOGIN_DENIED" };
        self.ctx.activities.record(ActivityEvent::new(
            Some(self.row.id),
            self.principal.as_ref().map(|p| p.username.as_str()).unwrap_or("?"),
            action,
            &self.peer,
            success,
        ));
    }

    async fn try_auth(&mut self, user: &str, creds: Credentials) -> Auth {
        match self.ctx.authenticator.authenticate(self.row.id, user, &creds).await {
            Ok(principal) => {
                slog::info!(self.logger, "authenticated"; "user" => user);
                self.principal = Some(principal);
                self.record_login(true);
                Auth::Accept
            }
            Err(err) => {
                slog::info!(self.logger, "authentication rejected"; "user" => user, "reason" => %err);
                self.ctx
                    .activities
                    .record(ActivityEvent::new(Some(self.row.id), user, "LOGIN_DENIED", &self.peer, false));
                Self::reject()
            }
        }
    }
}

impl Handler for SshSession {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.try_auth(user, Credentials::password(password)).await)
    }

    async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        // Probe phase: no signature yet, just say whether the key could work.
        let stored = self.ctx.store.user_by_username(user).await.ok().flatten().and_then(|u| u.public_key);
        let usable = stored
            .map(|s| {
                ssh_key::PublicKey::from_openssh(&s)
                    .ok()
                    .and_then(|parsed| parsed.to_openssh().ok())
                    .map(|parsed| Some(parsed) == public_key.to_openssh().ok())
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if usable {
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let openssh = match public_key.to_openssh() {
            Ok(s) => s,
            Err(_) => return Ok(Self::reject()),
        };
        Ok(self.try_auth(user, Credentials::public_key(openssh)).await)
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(&mut self, channel_id: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        if name != "sftp" {
            slog::debug!(self.logger, "unsupported subsystem requested"; "name" => name);
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let Some(principal) = self.principal.clone() else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let handle = session.handle();
        self.ctx.registry.register(
            SessionInfo {
                session_id: self.session_id,
                listener_id: self.row.id,
                listener_name: self.row.name.clone(),
                protocol: self.row.protocol,
                username: principal.username.clone(),
                remote_address: self.peer.clone(),
                connected_at: Utc::now(),
            },
            Arc::new(SshCloser { handle: handle.clone() }),
        );
        self.registered = true;

        let (stop_tx, stop_rx) = watch::channel(false);
        self.idle_stop = Some(stop_tx);
        spawn_idle_watchdog(
            self.timer.clone(),
            self.ctx.config.idle_timeout,
            stop_rx,
            IdleTarget {
                handle,
                ctx: self.ctx.clone(),
                listener_id: self.row.id,
                username: principal.username.clone(),
                peer: self.peer.clone(),
            },
            self.logger.clone(),
        );

        session.channel_success(channel_id)?;
        let sftp = SftpHandler::new(self.ctx.clone(), principal, self.row.id, self.session_id, self.timer.clone());
        tokio::spawn(async move {
            russh_sftp::server::run(channel.into_stream(), sftp).await;
        });
        Ok(())
    }

    async fn channel_close(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.registered {
            self.ctx.registry.remove(&self.session_id);
        }
        if let Some(principal) = &self.principal {
            self.ctx
                .activities
                .record(ActivityEvent::new(Some(self.row.id), &principal.username, "LOGOUT", &self.peer, true));
        }
    }
}

struct SshCloser {
    handle: russh::server::Handle,
}

#[async_trait]
impl SessionCloser for SshCloser {
    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "closed by server".to_string(), "en-US".to_string())
            .await;
    }
}

struct IdleTarget {
    handle: russh::server::Handle,
    ctx: Arc<ServerContext>,
    listener_id: i64,
    username: String,
    peer: String,
}

fn spawn_idle_watchdog(timer: IdleTimer, timeout: Duration, mut stop: watch::Receiver<bool>, target: IdleTarget, logger: Logger) {
    tokio::spawn(async move {
        loop {
            let deadline = timer.deadline(timeout);
            if tokio::time::Instant::now() >= deadline {
                slog::info!(logger, "session idle timeout"; "timeout_secs" => timeout.as_secs());
                target.ctx.activities.record(ActivityEvent::new(
                    Some(target.listener_id),
                    &target.username,
                    "IDLE_TIMEOUT",
                    &target.peer,
                    true,
                ));
                let _ = target
                    .handle
                    .disconnect(Disconnect::ByApplication, "idle timeout".to_string(), "en-US".to_string())
                    .await;
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                changed = stop.changed() => {
                    // Sender dropped: the session is closing on its own.
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    });
}
