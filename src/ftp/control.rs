//! The FTP control channel: line codec, command parsing, authentication
//! and the per-connection loop.
//!
//! Only the control surface lives here. Data-channel transfers (RETR, STOR,
//! LIST over PASV/PORT) belong to the external FTP engine and answer 502;
//! everything that can be served without a data connection goes through the
//! [`FtpStorage`](super::vfs::FtpStorage) adapter.

use super::vfs::{AuthorizedFs, FtpError, FtpStorage};
use crate::auth::{Credentials, Principal};
use crate::notification::ActivityEvent;
use crate::server::shutdown::Watcher;
use crate::server::{ServerContext, SessionCloser, SessionInfo};
use crate::store::ListenerRow;
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::codec::{Decoder, Encoder, Framed};
use uuid::Uuid;

/// Commands the control surface understands. Everything else parses to
/// `Unknown` and answers 502.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Quit,
    Syst,
    Feat,
    Type(String),
    Noop,
    Pwd,
    Cwd(String),
    Cdup,
    Dele(String),
    Rmd(String),
    Mkd(String),
    Rnfr(String),
    Rnto(String),
    Size(String),
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Command {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match trimmed.split_once(' ') {
            Some((v, a)) => (v, a.trim()),
            None => (trimmed, ""),
        };
        let arg_owned = arg.to_string();
        match verb.to_ascii_uppercase().as_str() {
            "USER" => Command::User(arg_owned),
            "PASS" => Command::Pass(arg_owned),
            "QUIT" => Command::Quit,
            "SYST" => Command::Syst,
            "FEAT" => Command::Feat,
            "TYPE" => Command::Type(arg_owned),
            "NOOP" => Command::Noop,
            "PWD" | "XPWD" => Command::Pwd,
            "CWD" => Command::Cwd(arg_owned),
            "CDUP" => Command::Cdup,
            "DELE" => Command::Dele(arg_owned),
            "RMD" | "XRMD" => Command::Rmd(arg_owned),
            "MKD" | "XMKD" => Command::Mkd(arg_owned),
            "RNFR" => Command::Rnfr(arg_owned),
            "RNTO" => Command::Rnto(arg_owned),
            "SIZE" => Command::Size(arg_owned),
            other => Command::Unknown(other.to_string()),
        }
    }
}

/// A control-channel reply, single or multi line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    CodeAndMsg { code: u16, msg: String },
    MultiLine { code: u16, lines: Vec<String> },
}

impl Reply {
    pub fn new(code: u16, msg: impl Into<String>) -> Reply {
        Reply::CodeAndMsg { code, msg: msg.into() }
    }
}

/// Splits incoming bytes on newlines and parses each line into a
/// [`Command`]; encodes [`Reply`] values with CRLF endings.
pub struct FtpCodec {
    next_index: usize,
}

impl FtpCodec {
    pub fn new() -> FtpCodec {
        FtpCodec { next_index: 0 }
    }
}

impl Default for FtpCodec {
    fn default() -> Self {
        FtpCodec::new()
    }
}

impl Decoder for FtpCodec {
    type Item = Command;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, Self::Error> {
        if let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') {
            let end = self.next_index + offset;
            let line = buf.split_to(end + 1);
            self.next_index = 0;
            let text = String::from_utf8_lossy(&line);
            Ok(Some(Command::parse(&text)))
        } else {
            self.next_index = buf.len();
            Ok(None)
        }
    }
}

impl Encoder<Reply> for FtpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, reply: Reply, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let mut out = Vec::new();
        match reply {
            Reply::CodeAndMsg { code, msg } => write!(out, "{} {}\r\n", code, msg)?,
            Reply::MultiLine { code, mut lines } => {
                let last = lines.pop().unwrap_or_default();
                if lines.is_empty() {
                    write!(out, "{} {}\r\n", code, last)?;
                } else {
                    write!(out, "{}-{}\r\n", code, lines.remove(0))?;
                    for line in lines {
                        write!(out, " {}\r\n", line)?;
                    }
                    write!(out, "{} {}\r\n", code, last)?;
                }
            }
        }
        buf.extend(&out);
        Ok(())
    }
}

struct FtpCloser {
    notify: Arc<Notify>,
}

#[async_trait]
impl SessionCloser for FtpCloser {
    async fn close(&self) {
        self.notify.notify_one();
    }
}

enum LoginState {
    NeedUser,
    NeedPass { username: String },
    LoggedIn { principal: Principal, fs: AuthorizedFs },
}

/// Drive one control connection until it quits, drops, idles out or is
/// closed from above.
pub(crate) async fn run_control_session(stream: TcpStream, peer: SocketAddr, row: ListenerRow, ctx: Arc<ServerContext>, mut watcher: Watcher) {
    let session_id = Uuid::new_v4();
    let logger = ctx.logger.new(slog::o!(
        "listener" => row.name.clone(),
        "peer" => peer.to_string(),
        "session" => session_id.to_string(),
    ));
    let mut framed = Framed::new(stream, FtpCodec::new());
    if framed.send(Reply::new(220, "wharf FTP service ready")).await.is_err() {
        return;
    }

    let close_signal = Arc::new(Notify::new());
    let mut state = LoginState::NeedUser;
    let mut registered = false;
    let mut cwd = "/".to_string();
    let mut rename_from: Option<String> = None;
    let idle = ctx.config.idle_timeout;

    loop {
        let event = tokio::select! {
            _ = watcher.listen() => {
                let _ = framed.send(Reply::new(421, "Service shutting down")).await;
                break;
            }
            _ = close_signal.notified() => {
                let _ = framed.send(Reply::new(421, "Connection closed by server")).await;
                break;
            }
            _ = tokio::time::sleep(idle) => {
                if let LoginState::LoggedIn { principal, .. } = &state {
                    ctx.activities.record(ActivityEvent::new(
                        Some(row.id), &principal.username, "IDLE_TIMEOUT", peer.to_string(), true,
                    ));
                }
                slog::info!(logger, "control connection idle timeout");
                let _ = framed.send(Reply::new(421, "Idle timeout, closing control connection")).await;
                break;
            }
            frame = framed.next() => frame,
        };
        let command = match event {
            Some(Ok(command)) => command,
            Some(Err(err)) => {
                slog::debug!(logger, "control channel error"; "error" => %err);
                break;
            }
            None => break,
        };

        let logged_in = matches!(state, LoginState::LoggedIn { .. });
        let reply = match command {
            Command::Quit => {
                let _ = framed.send(Reply::new(221, "Bye")).await;
                break;
            }
            Command::Syst => Reply::new(215, "UNIX Type: L8"),
            Command::Noop => Reply::new(200, "Ok"),
            Command::Feat => Reply::MultiLine {
                code: 211,
                lines: vec!["Extensions supported:".to_string(), "SIZE".to_string(), "UTF8".to_string(), "End".to_string()],
            },
            Command::Type(_) => Reply::new(200, "Binary transfer mode"),
            Command::User(_) if logged_in => Reply::new(503, "Already logged in"),
            Command::User(name) => {
                state = LoginState::NeedPass { username: name };
                Reply::new(331, "Password required")
            }
            Command::Pass(_) if logged_in => Reply::new(503, "Already logged in"),
            Command::Pass(password) => match std::mem::replace(&mut state, LoginState::NeedUser) {
                LoginState::NeedPass { username } => {
                    match ctx.authenticator.authenticate(row.id, &username, &Credentials::password(password)).await {
                        Ok(principal) => {
                            slog::info!(logger, "authenticated"; "user" => %principal.username);
                            ctx.activities
                                .record(ActivityEvent::new(Some(row.id), &principal.username, "LOGIN", peer.to_string(), true));
                            ctx.registry.register(
                                SessionInfo {
                                    session_id,
                                    listener_id: row.id,
                                    listener_name: row.name.clone(),
                                    protocol: row.protocol,
                                    username: principal.username.clone(),
                                    remote_address: peer.to_string(),
                                    connected_at: Utc::now(),
                                },
                                Arc::new(FtpCloser {
                                    notify: close_signal.clone(),
                                }),
                            );
                            registered = true;
                            let fs = AuthorizedFs::new(ctx.authorizer.clone(), ctx.activities.clone(), principal.clone(), row.id);
                            state = LoginState::LoggedIn { principal, fs };
                            Reply::new(230, "User logged in, proceed")
                        }
                        Err(err) => {
                            slog::info!(logger, "authentication rejected"; "user" => %username, "reason" => %err);
                            ctx.activities
                                .record(ActivityEvent::new(Some(row.id), &username, "LOGIN_DENIED", peer.to_string(), false));
                            Reply::new(530, "Authentication failed")
                        }
                    }
                }
                other => {
                    state = other;
                    Reply::new(503, "Send USER first")
                }
            },
            command => match &state {
                LoginState::LoggedIn { fs, .. } => file_command(fs, &mut cwd, &mut rename_from, command).await,
                _ => Reply::new(530, "Please authenticate"),
            },
        };
        if framed.send(reply).await.is_err() {
            break;
        }
    }

    if registered {
        ctx.registry.remove(&session_id);
    }
    if let LoginState::LoggedIn { principal, .. } = &state {
        ctx.activities
            .record(ActivityEvent::new(Some(row.id), &principal.username, "LOGOUT", peer.to_string(), true));
    }
    slog::debug!(logger, "control connection closed");
}

/// Serve one authenticated command through the storage adapter.
async fn file_command(fs: &AuthorizedFs, cwd: &mut String, rename_from: &mut Option<String>, command: Command) -> Reply {
    match command {
        Command::Pwd => Reply::new(257, format!("\"{}\"", cwd)),
        Command::Cwd(path) => {
            let target = absolute(cwd, &path);
            match fs.metadata(&target).await {
                Ok(stat) if stat.is_dir => match crate::authz::path::normalize(&target) {
                    Ok(normalized) => {
                        *cwd = normalized;
                        Reply::new(250, "Directory changed")
                    }
                    Err(_) => Reply::new(550, "No such directory"),
                },
                Ok(_) => Reply::new(550, "Not a directory"),
                Err(err) => error_reply(err),
            }
        }
        Command::Cdup => {
            let parent = absolute(cwd, "..");
            match crate::authz::path::normalize(&parent) {
                Ok(normalized) => {
                    *cwd = normalized;
                    Reply::new(250, "Directory changed")
                }
                Err(_) => Reply::new(550, "No such directory"),
            }
        }
        Command::Dele(path) => match fs.delete(&absolute(cwd, &path)).await {
            Ok(()) => Reply::new(250, "File removed"),
            Err(err) => error_reply(err),
        },
        Command::Rmd(path) => match fs.remove_dir(&absolute(cwd, &path)).await {
            Ok(()) => Reply::new(250, "Directory removed"),
            Err(err) => error_reply(err),
        },
        Command::Mkd(path) => {
            let target = absolute(cwd, &path);
            match fs.make_dir(&target).await {
                Ok(()) => Reply::new(257, format!("\"{}\" created", target)),
                Err(err) => error_reply(err),
            }
        }
        Command::Rnfr(path) => {
            let source = absolute(cwd, &path);
            match fs.metadata(&source).await {
                Ok(_) => {
                    *rename_from = Some(source);
                    Reply::new(350, "Ready for RNTO")
                }
                Err(err) => error_reply(err),
            }
        }
        Command::Rnto(path) => match rename_from.take() {
            Some(source) => match fs.rename(&source, &absolute(cwd, &path)).await {
                Ok(()) => Reply::new(250, "Renamed"),
                Err(err) => error_reply(err),
            },
            None => Reply::new(503, "Send RNFR first"),
        },
        Command::Size(path) => match fs.metadata(&absolute(cwd, &path)).await {
            Ok(stat) if !stat.is_dir => Reply::new(213, stat.size.to_string()),
            Ok(_) => Reply::new(550, "Not a regular file"),
            Err(err) => error_reply(err),
        },
        Command::Unknown(verb) => Reply::new(502, format!("{} not implemented", verb)),
        // Already handled in the main loop.
        Command::User(_) | Command::Pass(_) => Reply::new(503, "Already logged in"),
        Command::Quit | Command::Syst | Command::Feat | Command::Type(_) | Command::Noop => Reply::new(200, "Ok"),
    }
}

fn error_reply(err: FtpError) -> Reply {
    match err {
        FtpError::Denied => Reply::new(550, "Permission denied"),
        FtpError::NotFound => Reply::new(550, "File not found"),
        FtpError::Failure => Reply::new(550, "Requested action not taken"),
    }
}

/// Join a client path with the working directory; absolute input (posix or
/// Windows style) stands on its own.
fn absolute(cwd: &str, arg: &str) -> String {
    let is_absolute = arg.starts_with('/')
        || arg.starts_with('\\')
        || (arg.len() >= 2 && arg.as_bytes()[1] == b':' && arg.as_bytes()[0].is_ascii_alphabetic());
    if is_absolute {
        arg.to_string()
    } else if cwd == "/" {
        format!("/{}", arg)
    } else {
        format!("{}/{}", cwd, arg)
    }
}
