//! FTP endpoint: the accept loop and the storage adapter the engine
//! drives. See [`vfs`] for the authorization contract and [`control`] for
//! the control-channel surface.

pub mod control;
pub mod vfs;

pub use vfs::{AuthorizedFs, DirEntry, FileStat, FtpError, FtpStorage};

use crate::server::shutdown::Notifier;
use crate::server::ServerContext;
use crate::store::ListenerRow;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Run the FTP accept loop on an already-bound socket until the listener
/// drains.
pub(crate) async fn serve(socket: TcpListener, row: ListenerRow, ctx: Arc<ServerContext>, shutdown: Arc<Notifier>) {
    let logger = ctx.logger.new(slog::o!("listener" => row.name.clone()));
    let mut watcher = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = watcher.listen() => break,
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    slog::debug!(logger, "incoming control connection"; "peer" => %peer);
                    let session_watcher = shutdown.subscribe();
                    tokio::spawn(control::run_control_session(stream, peer, row.clone(), ctx.clone(), session_watcher));
                }
                Err(err) => {
                    slog::error!(logger, "error accepting control connection"; "error" => %err);
                }
            }
        }
    }
}
