//! The FTP storage adapter contract.
//!
//! The FTP engine does not touch the filesystem directly: every operation
//! goes through [`FtpStorage`], whose one real implementation,
//! [`AuthorizedFs`], consults the [`Authorizer`] with the same operation
//! kinds the SFTP handler uses and emits the same activity-record shape.
//! Subscribers can only tell the protocols apart by the listener's protocol
//! tag.

use crate::auth::Principal;
use crate::authz::{Authorizer, AuthzError, DenyReason, Operation};
use crate::notification::{ActivityEvent, ActivityRouter};
use chrono::{DateTime, Utc};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Failures surfaced to the FTP engine, already collapsed to what the
/// protocol can express.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FtpError {
    #[error("permission denied")]
    Denied,
    #[error("file or directory not found")]
    NotFound,
    #[error("operation failed")]
    Failure,
}

impl From<AuthzError> for FtpError {
    fn from(err: AuthzError) -> FtpError {
        match err {
            AuthzError::Denied(DenyReason::NoMapping) => FtpError::NotFound,
            AuthzError::Denied(_) => FtpError::Denied,
            _ => FtpError::Failure,
        }
    }
}

impl From<std::io::Error> for FtpError {
    fn from(err: std::io::Error) -> FtpError {
        match err.kind() {
            std::io::ErrorKind::NotFound => FtpError::NotFound,
            std::io::ErrorKind::PermissionDenied => FtpError::Denied,
            _ => FtpError::Failure,
        }
    }
}

/// What the FTP engine needs to know about a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// One listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// The filesystem surface the FTP engine drives. Paths may arrive in
/// whatever shape the client produced, including Windows-style absolute
/// paths; implementations normalize to posix before authorizing.
#[async_trait]
pub trait FtpStorage: Send + Sync + Debug {
    async fn metadata(&self, path: &str) -> Result<FileStat, FtpError>;
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, FtpError>;
    async fn get(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Sync + Unpin>, FtpError>;
    async fn put(&self, path: &str, input: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64, FtpError>;
    async fn delete(&self, path: &str) -> Result<(), FtpError>;
    async fn make_dir(&self, path: &str) -> Result<(), FtpError>;
    async fn remove_dir(&self, path: &str) -> Result<(), FtpError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), FtpError>;
}

/// [`FtpStorage`] bound to one authenticated session.
#[derive(Debug, Clone)]
pub struct AuthorizedFs {
    authorizer: Arc<Authorizer>,
    activities: ActivityRouter,
    principal: Principal,
    listener_id: i64,
}

impl AuthorizedFs {
    pub(crate) fn new(authorizer: Arc<Authorizer>, activities: ActivityRouter, principal: Principal, listener_id: i64) -> AuthorizedFs {
        AuthorizedFs {
            authorizer,
            activities,
            principal,
            listener_id,
        }
    }

    fn record(&self, action: &str, path: &str, success: bool) {
        self.activities
            .record(ActivityEvent::new(Some(self.listener_id), &self.principal.username, action, path, success));
    }

    async fn authorize(&self, op: Operation, path: &str) -> Result<crate::authz::Resolved, FtpError> {
        match self.authorizer.authorize(&self.principal, self.listener_id, op, path).await {
            Ok(resolved) => Ok(resolved),
            Err(err) => {
                match &err {
                    AuthzError::Denied(_) => self.record(op.denied_action(), path, false),
                    _ => self.record(op.action(), path, false),
                }
                Err(err.into())
            }
        }
    }
}

fn stat_from(meta: &std::fs::Metadata) -> FileStat {
    FileStat {
        size: meta.len(),
        is_dir: meta.is_dir(),
        modified: meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.as_secs() as i64, 0)),
    }
}

#[async_trait]
impl FtpStorage for AuthorizedFs {
    async fn metadata(&self, path: &str) -> Result<FileStat, FtpError> {
        let resolved = self.authorize(Operation::Stat, path).await?;
        let meta = tokio::fs::metadata(&resolved.local_path).await?;
        Ok(stat_from(&meta))
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, FtpError> {
        let resolved = self.authorize(Operation::List, path).await?;
        let mut dir = match tokio::fs::read_dir(&resolved.local_path).await {
            Ok(dir) => dir,
            Err(err) => {
                self.record(Operation::List.action(), &resolved.virtual_path, false);
                return Err(err.into());
            }
        };
        let mut entries = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            // Entries that fail to stat are omitted from the listing.
            if let Ok(meta) = entry.metadata().await {
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    stat: stat_from(&meta),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        self.record(Operation::List.action(), &resolved.virtual_path, true);
        Ok(entries)
    }

    async fn get(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Sync + Unpin>, FtpError> {
        let resolved = self.authorize(Operation::OpenRead, path).await?;
        match tokio::fs::File::open(&resolved.local_path).await {
            Ok(file) => {
                self.record(Operation::OpenRead.action(), &resolved.virtual_path, true);
                Ok(Box::new(tokio::io::BufReader::new(file)))
            }
            Err(err) => {
                self.record(Operation::OpenRead.action(), &resolved.virtual_path, false);
                Err(err.into())
            }
        }
    }

    async fn put(&self, path: &str, input: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64, FtpError> {
        let resolved = self.authorize(Operation::OpenWrite, path).await?;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&resolved.local_path)
                .await?;
            let mut buf = [0u8; 16 * 1024];
            let mut written: u64 = 0;
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            file.flush().await?;
            Ok::<u64, std::io::Error>(written)
        }
        .await;
        match result {
            Ok(written) => {
                self.record(Operation::OpenWrite.action(), &resolved.virtual_path, true);
                Ok(written)
            }
            Err(err) => {
                self.record(Operation::OpenWrite.action(), &resolved.virtual_path, false);
                Err(err.into())
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<(), FtpError> {
        let resolved = self.authorize(Operation::Remove, path).await?;
        match tokio::fs::remove_file(&resolved.local_path).await {
            Ok(()) => {
                self.record(Operation::Remove.action(), &resolved.virtual_path, true);
                Ok(())
            }
            Err(err) => {
                self.record(Operation::Remove.action(), &resolved.virtual_path, false);
                Err(err.into())
            }
        }
    }

    async fn make_dir(&self, path: &str) -> Result<(), FtpError> {
        let resolved = self.authorize(Operation::MakeDir, path).await?;
        match tokio::fs::create_dir(&resolved.local_path).await {
            Ok(()) => {
                self.record(Operation::MakeDir.action(), &resolved.virtual_path, true);
                Ok(())
            }
            Err(err) => {
                self.record(Operation::MakeDir.action(), &resolved.virtual_path, false);
                Err(err.into())
            }
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), FtpError> {
        let resolved = self.authorize(Operation::Remove, path).await?;
        match tokio::fs::remove_dir(&resolved.local_path).await {
            Ok(()) => {
                self.record(Operation::Remove.action(), &resolved.virtual_path, true);
                Ok(())
            }
            Err(err) => {
                self.record(Operation::Remove.action(), &resolved.virtual_path, false);
                Err(err.into())
            }
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FtpError> {
        let (resolved_from, resolved_to) = match self.authorizer.authorize_rename(&self.principal, self.listener_id, from, to).await {
            Ok(pair) => pair,
            Err(err) => {
                match &err {
                    AuthzError::Denied(_) => self.record(Operation::Rename.denied_action(), from, false),
                    _ => self.record(Operation::Rename.action(), from, false),
                }
                return Err(err.into());
            }
        };
        let logged = format!("{} -> {}", resolved_from.virtual_path, resolved_to.virtual_path);
        match tokio::fs::rename(&resolved_from.local_path, &resolved_to.local_path).await {
            Ok(()) => {
                self.record(Operation::Rename.action(), &logged, true);
                Ok(())
            }
            Err(err) => {
                self.record(Operation::Rename.action(), &logged, false);
                Err(err.into())
            }
        }
    }
}
