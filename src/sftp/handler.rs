//! The SFTP v3 request handler.
//!
//! One handler instance exists per session; the SSH transport feeds it
//! decoded SFTP requests in arrival order. Every request resets the
//! session's idle timer, is decided by the [`Authorizer`] and answered with
//! the SFTP v3 status codes; denied operations additionally produce a
//! `*_DENIED` activity record.

use super::handles::{DirHandle, FileHandle, HandleMap};
use super::IdleTimer;
use crate::auth::Principal;
use crate::authz::{AuthzError, DenyReason, Operation, Resolved};
use crate::notification::ActivityEvent;
use crate::server::ServerContext;
use chrono::{DateTime, Utc};
use russh_sftp::protocol::{Attrs, Data, File, FileAttributes, Handle as SftpHandle, Name, OpenFlags, Status, StatusCode, Version};
use slog::Logger;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// READDIR returns at most this many entries per round trip.
const READDIR_BATCH: usize = 100;

/// Upper bound on a single READ, keeping allocations sane. Short reads are
/// allowed by the protocol.
const MAX_READ_LEN: usize = 256 * 1024;

pub struct SftpHandler {
    ctx: Arc<ServerContext>,
    principal: Principal,
    listener_id: i64,
    session_id: Uuid,
    handles: HandleMap,
    timer: IdleTimer,
    logger: Logger,
}

impl SftpHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>, principal: Principal, listener_id: i64, session_id: Uuid, timer: IdleTimer) -> SftpHandler {
        let logger = ctx.logger.new(slog::o!(
            "session" => session_id.to_string(),
            "user" => principal.username.clone(),
        ));
        SftpHandler {
            ctx,
            principal,
            listener_id,
            session_id,
            handles: HandleMap::new(),
            timer,
            logger,
        }
    }

    pub(crate) fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Lifetime open/close counters, for teardown assertions.
    pub(crate) fn handle_totals(&self) -> (u64, u64) {
        self.handles.totals()
    }

    fn record(&self, action: &str, path: &str, success: bool) {
        self.ctx
            .activities
            .record(ActivityEvent::new(Some(self.listener_id), &self.principal.username, action, path, success));
    }

    /// Run an operation through the authorizer; denials are logged with
    /// their `_DENIED` action and converted to a status code.
    async fn authorize(&self, op: Operation, raw_path: &str) -> Result<Resolved, StatusCode> {
        match self.ctx.authorizer.authorize(&self.principal, self.listener_id, op, raw_path).await {
            Ok(resolved) => Ok(resolved),
            Err(err) => {
                match &err {
                    AuthzError::Denied(_) => self.record(op.denied_action(), raw_path, false),
                    _ => self.record(op.action(), raw_path, false),
                }
                Err(status_for(&err))
            }
        }
    }

    fn ok_status(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(&mut self, version: u32, _extensions: HashMap<String, String>) -> Result<Version, Self::Error> {
        self.timer.touch();
        slog::debug!(self.logger, "sftp subsystem initialized"; "client_version" => version);
        Ok(Version::new())
    }

    async fn open(&mut self, id: u32, filename: String, pflags: OpenFlags, _attrs: FileAttributes) -> Result<SftpHandle, Self::Error> {
        self.timer.touch();
        let wants_write = pflags.intersects(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE);
        let op = if pflags.contains(OpenFlags::APPEND) {
            Operation::OpenAppend
        } else if wants_write {
            Operation::OpenWrite
        } else {
            Operation::OpenRead
        };
        let resolved = self.authorize(op, &filename).await?;

        let mut options = tokio::fs::OpenOptions::new();
        options.read(pflags.contains(OpenFlags::READ) || !wants_write);
        if wants_write || pflags.contains(OpenFlags::APPEND) {
            options.write(true);
        }
        if pflags.contains(OpenFlags::APPEND) {
            options.append(true);
        }
        if pflags.contains(OpenFlags::CREATE) {
            options.create(true);
        }
        if pflags.contains(OpenFlags::TRUNCATE) {
            options.truncate(true);
        }
        if pflags.contains(OpenFlags::EXCLUDE) {
            options.create_new(true);
        }
        match options.open(&resolved.local_path).await {
            Ok(file) => {
                self.record(op.action(), &resolved.virtual_path, true);
                let handle = self.handles.insert_file(FileHandle {
                    file,
                    virtual_path: resolved.virtual_path,
                    local_path: resolved.local_path,
                    append: pflags.contains(OpenFlags::APPEND),
                });
                Ok(SftpHandle { id, handle })
            }
            Err(err) => {
                self.record(op.action(), &resolved.virtual_path, false);
                Err(status_for_io(&err))
            }
        }
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.timer.touch();
        // Discarding an unknown handle is still a structural success.
        self.handles.close(&handle);
        Ok(Self::ok_status(id))
    }

    async fn read(&mut self, id: u32, handle: String, offset: u64, len: u32) -> Result<Data, Self::Error> {
        self.timer.touch();
        let entry = self.handles.file_mut(&handle).ok_or(StatusCode::BadMessage)?;
        let wanted = (len as usize).min(MAX_READ_LEN);
        let mut buf = vec![0u8; wanted];
        entry.file.seek(SeekFrom::Start(offset)).await.map_err(|e| status_for_io(&e))?;
        let n = entry.file.read(&mut buf).await.map_err(|e| status_for_io(&e))?;
        if n == 0 && wanted > 0 {
            return Err(StatusCode::Eof);
        }
        buf.truncate(n);
        Ok(Data { id, data: buf })
    }

    async fn write(&mut self, id: u32, handle: String, offset: u64, data: Vec<u8>) -> Result<Status, Self::Error> {
        self.timer.touch();
        let entry = self.handles.file_mut(&handle).ok_or(StatusCode::BadMessage)?;
        if entry.append {
            // Append handles ignore the client offset; the descriptor is in
            // append mode so the kernel places the write at the end.
            entry.file.write_all(&data).await.map_err(|e| status_for_io(&e))?;
        } else {
            entry.file.seek(SeekFrom::Start(offset)).await.map_err(|e| status_for_io(&e))?;
            entry.file.write_all(&data).await.map_err(|e| status_for_io(&e))?;
        }
        Ok(Self::ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<SftpHandle, Self::Error> {
        self.timer.touch();
        let resolved = self.authorize(Operation::List, &path).await?;
        let mut names = Vec::new();
        match tokio::fs::read_dir(&resolved.local_path).await {
            Ok(mut dir) => loop {
                match dir.next_entry().await {
                    Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
                    Ok(None) => break,
                    Err(err) => {
                        self.record(Operation::List.action(), &resolved.virtual_path, false);
                        return Err(status_for_io(&err));
                    }
                }
            },
            Err(err) => {
                self.record(Operation::List.action(), &resolved.virtual_path, false);
                return Err(status_for_io(&err));
            }
        }
        names.sort();
        self.record(Operation::List.action(), &resolved.virtual_path, true);
        let handle = self.handles.insert_dir(DirHandle {
            virtual_path: resolved.virtual_path,
            local_path: resolved.local_path,
            entries: names,
            cursor: 0,
        });
        Ok(SftpHandle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        self.timer.touch();
        let entry = self.handles.dir_mut(&handle).ok_or(StatusCode::BadMessage)?;
        if entry.cursor >= entry.entries.len() {
            return Err(StatusCode::Eof);
        }
        let mut files = Vec::new();
        while entry.cursor < entry.entries.len() && files.len() < READDIR_BATCH {
            let name = entry.entries[entry.cursor].clone();
            entry.cursor += 1;
            // Entries that fail to stat are omitted, not fatal.
            match tokio::fs::symlink_metadata(entry.local_path.join(&name)).await {
                Ok(meta) => {
                    let attrs = attrs_from_metadata(&meta);
                    files.push(File {
                        longname: longname(&name, &meta, &attrs),
                        filename: name,
                        attrs,
                    });
                }
                Err(_) => continue,
            }
        }
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.timer.touch();
        let resolved = self.authorize(Operation::Remove, &filename).await?;
        match tokio::fs::remove_file(&resolved.local_path).await {
            Ok(()) => {
                self.record(Operation::Remove.action(), &resolved.virtual_path, true);
                Ok(Self::ok_status(id))
            }
            Err(err) => {
                self.record(Operation::Remove.action(), &resolved.virtual_path, false);
                Err(status_for_io(&err))
            }
        }
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.timer.touch();
        let resolved = self.authorize(Operation::Remove, &path).await?;
        match tokio::fs::remove_dir(&resolved.local_path).await {
            Ok(()) => {
                self.record(Operation::Remove.action(), &resolved.virtual_path, true);
                Ok(Self::ok_status(id))
            }
            Err(err) => {
                self.record(Operation::Remove.action(), &resolved.virtual_path, false);
                // A populated directory is a plain failure, not NoSuchFile.
                if resolved.exists {
                    Err(StatusCode::Failure)
                } else {
                    Err(status_for_io(&err))
                }
            }
        }
    }

    async fn mkdir(&mut self, id: u32, path: String, _attrs: FileAttributes) -> Result<Status, Self::Error> {
        self.timer.touch();
        let resolved = self.authorize(Operation::MakeDir, &path).await?;
        match tokio::fs::create_dir(&resolved.local_path).await {
            Ok(()) => {
                self.record(Operation::MakeDir.action(), &resolved.virtual_path, true);
                Ok(Self::ok_status(id))
            }
            Err(err) => {
                self.record(Operation::MakeDir.action(), &resolved.virtual_path, false);
                Err(status_for_io(&err))
            }
        }
    }

    async fn rename(&mut self, id: u32, oldpath: String, newpath: String) -> Result<Status, Self::Error> {
        self.timer.touch();
        let (from, to) = match self
            .ctx
            .authorizer
            .authorize_rename(&self.principal, self.listener_id, &oldpath, &newpath)
            .await
        {
            Ok(pair) => pair,
            Err(err) => {
                match &err {
                    AuthzError::Denied(_) => self.record(Operation::Rename.denied_action(), &oldpath, false),
                    _ => self.record(Operation::Rename.action(), &oldpath, false),
                }
                return Err(status_for(&err));
            }
        };
        let logged = format!("{} -> {}", from.virtual_path, to.virtual_path);
        match tokio::fs::rename(&from.local_path, &to.local_path).await {
            Ok(()) => {
                self.record(Operation::Rename.action(), &logged, true);
                Ok(Self::ok_status(id))
            }
            Err(err) => {
                self.record(Operation::Rename.action(), &logged, false);
                Err(status_for_io(&err))
            }
        }
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.timer.touch();
        let resolved = self.authorize(Operation::Stat, &path).await?;
        let meta = tokio::fs::metadata(&resolved.local_path).await.map_err(|e| status_for_io(&e))?;
        Ok(Attrs {
            id,
            attrs: attrs_from_metadata(&meta),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.timer.touch();
        let resolved = self.authorize(Operation::Stat, &path).await?;
        let meta = tokio::fs::symlink_metadata(&resolved.local_path).await.map_err(|e| status_for_io(&e))?;
        Ok(Attrs {
            id,
            attrs: attrs_from_metadata(&meta),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        self.timer.touch();
        let entry = self.handles.file_mut(&handle).ok_or(StatusCode::BadMessage)?;
        let meta = entry.file.metadata().await.map_err(|e| status_for_io(&e))?;
        Ok(Attrs {
            id,
            attrs: attrs_from_metadata(&meta),
        })
    }

    async fn setstat(&mut self, id: u32, path: String, attrs: FileAttributes) -> Result<Status, Self::Error> {
        self.timer.touch();
        let resolved = self.authorize(Operation::OpenWrite, &path).await?;
        apply_attrs(&resolved.local_path, &attrs).await.map_err(|e| status_for_io(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn fsetstat(&mut self, id: u32, handle: String, attrs: FileAttributes) -> Result<Status, Self::Error> {
        self.timer.touch();
        let local = self
            .handles
            .file_mut(&handle)
            .map(|h| h.local_path.clone())
            .ok_or(StatusCode::BadMessage)?;
        apply_attrs(&local, &attrs).await.map_err(|e| status_for_io(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        self.timer.touch();
        // Purely lexical: clients call this for paths that may not exist.
        let normalized = crate::authz::path::normalize(&path).map_err(|_| StatusCode::Failure)?;
        Ok(Name {
            id,
            files: vec![File::dummy(normalized)],
        })
    }
}

fn status_for(err: &AuthzError) -> StatusCode {
    match err {
        AuthzError::Denied(DenyReason::NoMapping) => StatusCode::NoSuchFile,
        AuthzError::Denied(_) => StatusCode::PermissionDenied,
        AuthzError::BadPath => StatusCode::Failure,
        AuthzError::Store(_) | AuthzError::Io(_) => StatusCode::Failure,
    }
}

fn status_for_io(err: &std::io::Error) -> StatusCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

fn attrs_from_metadata(meta: &std::fs::Metadata) -> FileAttributes {
    let type_bits = if meta.is_dir() {
        S_IFDIR
    } else if meta.file_type().is_symlink() {
        S_IFLNK
    } else {
        S_IFREG
    };
    #[cfg(unix)]
    let (mode, uid, gid) = {
        use std::os::unix::fs::MetadataExt;
        (meta.mode() & 0o7777, meta.uid(), meta.gid())
    };
    #[cfg(not(unix))]
    let (mode, uid, gid) = (if meta.is_dir() { 0o755 } else { 0o644 }, 0, 0);

    let seconds = |time: std::io::Result<std::time::SystemTime>| {
        time.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
    };
    FileAttributes {
        size: Some(meta.len()),
        uid: Some(uid),
        gid: Some(gid),
        permissions: Some(type_bits | mode),
        atime: seconds(meta.accessed()),
        mtime: seconds(meta.modified()),
        ..Default::default()
    }
}

/// An `ls -l` style line for READDIR listings.
fn longname(name: &str, meta: &std::fs::Metadata, attrs: &FileAttributes) -> String {
    let mode = attrs.permissions.unwrap_or(0);
    let kind = if meta.is_dir() {
        'd'
    } else if meta.file_type().is_symlink() {
        'l'
    } else {
        '-'
    };
    let mut perms = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    let when = attrs
        .mtime
        .and_then(|t| DateTime::<Utc>::from_timestamp(i64::from(t), 0))
        .map(|t| t.format("%b %e %H:%M").to_string())
        .unwrap_or_else(|| "Jan  1 00:00".to_string());
    format!("{}{} 1 {:<8} {:<8} {:>12} {} {}", kind, perms, attrs.uid.unwrap_or(0), attrs.gid.unwrap_or(0), meta.len(), when, name)
}

async fn apply_attrs(path: &Path, attrs: &FileAttributes) -> std::io::Result<()> {
    if let Some(size) = attrs.size {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(size).await?;
    }
    #[cfg(unix)]
    if let Some(mode) = attrs.permissions {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
    }
    // Timestamps are accepted and ignored; clients routinely set them after
    // an upload and must not see the transfer fail over it.
    Ok(())
}

#[cfg(test)]
mod tests;
