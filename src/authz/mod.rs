//! The authorization engine.
//!
//! Every file operation is decided here, in two layers: the capability set
//! the principal holds on the listener it connected through, and the
//! capability set on the longest-prefix virtual path matching the request.
//! Both layers must permit. On success the virtual path is materialized
//! into a local path that is guaranteed, lexically and after symlink
//! resolution, to stay inside the matched row's local root.

pub mod path;

use crate::auth::Principal;
use crate::store::{ListenerCaps, PathCaps, Store, StoreError, VirtualPath};
use derive_more::Display;
use slog::Logger;
use std::path::PathBuf;
use thiserror::Error;

/// The operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    OpenRead,
    OpenWrite,
    OpenAppend,
    List,
    Remove,
    MakeDir,
    Rename,
    Stat,
}

impl Operation {
    /// The action string recorded in the activity log for this operation.
    pub fn action(self) -> &'static str {
        match self {
            Operation::OpenRead => "DOWNLOAD",
            Operation::OpenWrite => "UPLOAD",
            Operation::OpenAppend => "APPEND",
            Operation::List => "LIST",
            Operation::Remove => "DELETE",
            Operation::MakeDir => "MKDIR",
            Operation::Rename => "RENAME",
            Operation::Stat => "STAT",
        }
    }

    /// The `_DENIED` variant of [`action`](Operation::action).
    pub fn denied_action(self) -> &'static str {
        match self {
            Operation::OpenRead => "DOWNLOAD_DENIED",
            Operation::OpenWrite => "UPLOAD_DENIED",
            Operation::OpenAppend => "APPEND_DENIED",
            Operation::List => "LIST_DENIED",
            Operation::Remove => "DELETE_DENIED",
            Operation::MakeDir => "MKDIR_DENIED",
            Operation::Rename => "RENAME_DENIED",
            Operation::Stat => "STAT_DENIED",
        }
    }

    fn vp_cap(self) -> PathCaps {
        match self {
            Operation::OpenRead => PathCaps::READ,
            Operation::OpenWrite => PathCaps::WRITE,
            Operation::OpenAppend => PathCaps::APPEND,
            Operation::List => PathCaps::LIST,
            Operation::Remove => PathCaps::DELETE,
            Operation::MakeDir => PathCaps::CREATE_DIR,
            Operation::Rename => PathCaps::RENAME,
            Operation::Stat => PathCaps::LIST,
        }
    }
}

/// The specific ground for a denial. Feeds the activity log and maps onto
/// the client-facing status code.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The principal is not subscribed to the listener.
    #[display("not subscribed")]
    NotSubscribed,
    /// No virtual path matches the request path.
    #[display("no mapping")]
    NoMapping,
    /// A capability is missing on either layer, or the matched row does not
    /// apply to subdirectories.
    #[display("capability denied")]
    Capability,
    /// The materialized path would leave its virtual root.
    #[display("path escape")]
    Escape,
}

/// Outcome of a failed authorization or resolution.
#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("denied: {0}")]
    Denied(DenyReason),
    /// Empty path or NUL bytes; structurally unusable.
    #[error("malformed path")]
    BadPath,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error during authorization")]
    Io(#[from] std::io::Error),
}

impl From<path::PathError> for AuthzError {
    fn from(e: path::PathError) -> AuthzError {
        match e {
            path::PathError::Escape => AuthzError::Denied(DenyReason::Escape),
            path::PathError::Empty | path::PathError::NulByte => AuthzError::BadPath,
        }
    }
}

/// A granted operation: the normalized virtual path, the local path to run
/// it against, and what was known about the target when deciding.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Normalized virtual path as the client will see it in listings/logs.
    pub virtual_path: String,
    /// Contained local path to perform the operation on.
    pub local_path: PathBuf,
    /// Whether the target existed at decision time. For `OpenWrite` this is
    /// what separated edit (existing) from create (absent).
    pub exists: bool,
}

/// Decides `(principal, listener, operation, virtual path)` tuples against
/// the store.
#[derive(Debug, Clone)]
pub struct Authorizer {
    store: Store,
    logger: Logger,
}

impl Authorizer {
    pub fn new(store: Store, logger: Logger) -> Authorizer {
        Authorizer { store, logger }
    }

    /// Decide a single-path operation. Deterministic for equal inputs over
    /// the same store contents.
    pub async fn authorize(&self, principal: &Principal, listener_id: i64, op: Operation, raw_path: &str) -> Result<Resolved, AuthzError> {
        let vpath = path::normalize(raw_path)?;
        if !self.store.is_subscribed(principal.user_id, listener_id).await? {
            return Err(AuthzError::Denied(DenyReason::NotSubscribed));
        }
        let rows = self.store.virtual_paths_for_user(principal.user_id).await?;
        let (resolved, vp) = self.resolve(&rows, &vpath).await?;
        let listener_caps = self.store.listener_caps(principal.user_id, listener_id).await?;
        let required = match op {
            Operation::OpenRead | Operation::List | Operation::Stat => ListenerCaps::LIST,
            Operation::OpenWrite if resolved.exists => ListenerCaps::EDIT,
            Operation::OpenWrite => ListenerCaps::CREATE,
            Operation::OpenAppend => ListenerCaps::APPEND,
            Operation::Remove => ListenerCaps::DELETE,
            Operation::MakeDir => ListenerCaps::CREATE_DIR,
            Operation::Rename => ListenerCaps::RENAME,
        };
        if !listener_caps.contains(required) {
            self.trace_denial(principal, op, &vpath, "listener capability");
            return Err(AuthzError::Denied(DenyReason::Capability));
        }
        if !vp.caps.contains(op.vp_cap()) {
            self.trace_denial(principal, op, &vpath, "virtual path capability");
            return Err(AuthzError::Denied(DenyReason::Capability));
        }
        Ok(resolved)
    }

    /// Decide a rename. The source needs the rename capability on its
    /// virtual path, the target needs write (create) on its own; the
    /// listener-layer rename capability covers both ends.
    pub async fn authorize_rename(
        &self,
        principal: &Principal,
        listener_id: i64,
        raw_from: &str,
        raw_to: &str,
    ) -> Result<(Resolved, Resolved), AuthzError> {
        let from = path::normalize(raw_from)?;
        let to = path::normalize(raw_to)?;
        if !self.store.is_subscribed(principal.user_id, listener_id).await? {
            return Err(AuthzError::Denied(DenyReason::NotSubscribed));
        }
        let listener_caps = self.store.listener_caps(principal.user_id, listener_id).await?;
        if !listener_caps.contains(ListenerCaps::RENAME) {
            self.trace_denial(principal, Operation::Rename, &from, "listener capability");
            return Err(AuthzError::Denied(DenyReason::Capability));
        }
        let rows = self.store.virtual_paths_for_user(principal.user_id).await?;
        let (resolved_from, vp_from) = self.resolve(&rows, &from).await?;
        let (resolved_to, vp_to) = self.resolve(&rows, &to).await?;
        if !vp_from.caps.contains(PathCaps::RENAME) {
            self.trace_denial(principal, Operation::Rename, &from, "source capability");
            return Err(AuthzError::Denied(DenyReason::Capability));
        }
        if !vp_to.caps.contains(PathCaps::WRITE) {
            self.trace_denial(principal, Operation::Rename, &to, "target capability");
            return Err(AuthzError::Denied(DenyReason::Capability));
        }
        Ok((resolved_from, resolved_to))
    }

    /// Map a normalized virtual path through the user's rows: longest
    /// prefix, subdirectory applicability, materialization and containment.
    async fn resolve<'a>(&self, rows: &'a [VirtualPath], vpath: &str) -> Result<(Resolved, &'a VirtualPath), AuthzError> {
        let vp = path::longest_match(rows, vpath).ok_or(AuthzError::Denied(DenyReason::NoMapping))?;
        if !vp.apply_to_subdirs && vpath != vp.virtual_path {
            return Err(AuthzError::Denied(DenyReason::Capability));
        }
        let local_path = path::materialize(vp, vpath);
        path::ensure_contained(&vp.local_path, &local_path).await?;
        let exists = tokio::fs::symlink_metadata(&local_path).await.is_ok();
        Ok((
            Resolved {
                virtual_path: vpath.to_string(),
                local_path,
                exists,
            },
            vp,
        ))
    }

    fn trace_denial(&self, principal: &Principal, op: Operation, vpath: &str, layer: &'static str) {
        slog::debug!(self.logger, "operation denied";
            "user" => %principal.username, "op" => op.action(), "path" => vpath, "layer" => layer);
    }
}
