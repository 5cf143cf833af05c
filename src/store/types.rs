//! Row types handed out by the [`Store`](super::Store).

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use derive_more::Display;
use std::path::PathBuf;
use std::str::FromStr;

/// The wire protocol a listener speaks.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// SFTP over an SSH transport.
    #[display("SFTP")]
    Sftp,
    /// Plain FTP.
    #[display("FTP")]
    Ftp,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SFTP" => Ok(Protocol::Sftp),
            "FTP" => Ok(Protocol::Ftp),
            other => Err(format!("unknown protocol {:?}", other)),
        }
    }
}

/// An account that can authenticate against subscribed listeners.
///
/// The password is only ever held as a SHA-256 hex digest; the cleartext is
/// hashed on create/update and never read back.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: Option<String>,
    pub password_enabled: bool,
    /// OpenSSH-encoded public key, if key authentication is set up.
    pub public_key: Option<String>,
    pub gui_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating a [`User`]. The password arrives as cleartext and is
/// hashed by the store.
#[derive(Debug, Default)]
pub struct NewUser {
    pub username: String,
    pub password: Option<String>,
    pub password_enabled: bool,
    pub public_key: Option<String>,
    pub gui_enabled: bool,
}

/// Partial update for a [`User`]; `None` fields are left untouched.
#[derive(Debug, Default)]
pub struct UserChanges {
    pub password: Option<String>,
    pub password_enabled: Option<bool>,
    pub public_key: Option<Option<String>>,
    pub gui_enabled: Option<bool>,
}

/// A configured network endpoint.
#[derive(Debug, Clone)]
pub struct ListenerRow {
    pub id: i64,
    pub name: String,
    pub protocol: Protocol,
    pub binding_ip: String,
    pub port: u16,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating a [`ListenerRow`].
#[derive(Debug)]
pub struct NewListener {
    pub name: String,
    pub protocol: Protocol,
    pub binding_ip: String,
    pub port: u16,
    pub enabled: bool,
}

/// Partial update for a [`ListenerRow`]; `None` fields are left untouched.
/// Changes take effect when the listener is next (re)started.
#[derive(Debug, Default)]
pub struct ListenerChanges {
    pub name: Option<String>,
    pub binding_ip: Option<String>,
    pub port: Option<u16>,
    pub enabled: Option<bool>,
}

bitflags! {
    /// The per-listener capability set granted to one user on one listener.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListenerCaps: u8 {
        const CREATE     = 0b0000_0001;
        const EDIT       = 0b0000_0010;
        const APPEND     = 0b0000_0100;
        const DELETE     = 0b0000_1000;
        const LIST       = 0b0001_0000;
        const CREATE_DIR = 0b0010_0000;
        const RENAME     = 0b0100_0000;
    }
}

bitflags! {
    /// The capability set attached to one virtual path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PathCaps: u8 {
        const READ       = 0b0000_0001;
        const WRITE      = 0b0000_0010;
        const APPEND     = 0b0000_0100;
        const DELETE     = 0b0000_1000;
        const LIST       = 0b0001_0000;
        const CREATE_DIR = 0b0010_0000;
        const RENAME     = 0b0100_0000;
    }
}

/// A user-facing path prefix mapped onto a host directory, with the
/// capabilities the user holds beneath it.
#[derive(Debug, Clone)]
pub struct VirtualPath {
    pub id: i64,
    pub user_id: i64,
    /// Posix style, always starting with `/`.
    pub virtual_path: String,
    /// Absolute host path the prefix maps to.
    pub local_path: PathBuf,
    pub caps: PathCaps,
    /// When false the capabilities apply to the exact node only, not to
    /// anything beneath it.
    pub apply_to_subdirs: bool,
}

/// Fields for creating a [`VirtualPath`].
#[derive(Debug)]
pub struct NewVirtualPath {
    pub user_id: i64,
    pub virtual_path: String,
    pub local_path: PathBuf,
    pub caps: PathCaps,
    pub apply_to_subdirs: bool,
}

/// One appended activity row. `listener_id` is `None` for system events
/// that do not belong to a specific endpoint.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub id: i64,
    pub listener_id: Option<i64>,
    pub username: String,
    pub action: String,
    pub path: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Filter for [`Store::list_activities`](super::Store::list_activities).
/// Unset fields do not constrain the result.
#[derive(Debug, Default, Clone)]
pub struct ActivityFilter {
    pub username: Option<String>,
    pub listener_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}
