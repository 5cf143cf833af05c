#![forbid(unsafe_code)]

//! wharf is a multi-tenant SFTP and FTP file transfer server.
//!
//! Several listeners run concurrently, each bound to its own address and
//! protocol. Users authenticate against an embedded SQLite credential
//! store and are only admitted on listeners they are subscribed to. Every
//! file operation is decided twice: against the capability set the user
//! holds on the listener, and against the capability set of the
//! longest-prefix virtual path matching the request, which also maps the
//! request onto a contained local path. Everything a session does lands in
//! an append-only activity log and is fanned out to in-process
//! subscribers.
//!
//! The crate is a library plus a small binary: the [`Supervisor`] is the
//! administrative surface (start/stop listeners, enumerate and disconnect
//! sessions, subscribe to activity), and `main` only wires mounts, store
//! and supervisor together.

pub mod auth;
pub mod authz;
pub mod config;
pub mod ftp;
pub mod notification;
pub mod server;
pub mod sftp;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::config::{CoreConfig, Mounts};
pub use crate::server::{Supervisor, SupervisorError};
