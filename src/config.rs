//! Core runtime configuration and filesystem mount points.

use crate::store::{Store, StoreError};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTING_IDLE_TIMEOUT: &str = "idle_timeout_seconds";
pub const SETTING_ACTIVITY_RETENTION: &str = "activity_retention_days";
pub const SETTING_SHUTDOWN_DEADLINE: &str = "shutdown_deadline_seconds";

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 5;

/// Settings the core recognizes. Persisted in the settings table; absent
/// keys fall back to the defaults below.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Sessions idle longer than this are force-closed.
    pub idle_timeout: Duration,
    /// When set, activity rows older than this many days are purged.
    pub activity_retention_days: Option<u32>,
    /// How long `stop()` waits for sessions to drain before terminating
    /// them.
    pub shutdown_deadline: Duration,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            activity_retention_days: None,
            shutdown_deadline: Duration::from_secs(DEFAULT_SHUTDOWN_DEADLINE_SECS),
        }
    }
}

impl CoreConfig {
    /// Load the configuration from the settings table, falling back to
    /// defaults for absent or unparsable values.
    pub async fn from_store(store: &Store) -> Result<CoreConfig, StoreError> {
        let mut config = CoreConfig::default();
        if let Some(secs) = read_u64(store, SETTING_IDLE_TIMEOUT).await? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(days) = read_u64(store, SETTING_ACTIVITY_RETENTION).await? {
            config.activity_retention_days = u32::try_from(days).ok().filter(|d| *d > 0);
        }
        if let Some(secs) = read_u64(store, SETTING_SHUTDOWN_DEADLINE).await? {
            config.shutdown_deadline = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

async fn read_u64(store: &Store, key: &str) -> Result<Option<u64>, StoreError> {
    Ok(store.get_setting(key).await?.and_then(|v| v.parse().ok()))
}

/// The directories the server works out of, created at startup when
/// missing.
#[derive(Debug, Clone)]
pub struct Mounts {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Mounts {
    /// Lay out `config/`, `data/ftp-root/` and `logs/` under `base`.
    pub fn prepare<P: AsRef<Path>>(base: P) -> io::Result<Mounts> {
        let base = base.as_ref();
        let mounts = Mounts {
            config_dir: base.join("config"),
            data_dir: base.join("data"),
            logs_dir: base.join("logs"),
        };
        std::fs::create_dir_all(&mounts.config_dir)?;
        std::fs::create_dir_all(mounts.ftp_root())?;
        std::fs::create_dir_all(&mounts.logs_dir)?;
        Ok(mounts)
    }

    pub fn database_path(&self) -> PathBuf {
        self.config_dir.join("wharf.db")
    }

    pub fn host_key_path(&self) -> PathBuf {
        self.config_dir.join("ssh_host_key")
    }

    /// Default target of the bootstrap virtual path.
    pub fn ftp_root(&self) -> PathBuf {
        self.data_dir.join("ftp-root")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir.join("wharf.log")
    }
}
