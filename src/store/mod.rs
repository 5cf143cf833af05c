//! The persistence layer: a single embedded SQLite database holding users,
//! listeners, subscriptions, permissions, virtual paths, the activity log
//! and key-value settings.
//!
//! Writes are serialized behind a mutex (single-writer discipline); reads go
//! straight to the pool and may run concurrently. The schema is created on
//! first open and widened additively on later opens so databases written by
//! older versions remain usable.

mod error;
mod types;

pub mod activity;

pub use error::StoreError;
pub use types::{
    ActivityFilter, ActivityRecord, ListenerCaps, ListenerChanges, ListenerRow, NewListener, NewUser, NewVirtualPath, PathCaps, Protocol, User,
    UserChanges, VirtualPath,
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use slog::Logger;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result type used throughout the store.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Hex-encoded SHA-256 of the cleartext. This is the stored password shape;
/// see the design notes about its limits against offline attack.
pub(crate) fn sha256_hex(cleartext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cleartext.as_bytes());
    format!("{:x}", hasher.finalize())
}

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT,
        password_enabled INTEGER NOT NULL DEFAULT 1,
        public_key TEXT,
        gui_enabled INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS listeners (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        protocol TEXT NOT NULL,
        binding_ip TEXT NOT NULL,
        port INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS subscriptions (
        user_id INTEGER NOT NULL,
        listener_id INTEGER NOT NULL,
        PRIMARY KEY (user_id, listener_id)
    )",
    "CREATE TABLE IF NOT EXISTS permissions (
        user_id INTEGER NOT NULL,
        listener_id INTEGER NOT NULL,
        can_create INTEGER NOT NULL DEFAULT 0,
        can_edit INTEGER NOT NULL DEFAULT 0,
        can_append INTEGER NOT NULL DEFAULT 0,
        can_delete INTEGER NOT NULL DEFAULT 0,
        can_list INTEGER NOT NULL DEFAULT 0,
        can_create_dir INTEGER NOT NULL DEFAULT 0,
        can_rename INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, listener_id)
    )",
    "CREATE TABLE IF NOT EXISTS virtual_paths (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        virtual_path TEXT NOT NULL,
        local_path TEXT NOT NULL,
        can_read INTEGER NOT NULL DEFAULT 1,
        can_write INTEGER NOT NULL DEFAULT 1,
        can_append INTEGER NOT NULL DEFAULT 1,
        can_delete INTEGER NOT NULL DEFAULT 1,
        can_list INTEGER NOT NULL DEFAULT 1,
        can_create_dir INTEGER NOT NULL DEFAULT 1,
        can_rename INTEGER NOT NULL DEFAULT 1,
        apply_to_subdirs INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS activities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        listener_id INTEGER,
        username TEXT NOT NULL,
        action TEXT NOT NULL,
        path TEXT NOT NULL,
        success INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

// Capability columns that older databases may be missing on virtual_paths.
// They are added with permissive defaults so existing mappings keep working.
const VP_MIGRATION_COLUMNS: &[&str] = &[
    "can_read",
    "can_write",
    "can_append",
    "can_delete",
    "can_list",
    "can_create_dir",
    "can_rename",
    "apply_to_subdirs",
];

/// Handle to the embedded database. Cheap to clone; all clones share the
/// same pool and write lock.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    logger: Logger,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

impl Store {
    /// Open (creating if necessary) the database at `path` and bring its
    /// schema up to date.
    pub async fn open<P: AsRef<Path>>(path: P, logger: Logger) -> Result<Store> {
        let options = SqliteConnectOptions::new().filename(path.as_ref()).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(options).await?;
        let store = Store {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            logger,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for ddl in CREATE_TABLES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        // Additive migration: older databases predate the per-path
        // capability columns.
        let rows = sqlx::query("PRAGMA table_info(virtual_paths)").fetch_all(&self.pool).await?;
        let mut present: Vec<String> = Vec::with_capacity(rows.len());
        for row in &rows {
            present.push(row.try_get::<String, _>("name")?);
        }
        for column in VP_MIGRATION_COLUMNS {
            if !present.iter().any(|c| c == column) {
                slog::info!(self.logger, "adding missing column to virtual_paths"; "column" => *column);
                let ddl = format!("ALTER TABLE virtual_paths ADD COLUMN {} INTEGER NOT NULL DEFAULT 1", column);
                sqlx::query(&ddl)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Schema(format!("adding column {}: {}", column, e)))?;
            }
        }
        Ok(())
    }

    // ---- users -----------------------------------------------------------

    /// Create a user. The cleartext password, when given, is hashed before
    /// it touches the database.
    pub async fn create_user(&self, new: NewUser) -> Result<User> {
        if new.username.is_empty() {
            return Err(StoreError::Invalid("username"));
        }
        let _guard = self.write_lock.lock().await;
        let hash = new.password.as_deref().map(sha256_hex);
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, password_enabled, public_key, gui_enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.username)
        .bind(&hash)
        .bind(new.password_enabled)
        .bind(&new.public_key)
        .bind(new.gui_enabled)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::on_write(e, "username"))?;
        self.user_by_id(result.last_insert_rowid()).await?.ok_or(StoreError::NotFound("user"))
    }

    /// Apply the given changes; absent fields keep their value. A password
    /// change re-hashes on write.
    pub async fn update_user(&self, id: i64, changes: UserChanges) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(password) = &changes.password {
            sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
                .bind(sha256_hex(password))
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(enabled) = changes.password_enabled {
            sqlx::query("UPDATE users SET password_enabled = ? WHERE id = ?")
                .bind(enabled)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(key) = &changes.public_key {
            sqlx::query("UPDATE users SET public_key = ? WHERE id = ?")
                .bind(key)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(gui) = changes.gui_enabled {
            sqlx::query("UPDATE users SET gui_enabled = ? WHERE id = ?")
                .bind(gui)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Delete a user together with their subscriptions, permissions and
    /// virtual paths, in one transaction.
    pub async fn delete_user(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM subscriptions WHERE user_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM permissions WHERE user_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM virtual_paths WHERE user_id = ?").bind(id).execute(&mut *tx).await?;
        let result = sqlx::query("DELETE FROM users WHERE id = ?").bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("user"));
        }
        Ok(())
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY username").fetch_all(&self.pool).await?;
        rows.iter().map(user_from_row).collect()
    }

    /// True iff the user exists, is password-enabled and the digest of
    /// `cleartext` matches. Unknown users, disabled passwords and wrong
    /// passwords are indistinguishable to the caller.
    pub async fn verify_password(&self, username: &str, cleartext: &str) -> Result<bool> {
        // Hash unconditionally so probes for absent users take the same code path.
        let presented = sha256_hex(cleartext);
        let user = self.user_by_username(username).await?;
        Ok(match user {
            Some(u) => u.password_enabled && u.password_hash.as_deref() == Some(presented.as_str()),
            None => false,
        })
    }

    // ---- listeners -------------------------------------------------------

    pub async fn create_listener(&self, new: NewListener) -> Result<ListenerRow> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO listeners (name, protocol, binding_ip, port, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.name)
        .bind(new.protocol.to_string())
        .bind(&new.binding_ip)
        .bind(new.port as i64)
        .bind(new.enabled)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::on_write(e, "listener"))?;
        self.listener_by_id(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::NotFound("listener"))
    }

    pub async fn set_listener_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.update_listener(
            id,
            ListenerChanges {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    /// Apply the given changes; absent fields keep their value. A running
    /// listener picks them up on restart.
    pub async fn update_listener(&self, id: i64, changes: ListenerChanges) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.listener_by_id(id).await?.is_none() {
            return Err(StoreError::NotFound("listener"));
        }
        if let Some(name) = &changes.name {
            sqlx::query("UPDATE listeners SET name = ? WHERE id = ?").bind(name).bind(id).execute(&self.pool).await?;
        }
        if let Some(ip) = &changes.binding_ip {
            sqlx::query("UPDATE listeners SET binding_ip = ? WHERE id = ?")
                .bind(ip)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(port) = changes.port {
            sqlx::query("UPDATE listeners SET port = ? WHERE id = ?")
                .bind(port as i64)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(enabled) = changes.enabled {
            sqlx::query("UPDATE listeners SET enabled = ? WHERE id = ?")
                .bind(enabled)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Delete a listener and everything referencing it (subscriptions,
    /// permissions, activity rows) in one transaction.
    pub async fn delete_listener(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM subscriptions WHERE listener_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM permissions WHERE listener_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM activities WHERE listener_id = ?").bind(id).execute(&mut *tx).await?;
        let result = sqlx::query("DELETE FROM listeners WHERE id = ?").bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("listener"));
        }
        Ok(())
    }

    pub async fn listener_by_id(&self, id: i64) -> Result<Option<ListenerRow>> {
        let row = sqlx::query("SELECT * FROM listeners WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| listener_from_row(&r)).transpose()
    }

    pub async fn list_listeners(&self) -> Result<Vec<ListenerRow>> {
        let rows = sqlx::query("SELECT * FROM listeners ORDER BY id").fetch_all(&self.pool).await?;
        rows.iter().map(listener_from_row).collect()
    }

    // ---- subscriptions ---------------------------------------------------

    /// Attach a user to a listener. Repeating the call is a no-op.
    pub async fn subscribe(&self, user_id: i64, listener_id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("INSERT OR IGNORE INTO subscriptions (user_id, listener_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(listener_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Detach a user from a listener. Repeating the call is a no-op.
    pub async fn unsubscribe(&self, user_id: i64, listener_id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM subscriptions WHERE user_id = ? AND listener_id = ?")
            .bind(user_id)
            .bind(listener_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_subscribed(&self, user_id: i64, listener_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM subscriptions WHERE user_id = ? AND listener_id = ?")
            .bind(user_id)
            .bind(listener_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    // ---- listener permissions --------------------------------------------

    /// Upsert the capability set one user holds on one listener.
    pub async fn set_listener_caps(&self, user_id: i64, listener_id: i64, caps: ListenerCaps) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO permissions
                 (user_id, listener_id, can_create, can_edit, can_append, can_delete, can_list, can_create_dir, can_rename)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, listener_id) DO UPDATE SET
                 can_create = excluded.can_create,
                 can_edit = excluded.can_edit,
                 can_append = excluded.can_append,
                 can_delete = excluded.can_delete,
                 can_list = excluded.can_list,
                 can_create_dir = excluded.can_create_dir,
                 can_rename = excluded.can_rename",
        )
        .bind(user_id)
        .bind(listener_id)
        .bind(caps.contains(ListenerCaps::CREATE))
        .bind(caps.contains(ListenerCaps::EDIT))
        .bind(caps.contains(ListenerCaps::APPEND))
        .bind(caps.contains(ListenerCaps::DELETE))
        .bind(caps.contains(ListenerCaps::LIST))
        .bind(caps.contains(ListenerCaps::CREATE_DIR))
        .bind(caps.contains(ListenerCaps::RENAME))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The capability set for `(user, listener)`; absent rows mean no
    /// capabilities at all.
    pub async fn listener_caps(&self, user_id: i64, listener_id: i64) -> Result<ListenerCaps> {
        let row = sqlx::query("SELECT * FROM permissions WHERE user_id = ? AND listener_id = ?")
            .bind(user_id)
            .bind(listener_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(ListenerCaps::empty()),
            Some(r) => {
                let mut caps = ListenerCaps::empty();
                caps.set(ListenerCaps::CREATE, r.try_get("can_create")?);
                caps.set(ListenerCaps::EDIT, r.try_get("can_edit")?);
                caps.set(ListenerCaps::APPEND, r.try_get("can_append")?);
                caps.set(ListenerCaps::DELETE, r.try_get("can_delete")?);
                caps.set(ListenerCaps::LIST, r.try_get("can_list")?);
                caps.set(ListenerCaps::CREATE_DIR, r.try_get("can_create_dir")?);
                caps.set(ListenerCaps::RENAME, r.try_get("can_rename")?);
                Ok(caps)
            }
        }
    }

    // ---- virtual paths ---------------------------------------------------

    pub async fn add_virtual_path(&self, new: NewVirtualPath) -> Result<VirtualPath> {
        if !new.virtual_path.starts_with('/') {
            return Err(StoreError::Invalid("virtual path"));
        }
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT INTO virtual_paths
                 (user_id, virtual_path, local_path, can_read, can_write, can_append, can_delete, can_list, can_create_dir, can_rename, apply_to_subdirs)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.user_id)
        .bind(&new.virtual_path)
        .bind(new.local_path.to_string_lossy().into_owned())
        .bind(new.caps.contains(PathCaps::READ))
        .bind(new.caps.contains(PathCaps::WRITE))
        .bind(new.caps.contains(PathCaps::APPEND))
        .bind(new.caps.contains(PathCaps::DELETE))
        .bind(new.caps.contains(PathCaps::LIST))
        .bind(new.caps.contains(PathCaps::CREATE_DIR))
        .bind(new.caps.contains(PathCaps::RENAME))
        .bind(new.apply_to_subdirs)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::on_write(e, "virtual path"))?;
        let id = result.last_insert_rowid();
        let row = sqlx::query("SELECT * FROM virtual_paths WHERE id = ?").bind(id).fetch_one(&self.pool).await?;
        virtual_path_from_row(&row)
    }

    /// Replace the capability set and subdirectory flag of one virtual
    /// path row.
    pub async fn update_virtual_path_caps(&self, id: i64, caps: PathCaps, apply_to_subdirs: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE virtual_paths SET
                 can_read = ?, can_write = ?, can_append = ?, can_delete = ?,
                 can_list = ?, can_create_dir = ?, can_rename = ?, apply_to_subdirs = ?
             WHERE id = ?",
        )
        .bind(caps.contains(PathCaps::READ))
        .bind(caps.contains(PathCaps::WRITE))
        .bind(caps.contains(PathCaps::APPEND))
        .bind(caps.contains(PathCaps::DELETE))
        .bind(caps.contains(PathCaps::LIST))
        .bind(caps.contains(PathCaps::CREATE_DIR))
        .bind(caps.contains(PathCaps::RENAME))
        .bind(apply_to_subdirs)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("virtual path"));
        }
        Ok(())
    }

    pub async fn remove_virtual_path(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM virtual_paths WHERE id = ?").bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("virtual path"));
        }
        Ok(())
    }

    /// All virtual paths of one user, longest prefix first so the first
    /// match during lookup is the winning one.
    pub async fn virtual_paths_for_user(&self, user_id: i64) -> Result<Vec<VirtualPath>> {
        let rows = sqlx::query("SELECT * FROM virtual_paths WHERE user_id = ? ORDER BY LENGTH(virtual_path) DESC, id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(virtual_path_from_row).collect()
    }

    // ---- activities ------------------------------------------------------

    /// Append one activity row. Prefer going through
    /// [`activity::ActivitySpool`] from request paths; this call hits the
    /// database directly.
    pub async fn log_activity(&self, listener_id: Option<i64>, username: &str, action: &str, path: &str, success: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("INSERT INTO activities (listener_id, username, action, path, success, timestamp) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(listener_id)
            .bind(username)
            .bind(action)
            .bind(path)
            .bind(success)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_activities(&self, filter: ActivityFilter) -> Result<Vec<ActivityRecord>> {
        let mut sql = String::from("SELECT * FROM activities WHERE 1=1");
        if filter.username.is_some() {
            sql.push_str(" AND username = ?");
        }
        if filter.listener_id.is_some() {
            sql.push_str(" AND listener_id = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        sql.push_str(" ORDER BY id DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }
        let mut query = sqlx::query(&sql);
        if let Some(username) = &filter.username {
            query = query.bind(username);
        }
        if let Some(listener_id) = filter.listener_id {
            query = query.bind(listener_id);
        }
        if let Some(since) = filter.since {
            query = query.bind(since.timestamp());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(activity_from_row).collect()
    }

    /// Drop activity rows older than `cutoff`, returning how many went.
    pub async fn purge_activities_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM activities WHERE timestamp < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- settings --------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?").bind(key).fetch_optional(&self.pool).await?;
        row.map(|r| r.try_get::<String, _>("value").map_err(StoreError::from)).transpose()
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT (key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- bootstrap -------------------------------------------------------

    /// Seed an empty database with the default admin account, one SFTP and
    /// one FTP listener, full permissions and a root virtual path pointing
    /// at `data_root`. Returns whether seeding happened.
    pub async fn bootstrap_defaults(&self, data_root: &Path) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users").fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        if n > 0 {
            return Ok(false);
        }
        slog::info!(self.logger, "empty database, seeding default configuration");
        let admin = self
            .create_user(NewUser {
                username: "admin".to_string(),
                password: Some("admin123".to_string()),
                password_enabled: true,
                public_key: None,
                gui_enabled: true,
            })
            .await?;
        let sftp = self
            .create_listener(NewListener {
                name: "SFTP".to_string(),
                protocol: Protocol::Sftp,
                binding_ip: "0.0.0.0".to_string(),
                port: 22,
                enabled: true,
            })
            .await?;
        let ftp = self
            .create_listener(NewListener {
                name: "FTP".to_string(),
                protocol: Protocol::Ftp,
                binding_ip: "0.0.0.0".to_string(),
                port: 21,
                enabled: true,
            })
            .await?;
        for listener in [&sftp, &ftp] {
            self.subscribe(admin.id, listener.id).await?;
            self.set_listener_caps(admin.id, listener.id, ListenerCaps::all()).await?;
        }
        self.add_virtual_path(NewVirtualPath {
            user_id: admin.id,
            virtual_path: "/".to_string(),
            local_path: data_root.join("ftp-root"),
            caps: PathCaps::all(),
            apply_to_subdirs: true,
        })
        .await?;
        Ok(true)
    }

    /// Whether the shipped `admin`/`admin123` credential would still log in.
    pub async fn default_credential_intact(&self) -> Result<bool> {
        self.verify_password("admin", "admin123").await
    }
}

fn timestamp_from(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        password_enabled: row.try_get("password_enabled")?,
        public_key: row.try_get("public_key")?,
        gui_enabled: row.try_get("gui_enabled")?,
        created_at: timestamp_from(row.try_get("created_at")?),
    })
}

fn listener_from_row(row: &SqliteRow) -> Result<ListenerRow> {
    let protocol: String = row.try_get("protocol")?;
    let port: i64 = row.try_get("port")?;
    Ok(ListenerRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        protocol: Protocol::from_str(&protocol).map_err(StoreError::Schema)?,
        binding_ip: row.try_get("binding_ip")?,
        port: u16::try_from(port).map_err(|_| StoreError::Schema(format!("port {} out of range", port)))?,
        enabled: row.try_get("enabled")?,
        created_at: timestamp_from(row.try_get("created_at")?),
    })
}

fn virtual_path_from_row(row: &SqliteRow) -> Result<VirtualPath> {
    let mut caps = PathCaps::empty();
    caps.set(PathCaps::READ, row.try_get("can_read")?);
    caps.set(PathCaps::WRITE, row.try_get("can_write")?);
    caps.set(PathCaps::APPEND, row.try_get("can_append")?);
    caps.set(PathCaps::DELETE, row.try_get("can_delete")?);
    caps.set(PathCaps::LIST, row.try_get("can_list")?);
    caps.set(PathCaps::CREATE_DIR, row.try_get("can_create_dir")?);
    caps.set(PathCaps::RENAME, row.try_get("can_rename")?);
    let local: String = row.try_get("local_path")?;
    Ok(VirtualPath {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        virtual_path: row.try_get("virtual_path")?,
        local_path: local.into(),
        caps,
        apply_to_subdirs: row.try_get("apply_to_subdirs")?,
    })
}

fn activity_from_row(row: &SqliteRow) -> Result<ActivityRecord> {
    Ok(ActivityRecord {
        id: row.try_get("id")?,
        listener_id: row.try_get("listener_id")?,
        username: row.try_get("username")?,
        action: row.try_get("action")?,
        path: row.try_get("path")?,
        success: row.try_get("success")?,
        timestamp: timestamp_from(row.try_get("timestamp")?),
    })
}

#[cfg(test)]
mod tests;
