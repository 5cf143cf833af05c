use super::*;
use crate::testutil::discard_logger;
use pretty_assertions::assert_eq;

async fn open_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("test.db"), discard_logger()).await.unwrap();
    (store, dir)
}

fn plain_user(name: &str) -> NewUser {
    NewUser {
        username: name.to_string(),
        password: Some("hunter2".to_string()),
        password_enabled: true,
        public_key: None,
        gui_enabled: false,
    }
}

fn local_listener(port: u16, protocol: Protocol) -> NewListener {
    NewListener {
        name: format!("{}-{}", protocol, port),
        protocol,
        binding_ip: "127.0.0.1".to_string(),
        port,
        enabled: true,
    }
}

#[tokio::test]
async fn create_and_fetch_user() {
    let (store, _dir) = open_store().await;
    let user = store.create_user(plain_user("bob")).await.unwrap();
    assert_eq!(user.username, "bob");
    assert!(user.password_enabled);
    // The hash is stored, never the cleartext.
    assert_eq!(user.password_hash.as_deref(), Some(sha256_hex("hunter2").as_str()));

    let fetched = store.user_by_username("bob").await.unwrap().unwrap();
    assert_eq!(fetched.id, user.id);
    assert!(store.user_by_username("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_username_is_rejected() {
    let (store, _dir) = open_store().await;
    store.create_user(plain_user("bob")).await.unwrap();
    let err = store.create_user(plain_user("bob")).await.unwrap_err();
    assert!(matches!(err, StoreError::Duplicate("username")));
}

#[tokio::test]
async fn empty_username_is_rejected() {
    let (store, _dir) = open_store().await;
    let err = store.create_user(plain_user("")).await.unwrap_err();
    assert!(matches!(err, StoreError::Invalid("username")));
}

#[tokio::test]
async fn password_verification_is_flat() {
    let (store, _dir) = open_store().await;
    store.create_user(plain_user("bob")).await.unwrap();

    assert!(store.verify_password("bob", "hunter2").await.unwrap());
    // Wrong password and unknown user are the same answer.
    let wrong = store.verify_password("bob", "nope").await.unwrap();
    let unknown = store.verify_password("ghost", "hunter2").await.unwrap();
    assert_eq!(wrong, unknown);
    assert!(!wrong);

    // Disabling password auth turns the right password away too.
    let user = store.user_by_username("bob").await.unwrap().unwrap();
    store
        .update_user(
            user.id,
            UserChanges {
                password_enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!store.verify_password("bob", "hunter2").await.unwrap());
}

#[tokio::test]
async fn password_update_rehashes() {
    let (store, _dir) = open_store().await;
    let user = store.create_user(plain_user("bob")).await.unwrap();
    store
        .update_user(
            user.id,
            UserChanges {
                password: Some("fresh".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(store.verify_password("bob", "fresh").await.unwrap());
    assert!(!store.verify_password("bob", "hunter2").await.unwrap());
}

#[tokio::test]
async fn user_deletion_cascades() {
    let (store, _dir) = open_store().await;
    let user = store.create_user(plain_user("bob")).await.unwrap();
    let listener = store.create_listener(local_listener(2121, Protocol::Ftp)).await.unwrap();
    store.subscribe(user.id, listener.id).await.unwrap();
    store.set_listener_caps(user.id, listener.id, ListenerCaps::all()).await.unwrap();
    store
        .add_virtual_path(NewVirtualPath {
            user_id: user.id,
            virtual_path: "/".to_string(),
            local_path: "/srv/data".into(),
            caps: PathCaps::all(),
            apply_to_subdirs: true,
        })
        .await
        .unwrap();

    store.delete_user(user.id).await.unwrap();
    assert!(store.user_by_id(user.id).await.unwrap().is_none());
    assert!(!store.is_subscribed(user.id, listener.id).await.unwrap());
    assert_eq!(store.listener_caps(user.id, listener.id).await.unwrap(), ListenerCaps::empty());
    assert!(store.virtual_paths_for_user(user.id).await.unwrap().is_empty());

    assert!(matches!(store.delete_user(user.id).await.unwrap_err(), StoreError::NotFound("user")));
}

#[tokio::test]
async fn listener_deletion_cascades_to_activities() {
    let (store, _dir) = open_store().await;
    let user = store.create_user(plain_user("bob")).await.unwrap();
    let listener = store.create_listener(local_listener(2121, Protocol::Ftp)).await.unwrap();
    store.subscribe(user.id, listener.id).await.unwrap();
    store.log_activity(Some(listener.id), "bob", "LOGIN", "", true).await.unwrap();
    store.log_activity(None, "bob", "WEAK_DEFAULT_CREDENTIAL", "", true).await.unwrap();

    store.delete_listener(listener.id).await.unwrap();
    assert!(store.listener_by_id(listener.id).await.unwrap().is_none());
    assert!(!store.is_subscribed(user.id, listener.id).await.unwrap());
    let rows = store.list_activities(ActivityFilter::default()).await.unwrap();
    // Only the system event without a listener survives.
    assert_eq!(rows.len(), 1);
    assert!(rows[0].listener_id.is_none());
}

#[tokio::test]
async fn listener_update_applies_partial_changes() {
    let (store, _dir) = open_store().await;
    let listener = store.create_listener(local_listener(2121, Protocol::Ftp)).await.unwrap();
    store
        .update_listener(
            listener.id,
            ListenerChanges {
                port: Some(2222),
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let updated = store.listener_by_id(listener.id).await.unwrap().unwrap();
    assert_eq!(updated.port, 2222);
    assert!(!updated.enabled);
    // Untouched fields survive.
    assert_eq!(updated.name, listener.name);
    assert_eq!(updated.binding_ip, listener.binding_ip);

    assert!(matches!(
        store.update_listener(999, ListenerChanges::default()).await.unwrap_err(),
        StoreError::NotFound("listener")
    ));
}

#[tokio::test]
async fn virtual_path_caps_can_be_replaced() {
    let (store, _dir) = open_store().await;
    let user = store.create_user(plain_user("bob")).await.unwrap();
    let vp = store
        .add_virtual_path(NewVirtualPath {
            user_id: user.id,
            virtual_path: "/".to_string(),
            local_path: "/srv/data".into(),
            caps: PathCaps::all(),
            apply_to_subdirs: true,
        })
        .await
        .unwrap();
    store
        .update_virtual_path_caps(vp.id, PathCaps::READ | PathCaps::LIST, false)
        .await
        .unwrap();
    let rows = store.virtual_paths_for_user(user.id).await.unwrap();
    assert_eq!(rows[0].caps, PathCaps::READ | PathCaps::LIST);
    assert!(!rows[0].apply_to_subdirs);
}

#[tokio::test]
async fn subscription_is_idempotent() {
    let (store, _dir) = open_store().await;
    let user = store.create_user(plain_user("bob")).await.unwrap();
    let listener = store.create_listener(local_listener(2121, Protocol::Sftp)).await.unwrap();

    store.subscribe(user.id, listener.id).await.unwrap();
    store.subscribe(user.id, listener.id).await.unwrap();
    assert!(store.is_subscribed(user.id, listener.id).await.unwrap());

    store.unsubscribe(user.id, listener.id).await.unwrap();
    store.unsubscribe(user.id, listener.id).await.unwrap();
    assert!(!store.is_subscribed(user.id, listener.id).await.unwrap());
}

#[tokio::test]
async fn listener_caps_round_trip() {
    let (store, _dir) = open_store().await;
    let user = store.create_user(plain_user("bob")).await.unwrap();
    let listener = store.create_listener(local_listener(2121, Protocol::Sftp)).await.unwrap();

    assert_eq!(store.listener_caps(user.id, listener.id).await.unwrap(), ListenerCaps::empty());
    let caps = ListenerCaps::LIST | ListenerCaps::CREATE;
    store.set_listener_caps(user.id, listener.id, caps).await.unwrap();
    assert_eq!(store.listener_caps(user.id, listener.id).await.unwrap(), caps);
    // Upsert replaces, it does not accumulate.
    store.set_listener_caps(user.id, listener.id, ListenerCaps::DELETE).await.unwrap();
    assert_eq!(store.listener_caps(user.id, listener.id).await.unwrap(), ListenerCaps::DELETE);
}

#[tokio::test]
async fn virtual_paths_come_longest_first() {
    let (store, _dir) = open_store().await;
    let user = store.create_user(plain_user("bob")).await.unwrap();
    for prefix in ["/", "/a/b", "/a"] {
        store
            .add_virtual_path(NewVirtualPath {
                user_id: user.id,
                virtual_path: prefix.to_string(),
                local_path: "/srv".into(),
                caps: PathCaps::all(),
                apply_to_subdirs: true,
            })
            .await
            .unwrap();
    }
    let rows = store.virtual_paths_for_user(user.id).await.unwrap();
    let prefixes: Vec<&str> = rows.iter().map(|r| r.virtual_path.as_str()).collect();
    assert_eq!(prefixes, vec!["/a/b", "/a", "/"]);

    let err = store
        .add_virtual_path(NewVirtualPath {
            user_id: user.id,
            virtual_path: "no-slash".to_string(),
            local_path: "/srv".into(),
            caps: PathCaps::all(),
            apply_to_subdirs: true,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid("virtual path")));
}

#[tokio::test]
async fn activity_filter_and_purge() {
    let (store, _dir) = open_store().await;
    store.log_activity(None, "alice", "LOGIN", "", true).await.unwrap();
    store.log_activity(None, "bob", "LOGIN", "", true).await.unwrap();
    store.log_activity(None, "bob", "DELETE", "/x", false).await.unwrap();

    let bobs = store
        .list_activities(ActivityFilter {
            username: Some("bob".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(bobs.len(), 2);
    // Newest first.
    assert_eq!(bobs[0].action, "DELETE");
    assert!(!bobs[0].success);

    let limited = store
        .list_activities(ActivityFilter {
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);

    let purged = store.purge_activities_older_than(Utc::now() + chrono::Duration::seconds(2)).await.unwrap();
    assert_eq!(purged, 3);
    assert!(store.list_activities(ActivityFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn settings_round_trip() {
    let (store, _dir) = open_store().await;
    assert!(store.get_setting("idle_timeout_seconds").await.unwrap().is_none());
    store.set_setting("idle_timeout_seconds", "120").await.unwrap();
    store.set_setting("idle_timeout_seconds", "240").await.unwrap();
    assert_eq!(store.get_setting("idle_timeout_seconds").await.unwrap().as_deref(), Some("240"));
}

#[tokio::test]
async fn old_schema_gains_permission_columns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.db");
    {
        let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
        sqlx::query(
            "CREATE TABLE virtual_paths (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                virtual_path TEXT NOT NULL,
                local_path TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO virtual_paths (user_id, virtual_path, local_path) VALUES (1, '/', '/srv/old')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    let store = Store::open(&path, discard_logger()).await.unwrap();
    let rows = store.virtual_paths_for_user(1).await.unwrap();
    assert_eq!(rows.len(), 1);
    // Migrated rows keep working with permissive defaults.
    assert_eq!(rows[0].caps, PathCaps::all());
    assert!(rows[0].apply_to_subdirs);
}

#[tokio::test]
async fn bootstrap_seeds_once() {
    let (store, _dir) = open_store().await;
    let data_root = tempfile::tempdir().unwrap();

    assert!(store.bootstrap_defaults(data_root.path()).await.unwrap());
    assert!(!store.bootstrap_defaults(data_root.path()).await.unwrap());

    let admin = store.user_by_username("admin").await.unwrap().unwrap();
    assert!(store.default_credential_intact().await.unwrap());

    let listeners = store.list_listeners().await.unwrap();
    assert_eq!(listeners.len(), 2);
    let ports: Vec<u16> = listeners.iter().map(|l| l.port).collect();
    assert!(ports.contains(&22) && ports.contains(&21));
    for listener in &listeners {
        assert!(listener.enabled);
        assert!(store.is_subscribed(admin.id, listener.id).await.unwrap());
        assert_eq!(store.listener_caps(admin.id, listener.id).await.unwrap(), ListenerCaps::all());
    }
    let vps = store.virtual_paths_for_user(admin.id).await.unwrap();
    assert_eq!(vps.len(), 1);
    assert_eq!(vps[0].virtual_path, "/");
    assert!(vps[0].local_path.ends_with("ftp-root"));

    store
        .update_user(
            admin.id,
            UserChanges {
                password: Some("something-else".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!store.default_credential_intact().await.unwrap());
}
