//! Shared fixtures for the unit tests.

use crate::auth::{Principal, StoreAuthenticator};
use crate::authz::Authorizer;
use crate::config::CoreConfig;
use crate::notification::ActivityRouter;
use crate::server::{ServerContext, SessionRegistry};
use crate::store::{ListenerCaps, ListenerRow, NewListener, NewUser, NewVirtualPath, PathCaps, Protocol, Store, User, VirtualPath};
use slog::Drain;
use std::sync::Arc;

pub(crate) fn discard_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard.fuse(), slog::o!())
}

/// A store in a throwaway directory plus one user, one listener and one
/// root virtual path over another throwaway directory.
pub(crate) struct Fixture {
    pub store: Store,
    pub ctx: Arc<ServerContext>,
    pub user: User,
    pub listener: ListenerRow,
    pub vp: VirtualPath,
    pub root: tempfile::TempDir,
    _db_dir: tempfile::TempDir,
}

impl Fixture {
    pub(crate) fn principal(&self) -> Principal {
        Principal {
            user_id: self.user.id,
            username: self.user.username.clone(),
        }
    }

    /// Poll the activity log until a row with `action` shows up; panics
    /// after a couple of seconds. The spool writes asynchronously.
    pub(crate) async fn wait_for_activity(&self, action: &str) -> crate::store::ActivityRecord {
        for _ in 0..100 {
            let rows = self.store.list_activities(Default::default()).await.unwrap();
            if let Some(row) = rows.into_iter().find(|r| r.action == action) {
                return row;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("activity {:?} never recorded", action);
    }
}

pub(crate) async fn fixture() -> Fixture {
    fixture_with_caps(ListenerCaps::all(), PathCaps::all()).await
}

pub(crate) async fn fixture_with_caps(listener_caps: ListenerCaps, path_caps: PathCaps) -> Fixture {
    let db_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let logger = discard_logger();
    let store = Store::open(db_dir.path().join("test.db"), logger.clone()).await.unwrap();

    let user = store
        .create_user(NewUser {
            username: "alice".to_string(),
            password: Some("secret".to_string()),
            password_enabled: true,
            public_key: None,
            gui_enabled: false,
        })
        .await
        .unwrap();
    let listener = store
        .create_listener(NewListener {
            name: "test-sftp".to_string(),
            protocol: Protocol::Sftp,
            binding_ip: "127.0.0.1".to_string(),
            port: 2222,
            enabled: true,
        })
        .await
        .unwrap();
    store.subscribe(user.id, listener.id).await.unwrap();
    store.set_listener_caps(user.id, listener.id, listener_caps).await.unwrap();
    let vp = store
        .add_virtual_path(NewVirtualPath {
            user_id: user.id,
            virtual_path: "/".to_string(),
            local_path: root.path().to_path_buf(),
            caps: path_caps,
            apply_to_subdirs: true,
        })
        .await
        .unwrap();

    let host_key = ssh_key::PrivateKey::random(&mut ssh_key::rand_core::OsRng, ssh_key::Algorithm::Ed25519).unwrap();
    let ctx = Arc::new(ServerContext {
        store: store.clone(),
        authenticator: Arc::new(StoreAuthenticator::new(store.clone())),
        authorizer: Arc::new(Authorizer::new(store.clone(), logger.clone())),
        registry: Arc::new(SessionRegistry::new()),
        activities: ActivityRouter::new(store.clone(), logger.clone()),
        config: CoreConfig::default(),
        host_key: Arc::new(host_key),
        logger,
    });

    Fixture {
        store,
        ctx,
        user,
        listener,
        vp,
        root,
        _db_dir: db_dir,
    }
}
