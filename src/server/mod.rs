//! Listener lifecycle, session tracking and the supervisor that ties the
//! running server together.

pub mod listener;
pub mod session;
pub mod shutdown;
pub mod supervisor;

pub use listener::{Listener, ListenerError};
pub use session::{SessionCloser, SessionInfo, SessionRegistry};
pub use supervisor::{Supervisor, SupervisorError};

use crate::auth::Authenticator;
use crate::authz::Authorizer;
use crate::config::CoreConfig;
use crate::notification::ActivityRouter;
use crate::store::Store;
use std::sync::Arc;

/// Username recorded on listener lifecycle and other system activities.
pub(crate) const SYSTEM_USER: &str = "system";

/// Everything a transport needs to serve sessions. Built once by the
/// supervisor and shared by all listeners.
pub(crate) struct ServerContext {
    pub store: Store,
    pub authenticator: Arc<dyn Authenticator>,
    pub authorizer: Arc<Authorizer>,
    pub registry: Arc<SessionRegistry>,
    pub activities: ActivityRouter,
    pub config: CoreConfig,
    pub host_key: Arc<ssh_key::PrivateKey>,
    pub logger: slog::Logger,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext").finish()
    }
}
