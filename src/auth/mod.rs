//! Authentication of connecting clients against the credential store.
//!
//! The transports (SSH, FTP control channel) hand the presented credentials
//! to an [`Authenticator`] and receive a [`Principal`] on success. Failure
//! is deliberately flat: unknown users, disabled or wrong passwords and
//! mismatched keys all come back as [`AuthenticationError::Failed`].

use crate::store::Store;
use async_trait::async_trait;
use ssh_key::PublicKey;
use std::fmt::Debug;
use thiserror::Error;

/// The authenticated identity a session acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub username: String,
}

/// Credentials presented during authentication. The public key, when
/// present, is the OpenSSH single-line encoding.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub password: Option<String>,
    pub public_key: Option<String>,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Credentials {
        Credentials {
            password: Some(password.into()),
            public_key: None,
        }
    }

    pub fn public_key(key: impl Into<String>) -> Credentials {
        Credentials {
            password: None,
            public_key: Some(key.into()),
        }
    }
}

/// Why authentication did not yield a principal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthenticationError {
    /// Bad username, bad password or bad key. Indistinguishable on purpose.
    #[error("authentication failed")]
    Failed,
    /// The credentials are fine but the user is not attached to this
    /// listener.
    #[error("user not subscribed to listener")]
    NotSubscribed,
    /// The store could not be consulted.
    #[error("authentication backend unavailable")]
    Internal,
}

/// Authenticates a `(listener, username, credentials)` triple.
#[async_trait]
pub trait Authenticator: Send + Sync + Debug {
    async fn authenticate(&self, listener_id: i64, username: &str, creds: &Credentials) -> Result<Principal, AuthenticationError>;
}

/// [`Authenticator`] backed by the embedded [`Store`].
#[derive(Debug, Clone)]
pub struct StoreAuthenticator {
    store: Store,
}

impl StoreAuthenticator {
    pub fn new(store: Store) -> StoreAuthenticator {
        StoreAuthenticator { store }
    }

    fn key_matches(stored: &str, presented: &str) -> bool {
        match (PublicKey::from_openssh(stored), PublicKey::from_openssh(presented)) {
            (Ok(a), Ok(b)) => a.key_data() == b.key_data(),
            _ => false,
        }
    }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
    async fn authenticate(&self, listener_id: i64, username: &str, creds: &Credentials) -> Result<Principal, AuthenticationError> {
        let verified = match creds {
            Credentials { password: Some(pw), .. } => self
                .store
                .verify_password(username, pw)
                .await
                .map_err(|_| AuthenticationError::Internal)?,
            Credentials {
                public_key: Some(key), ..
            } => {
                let user = self
                    .store
                    .user_by_username(username)
                    .await
                    .map_err(|_| AuthenticationError::Internal)?;
                match user.and_then(|u| u.public_key) {
                    Some(stored) if !stored.is_empty() => Self::key_matches(&stored, key),
                    _ => false,
                }
            }
            _ => false,
        };
        if !verified {
            return Err(AuthenticationError::Failed);
        }
        let user = self
            .store
            .user_by_username(username)
            .await
            .map_err(|_| AuthenticationError::Internal)?
            .ok_or(AuthenticationError::Failed)?;
        let subscribed = self
            .store
            .is_subscribed(user.id, listener_id)
            .await
            .map_err(|_| AuthenticationError::Internal)?;
        if !subscribed {
            return Err(AuthenticationError::NotSubscribed);
        }
        Ok(Principal {
            user_id: user.id,
            username: user.username,
        })
    }
}
