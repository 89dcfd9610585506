//! Access Gate
//!
//! Credential checks for CONNECT. The gate wraps at most one
//! [`Authenticator`]; without one, every client is accepted. Each check
//! runs on its own task under a timeout, so a slow or panicking
//! authenticator cannot stall the handshake.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use tracing::warn;

use crate::config::AuthConfig;


/// Authentication error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The authenticator failed or panicked
    Internal(String),
    /// The authenticator did not answer in time
    Timeout,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AuthError::Timeout => write!(f, "Authentication timed out"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Authentication result type
pub type AuthResult<T> = Result<T, AuthError>;

/// Credential predicate
///
/// # Returns
/// * `Ok(true)` - Credentials accepted
/// * `Ok(false)` - Credentials rejected (CONNACK bad username or password)
/// * `Err(_)` - Internal error occurred (CONNACK server unavailable)
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>)
        -> AuthResult<bool>;
}

#[async_trait]
impl<T: Authenticator + ?Sized> Authenticator for Arc<T> {
    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthResult<bool> {
        (**self).authenticate(username, password).await
    }
}

/// Adapts a plain closure into an [`Authenticator`]
pub struct FnAuthenticator<F>(pub F);

#[async_trait]
impl<F> Authenticator for FnAuthenticator<F>
where
    F: Fn(Option<&str>, Option<&[u8]>) -> bool + Send + Sync,
{
    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthResult<bool> {
        Ok((self.0)(username, password))
    }
}

enum Credential {
    Plain(String),
    Hash(String),
}

/// Static user list from `[auth]`
pub struct CredentialAuthenticator {
    allow_anonymous: bool,
    users: HashMap<String, Credential>,
}

impl CredentialAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = HashMap::new();
        for user in &config.users {
            let credential = match (&user.password_hash, &user.password) {
                (Some(hash), _) => Credential::Hash(hash.clone()),
                (None, Some(password)) => Credential::Plain(password.clone()),
                (None, None) => {
                    warn!(username = %user.username, "User has no credential, skipping");
                    continue;
                }
            };
            users.insert(user.username.clone(), credential);
        }

        Self {
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

fn verify_hash(password: Vec<u8>, hash: String) -> AuthResult<bool> {
    let parsed = PasswordHash::new(&hash)
        .map_err(|e| AuthError::Internal(format!("invalid password hash: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(&password, &parsed)
        .is_ok())
}

#[async_trait]
impl Authenticator for CredentialAuthenticator {
    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthResult<bool> {
        let Some(username) = username else {
            return Ok(self.allow_anonymous);
        };
        let password = password.unwrap_or(&[]);

        match self.users.get(username) {
            None => Ok(false),
            Some(Credential::Plain(stored)) => Ok(stored.as_bytes() == password),
            Some(Credential::Hash(hash)) => {
                // CPU-bound hash verification
                let password = password.to_vec();
                let hash = hash.clone();
                tokio::task::spawn_blocking(move || verify_hash(password, hash))
                    .await
                    .map_err(|e| AuthError::Internal(e.to_string()))?
            }
        }
    }
}

/// The broker's single credential check point
#[derive(Clone)]
pub struct AccessGate {
    authenticator: Option<Arc<dyn Authenticator>>,
    timeout: Duration,
}

impl AccessGate {
    /// A gate that accepts every client
    pub fn open() -> Self {
        Self {
            authenticator: None,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn new(authenticator: Arc<dyn Authenticator>, timeout: Duration) -> Self {
        Self {
            authenticator: Some(authenticator),
            timeout,
        }
    }

    /// Static user list when `auth.enabled`, otherwise an open gate
    pub fn from_config(config: &AuthConfig) -> Self {
        if config.enabled {
            Self::new(Arc::new(CredentialAuthenticator::new(config)), config.timeout)
        } else {
            Self {
                timeout: config.timeout,
                ..Self::open()
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.authenticator.is_none()
    }

    /// Check credentials. Safe to call concurrently.
    pub async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthResult<bool> {
        let Some(ref authenticator) = self.authenticator else {
            return Ok(true);
        };

        let authenticator = authenticator.clone();
        let username = username.map(str::to_owned);
        let password = password.map(<[u8]>::to_vec);
        let check = tokio::spawn(async move {
            authenticator
                .authenticate(username.as_deref(), password.as_deref())
                .await
        });

        match tokio::time::timeout(self.timeout, check).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AuthError::Internal(join_error.to_string())),
            Err(_) => Err(AuthError::Timeout),
        }
    }
}

impl Default for AccessGate {
    fn default() -> Self {
        Self::open()
    }
}
