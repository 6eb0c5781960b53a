//! Static password provider
//!
//! Validates against users listed in the configuration. A password may be
//! stored in plain text or as a hex blake3 digest.

use super::{AuthResult, Authenticator, Credentials};
use async_trait::async_trait;
use parking_lot::RwLock;
use pgbridge_common::config::UserSettings;
use pgbridge_common::{Identity, IdentitySource};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum StoredPassword {
    Plain(String),
    Blake3(blake3::Hash),
}

impl StoredPassword {
    fn matches(&self, secret: &str) -> bool {
        match self {
            StoredPassword::Plain(password) => {
                // Compare digests so timing does not depend on the common prefix
                blake3::hash(password.as_bytes()) == blake3::hash(secret.as_bytes())
            }
            StoredPassword::Blake3(digest) => *digest == blake3::hash(secret.as_bytes()),
        }
    }
}

pub struct StaticPasswordProvider {
    users: RwLock<HashMap<String, StoredPassword>>,
}

impl StaticPasswordProvider {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Create from configured users; entries without a usable password are skipped
    pub fn from_settings(users: &[UserSettings]) -> Self {
        let provider = Self::new();
        for user in users {
            if let Some(digest) = user
                .password_blake3
                .as_deref()
                .and_then(|hex| blake3::Hash::from_hex(hex).ok())
            {
                provider
                    .users
                    .write()
                    .insert(user.name.clone(), StoredPassword::Blake3(digest));
            } else if let Some(password) = &user.password {
                provider.register_user(&user.name, password);
            } else {
                tracing::warn!(user = %user.name, "User has no valid password configured, skipping");
            }
        }
        provider
    }

    /// Register a user with a plaintext password
    pub fn register_user(&self, name: &str, password: &str) {
        self.users
            .write()
            .insert(name.to_string(), StoredPassword::Plain(password.to_string()));
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

impl Default for StaticPasswordProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for StaticPasswordProvider {
    fn name(&self) -> &str {
        "static_password"
    }

    async fn authenticate(&self, credentials: &Credentials) -> AuthResult {
        let stored = self.users.read().get(&credentials.username).cloned();
        match stored {
            Some(stored) if stored.matches(&credentials.secret) => {
                tracing::debug!(username = %credentials.username, "Static password authentication successful");
                AuthResult::Success(Identity::new(
                    &credentials.username,
                    IdentitySource::Password,
                    self.name(),
                ))
            }
            Some(_) => {
                tracing::warn!(username = %credentials.username, "Invalid password attempted");
                AuthResult::InvalidCredentials("invalid password".to_string())
            }
            None => {
                tracing::warn!(username = %credentials.username, "Unknown user attempted login");
                AuthResult::InvalidCredentials("unknown user".to_string())
            }
        }
    }
}
