//! Password authenticators
//!
//! Each authenticator implements `Authenticator` and is plugged into the
//! host-based rules for the `password` method.

mod passthrough;
mod static_password;

pub use passthrough::PassthroughProvider;
pub use static_password::StaticPasswordProvider;

use super::ConnectionProperties;
use async_trait::async_trait;
use pgbridge_common::Identity;

/// Credentials presented during a password exchange
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
    pub properties: ConnectionProperties,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            properties: ConnectionProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: ConnectionProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// Outcome of an authentication attempt
#[derive(Debug, Clone)]
pub enum AuthResult {
    Success(Identity),
    /// Wrong user or password
    InvalidCredentials(String),
    /// The authenticator itself failed
    ProviderError(String),
}

/// Checks a cleartext secret
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    async fn authenticate(&self, credentials: &Credentials) -> AuthResult;
}
