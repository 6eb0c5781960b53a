//! Verified identity produced by the authentication flow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the identity was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Cleartext password checked by an authenticator
    Password,
    /// Trusted without a credential exchange
    Trust,
    /// Negotiated GSSAPI/Kerberos security context
    Negotiated,
}

impl std::fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentitySource::Password => write!(f, "password"),
            IdentitySource::Trust => write!(f, "trust"),
            IdentitySource::Negotiated => write!(f, "negotiated"),
        }
    }
}

/// An authenticated user bound to a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// User name presented in the startup packet
    pub user: String,
    /// Principal established by the authenticator (Kerberos principal, etc.)
    pub principal: String,
    pub source: IdentitySource,
    /// Authenticator that validated this identity
    pub provider: String,
    pub authenticated_at: DateTime<Utc>,
    /// Provider-specific attributes
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Identity {
    pub fn new(user: impl Into<String>, source: IdentitySource, provider: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            principal: user.clone(),
            user,
            source,
            provider: provider.into(),
            authenticated_at: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    /// Identity for a trusted connection
    pub fn trusted(user: impl Into<String>) -> Self {
        Self::new(user, IdentitySource::Trust, "trust")
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}
