//! Authentication collaborators
//!
//! The wire protocol asks an `AuthenticationProvider` which method applies to
//! a connecting user, then runs that method's exchange. Credential checks are
//! delegated to an `Authenticator` (password) or a `SecurityContextFactory`
//! (negotiated tokens such as Kerberos/GSS).
//!
//! # Usage
//!
//! ```ignore
//! let provider = HostBasedAuthentication::from_settings(&config.auth);
//! match provider.resolve_authentication_type("alice", &properties) {
//!     Some(AuthenticationMethod::Password(authenticator)) => { /* cleartext exchange */ }
//!     Some(AuthenticationMethod::NoPassword) => { /* trusted */ }
//!     Some(AuthenticationMethod::NegotiatedToken) => { /* GSS exchange */ }
//!     None => { /* FATAL: no matching rule */ }
//! }
//! ```

pub mod hba;
pub mod negotiation;
pub mod providers;

pub use hba::{AddressMatcher, HostBasedAuthentication};
pub use negotiation::{SecurityContext, SecurityContextFactory};
pub use providers::{AuthResult, Authenticator, Credentials, PassthroughProvider, StaticPasswordProvider};

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// What the server knows about a connection before it authenticates
#[derive(Debug, Clone, Default)]
pub struct ConnectionProperties {
    /// Peer address; `None` for in-process streams
    pub address: Option<IpAddr>,
    /// True once the stream was upgraded to TLS
    pub ssl: bool,
    pub application_name: Option<String>,
    pub database: Option<String>,
}

impl ConnectionProperties {
    /// Address rendered for error messages
    pub fn host(&self) -> String {
        self.address
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "local".to_string())
    }
}

/// Authentication exchange selected for a connection
#[derive(Clone)]
pub enum AuthenticationMethod {
    /// Cleartext password checked by the authenticator
    Password(Arc<dyn Authenticator>),
    /// Trusted; the user name is taken as-is
    NoPassword,
    /// GSSAPI token exchange (Kerberos uses the same flow)
    NegotiatedToken,
}

impl fmt::Debug for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthenticationMethod::Password(authenticator) => {
                write!(f, "Password({})", authenticator.name())
            }
            AuthenticationMethod::NoPassword => write!(f, "NoPassword"),
            AuthenticationMethod::NegotiatedToken => write!(f, "NegotiatedToken"),
        }
    }
}

/// Picks the authentication method for a user and connection
pub trait AuthenticationProvider: Send + Sync {
    /// `None` rejects the connection outright
    fn resolve_authentication_type(
        &self,
        user: &str,
        properties: &ConnectionProperties,
    ) -> Option<AuthenticationMethod>;
}
