//! Passthrough (no-check) password provider
//!
//! Accepts any password. For development or networks where the real check
//! happens elsewhere.

use super::{AuthResult, Authenticator, Credentials};
use async_trait::async_trait;
use pgbridge_common::{Identity, IdentitySource};
use tracing::warn;

#[derive(Debug, Default)]
pub struct PassthroughProvider;

impl PassthroughProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Authenticator for PassthroughProvider {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn authenticate(&self, credentials: &Credentials) -> AuthResult {
        warn!(
            username = %credentials.username,
            "Passthrough auth: accepting password without validation"
        );
        let mut identity = Identity::new(&credentials.username, IdentitySource::Password, self.name());
        if let Some(app) = &credentials.properties.application_name {
            identity = identity.with_attribute("application_name", serde_json::json!(app));
        }
        AuthResult::Success(identity)
    }
}
