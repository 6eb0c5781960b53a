//! Negotiated-token (GSSAPI) security contexts
//!
//! The token mechanics live outside this crate. A `SecurityContextFactory`
//! wired into the server produces one `SecurityContext` per connection; the
//! handshake feeds it client tokens until it reports an established context.

use pgbridge_common::Identity;

/// Server side of one GSSAPI exchange
pub trait SecurityContext: Send {
    /// Consume a client token, returning the token to send back, if any
    fn accept(&mut self, token: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    fn is_established(&self) -> bool;

    /// Identity of the authenticated peer; only valid once established
    fn identity(&self, user: &str) -> anyhow::Result<Identity>;
}

/// Creates security contexts for incoming connections
pub trait SecurityContextFactory: Send + Sync {
    fn create_context(&self) -> anyhow::Result<Box<dyn SecurityContext>>;
}
