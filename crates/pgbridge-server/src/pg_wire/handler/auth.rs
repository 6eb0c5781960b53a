//! Authentication flow
//!
//! Runs between the startup packet and AuthenticationOk. The method is
//! resolved once per connection; each method owns its exchange and returns
//! a verified identity or an authentication failure. Nothing here writes
//! AuthenticationOk or the error response, the connection does.

use super::connection::send_message;
use crate::auth::{
    AuthResult, AuthenticationMethod, AuthenticationProvider, Authenticator, ConnectionProperties, Credentials,
    SecurityContextFactory,
};
use crate::errors::sqlstate;
use crate::pg_wire::decoder::{ConnectionFrame, PgDecoder};
use crate::pg_wire::protocol::constants::frontend;
use crate::pg_wire::protocol::messages::{decode_password, BackendMessage};
use bytes::Bytes;
use futures::StreamExt;
use pgbridge_common::{Identity, PgWireError};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Resolve the method for `user` and run its exchange
pub(crate) async fn authenticate<S>(
    framed: &mut Framed<S, PgDecoder>,
    user: &str,
    properties: &ConnectionProperties,
    provider: &dyn AuthenticationProvider,
    security: Option<&Arc<dyn SecurityContextFactory>>,
) -> Result<Identity, PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = provider
        .resolve_authentication_type(user, properties)
        .ok_or_else(|| {
            PgWireError::authentication(format!(
                "No valid auth.host_based entry found for host \"{}\", user \"{}\". Did you enable TLS in your client?",
                properties.host(),
                user
            ))
        })?;
    debug!(user = %user, ?method, "Resolved authentication method");

    let identity = match method {
        AuthenticationMethod::Password(authenticator) => {
            password_exchange(framed, user, properties, authenticator.as_ref()).await?
        }
        AuthenticationMethod::NoPassword => Identity::trusted(user),
        AuthenticationMethod::NegotiatedToken => negotiate_token(framed, user, security).await?,
    };
    info!(
        user = %identity.user,
        principal = %identity.principal,
        source = %identity.source,
        "Authentication successful"
    );
    Ok(identity)
}

async fn password_exchange<S>(
    framed: &mut Framed<S, PgDecoder>,
    user: &str,
    properties: &ConnectionProperties,
    authenticator: &dyn Authenticator,
) -> Result<Identity, PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_message(framed, &BackendMessage::AuthenticationCleartextPassword).await?;
    let payload = read_password_frame(framed).await?;
    let password = decode_password(&payload)?;

    let credentials = Credentials::new(user, password).with_properties(properties.clone());
    match authenticator.authenticate(&credentials).await {
        AuthResult::Success(identity) => Ok(identity),
        AuthResult::InvalidCredentials(reason) => {
            warn!(user = %user, provider = authenticator.name(), "Authentication failed: {}", reason);
            Err(PgWireError::invalid_password(user))
        }
        AuthResult::ProviderError(msg) => {
            error!(user = %user, provider = authenticator.name(), "Auth provider error: {}", msg);
            Err(PgWireError::AuthenticationFailure {
                message: "authentication service error".to_string(),
                sqlstate: sqlstate::INTERNAL_ERROR,
            })
        }
    }
}

async fn negotiate_token<S>(
    framed: &mut Framed<S, PgDecoder>,
    user: &str,
    security: Option<&Arc<dyn SecurityContextFactory>>,
) -> Result<Identity, PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let factory = security.ok_or_else(|| PgWireError::authentication("GSS Auth not configured in this server"))?;
    let mut context = factory
        .create_context()
        .map_err(|e| PgWireError::authentication(format!("could not create GSS security context: {}", e)))?;

    send_message(framed, &BackendMessage::AuthenticationGss).await?;
    let mut rounds = 0usize;
    while !context.is_established() {
        let token = read_password_frame(framed).await?;
        if token.is_empty() {
            return Err(PgWireError::authentication("GSS Token cannot be empty"));
        }
        rounds += 1;
        let reply = context.accept(&token).map_err(|e| {
            PgWireError::authentication(format!("GSS authentication failed for user \"{}\": {}", user, e))
        })?;
        if let Some(reply) = reply.filter(|r| !r.is_empty()) {
            send_message(framed, &BackendMessage::AuthenticationGssContinue(Bytes::from(reply))).await?;
        }
    }
    debug!(user = %user, rounds, "GSS context established");

    context
        .identity(user)
        .map_err(|e| PgWireError::authentication(format!("GSS authentication failed for user \"{}\": {}", user, e)))
}

/// Next password-channel frame; anything else is a protocol error
async fn read_password_frame<S>(framed: &mut Framed<S, PgDecoder>) -> Result<Bytes, PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(ConnectionFrame::Message {
            tag: frontend::PASSWORD,
            payload,
        })) => Ok(payload),
        Some(Ok(ConnectionFrame::Message { tag, .. })) => Err(PgWireError::violation(format!(
            "expected password response, got message type {}",
            char::from(tag)
        ))),
        Some(Ok(other)) => Err(PgWireError::framing(format!(
            "unexpected {:?} during authentication",
            other
        ))),
        Some(Err(e)) => Err(e),
        None => Err(PgWireError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed during authentication",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{PassthroughProvider, SecurityContext, StaticPasswordProvider};
    use crate::pg_wire::protocol::messages::{FrontendMessage, StartupMessage};
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Fixed(Option<AuthenticationMethod>);

    impl AuthenticationProvider for Fixed {
        fn resolve_authentication_type(&self, _: &str, _: &ConnectionProperties) -> Option<AuthenticationMethod> {
            self.0.clone()
        }
    }

    /// Established after two tokens, echoing each one back reversed
    struct TwoRounds {
        seen: usize,
    }

    impl SecurityContext for TwoRounds {
        fn accept(&mut self, token: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            self.seen += 1;
            Ok(Some(token.iter().rev().copied().collect()))
        }

        fn is_established(&self) -> bool {
            self.seen >= 2
        }

        fn identity(&self, user: &str) -> anyhow::Result<Identity> {
            Ok(Identity::new(user, pgbridge_common::IdentitySource::Negotiated, "gss")
                .with_principal(format!("{}@EXAMPLE.COM", user)))
        }
    }

    struct TwoRoundsFactory;

    impl SecurityContextFactory for TwoRoundsFactory {
        fn create_context(&self) -> anyhow::Result<Box<dyn SecurityContext>> {
            Ok(Box::new(TwoRounds { seen: 0 }))
        }
    }

    /// Server-side framed stream already past the startup packet
    async fn connected() -> (Framed<DuplexStream, PgDecoder>, DuplexStream) {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut buf = BytesMut::new();
        StartupMessage::new(&[("user", "alice")]).encode(&mut buf);
        client.write_all(&buf).await.unwrap();
        let mut framed = Framed::new(server, PgDecoder::new(1024));
        assert!(matches!(framed.next().await, Some(Ok(ConnectionFrame::Startup(_)))));
        (framed, client)
    }

    async fn send(client: &mut DuplexStream, message: FrontendMessage) {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        client.write_all(&buf).await.unwrap();
    }

    async fn receive(client: &mut DuplexStream) -> BackendMessage {
        let mut buf = BytesMut::new();
        loop {
            if let Some(msg) = BackendMessage::decode(&mut buf).unwrap() {
                return msg;
            }
            let mut chunk = [0u8; 128];
            let n = client.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_password_exchange() {
        let (mut framed, mut client) = connected().await;
        let users = StaticPasswordProvider::new();
        users.register_user("alice", "secret");
        let provider = Fixed(Some(AuthenticationMethod::Password(Arc::new(users))));

        send(&mut client, FrontendMessage::password("secret")).await;
        let identity = authenticate(&mut framed, "alice", &Default::default(), &provider, None)
            .await
            .unwrap();
        assert_eq!(identity.user, "alice");
        assert_eq!(receive(&mut client).await, BackendMessage::AuthenticationCleartextPassword);
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let (mut framed, mut client) = connected().await;
        let users = StaticPasswordProvider::new();
        users.register_user("alice", "secret");
        let provider = Fixed(Some(AuthenticationMethod::Password(Arc::new(users))));

        send(&mut client, FrontendMessage::password("nope")).await;
        match authenticate(&mut framed, "alice", &Default::default(), &provider, None).await {
            Err(PgWireError::AuthenticationFailure { sqlstate, .. }) => assert_eq!(sqlstate, "28P01"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_password_frame_is_rejected() {
        let (mut framed, mut client) = connected().await;
        let provider = Fixed(Some(AuthenticationMethod::Password(Arc::new(PassthroughProvider::new()))));
        send(&mut client, FrontendMessage::Sync).await;
        let err = authenticate(&mut framed, "alice", &Default::default(), &provider, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PgWireError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_no_matching_rule() {
        let (mut framed, _client) = connected().await;
        let properties = ConnectionProperties {
            address: Some("10.0.0.7".parse().unwrap()),
            ..Default::default()
        };
        let err = authenticate(&mut framed, "alice", &properties, &Fixed(None), None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "No valid auth.host_based entry found for host \"10.0.0.7\", user \"alice\". Did you enable TLS in your client?"
        );
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_trust_needs_no_exchange() {
        let (mut framed, _client) = connected().await;
        let identity = authenticate(
            &mut framed,
            "alice",
            &Default::default(),
            &Fixed(Some(AuthenticationMethod::NoPassword)),
            None,
        )
        .await
        .unwrap();
        assert_eq!(identity.provider, "trust");
    }

    #[tokio::test]
    async fn test_gss_exchange() {
        let (mut framed, mut client) = connected().await;
        let factory: Arc<dyn SecurityContextFactory> = Arc::new(TwoRoundsFactory);
        let provider = Fixed(Some(AuthenticationMethod::NegotiatedToken));

        send(&mut client, FrontendMessage::Password(Bytes::from_static(b"ab"))).await;
        send(&mut client, FrontendMessage::Password(Bytes::from_static(b"cd"))).await;
        let identity = authenticate(&mut framed, "alice", &Default::default(), &provider, Some(&factory))
            .await
            .unwrap();
        assert_eq!(identity.principal, "alice@EXAMPLE.COM");

        assert_eq!(receive(&mut client).await, BackendMessage::AuthenticationGss);
    }

    #[tokio::test]
    async fn test_gss_rejects_empty_token() {
        let (mut framed, mut client) = connected().await;
        let factory: Arc<dyn SecurityContextFactory> = Arc::new(TwoRoundsFactory);
        let provider = Fixed(Some(AuthenticationMethod::NegotiatedToken));

        send(&mut client, FrontendMessage::Password(Bytes::new())).await;
        let err = authenticate(&mut framed, "alice", &Default::default(), &provider, Some(&factory))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "GSS Token cannot be empty");
    }

    #[tokio::test]
    async fn test_gss_not_configured() {
        let (mut framed, _client) = connected().await;
        let provider = Fixed(Some(AuthenticationMethod::NegotiatedToken));
        let err = authenticate(&mut framed, "alice", &Default::default(), &provider, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "GSS Auth not configured in this server");
    }
}
