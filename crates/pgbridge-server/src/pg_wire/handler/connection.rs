//! Connection handling for PostgreSQL wire protocol
//!
//! TLS negotiation, startup message processing, TCP keepalive configuration,
//! and connection lifecycle management. After TLS negotiation, all handling
//! is generic over the stream type.

use super::auth::authenticate;
use super::cancel::CancelFlag;
use super::core::ServerContext;
use super::delayed_writes::DelayableWriteChannel;
use super::query_loop::run_query_loop;
use super::session::Session;
use crate::auth::ConnectionProperties;
use crate::errors::SEVERITY_FATAL;
use crate::metrics;
use crate::pg_wire::decoder::{ConnectionFrame, PgDecoder};
use crate::pg_wire::protocol::constants::{PROTOCOL_VERSION_3, SSL_ACCEPTED, SSL_DECLINED, TRANSACTION_STATUS_IDLE};
use crate::pg_wire::protocol::messages::{BackendMessage, ErrorFields, StartupMessage};
use crate::pg_wire::query::server_parameters;
use bytes::BytesMut;
use futures::StreamExt;
use pgbridge_common::PgWireError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, FramedRead};
use tracing::{debug, info, warn, Instrument};

/// Configure TCP keepalive on a socket for faster dead connection detection
pub(crate) fn configure_tcp_keepalive(stream: &tokio::net::TcpStream, keepalive_secs: u64) {
    use socket2::SockRef;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    if keepalive_secs == 0 {
        return;
    }

    let socket = SockRef::from(stream);

    if let Err(e) = socket.set_keepalive(true) {
        warn!("Failed to enable TCP keepalive: {}", e);
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to configure TCP keepalive timing: {}", e);
    } else {
        debug!("TCP keepalive configured: {}s", keepalive_secs);
    }
}

/// Write one message straight to the socket (pre-session phase only)
pub(crate) async fn send_message<S>(framed: &mut Framed<S, PgDecoder>, message: &BackendMessage) -> Result<(), PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let socket = framed.get_mut();
    socket.write_all(&message.to_bytes()).await?;
    socket.flush().await?;
    Ok(())
}

async fn send_byte<S>(framed: &mut Framed<S, PgDecoder>, byte: u8) -> Result<(), PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let socket = framed.get_mut();
    socket.write_all(&[byte]).await?;
    socket.flush().await?;
    Ok(())
}

/// Serve one client connection until it terminates.
///
/// Handles, in order:
/// 1. SSLRequest / GSSENCRequest / CancelRequest negotiation
/// 2. TLS upgrade if requested and configured
/// 3. Startup checks and authentication
/// 4. The steady-state message loop
pub async fn serve_connection<S>(stream: S, peer: Option<SocketAddr>, context: Arc<ServerContext>) -> Result<(), PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _connection = metrics::connection_opened();
    let peer_label = peer.map(|p| p.to_string()).unwrap_or_else(|| "local".to_string());
    let span = tracing::info_span!("connection", peer = %peer_label, user = tracing::field::Empty);
    serve(stream, peer, context).instrument(span).await
}

/// First packets before the startup message
enum Negotiated {
    Startup(StartupMessage),
    UpgradeToTls,
    Closed,
}

async fn negotiate<S>(
    framed: &mut Framed<S, PgDecoder>,
    context: &ServerContext,
    tls_available: bool,
) -> Result<Negotiated, PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match framed.next().await {
            Some(frame) => frame?,
            None => return Ok(Negotiated::Closed),
        };
        match frame {
            ConnectionFrame::GssEncRequest => {
                debug!("Declining GSSENCRequest");
                send_byte(framed, SSL_DECLINED).await?;
            }
            ConnectionFrame::SslRequest if tls_available => {
                debug!("Accepting SSLRequest");
                send_byte(framed, SSL_ACCEPTED).await?;
                return Ok(Negotiated::UpgradeToTls);
            }
            ConnectionFrame::SslRequest => {
                debug!("Declining SSLRequest, TLS not configured");
                send_byte(framed, SSL_DECLINED).await?;
            }
            ConnectionFrame::CancelRequest {
                process_id,
                secret_key,
            } => {
                let matched = context.cancel_registry.cancel(process_id, secret_key);
                debug!(process_id, matched, "Processed CancelRequest");
                return Ok(Negotiated::Closed);
            }
            ConnectionFrame::Startup(startup) => return Ok(Negotiated::Startup(startup)),
            ConnectionFrame::Message { tag, .. } => {
                return Err(PgWireError::framing(format!(
                    "unexpected message '{}' before startup",
                    char::from(tag)
                )))
            }
        }
    }
}

async fn serve<S>(stream: S, peer: Option<SocketAddr>, context: Arc<ServerContext>) -> Result<(), PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, PgDecoder::new(context.config.max_message_length));
    let properties = ConnectionProperties {
        address: peer.map(|p| p.ip()),
        ..Default::default()
    };

    match negotiate(&mut framed, &context, context.tls.is_some()).await {
        Ok(Negotiated::Closed) => Ok(()),
        Ok(Negotiated::Startup(startup)) => start_session(framed, startup, properties, context).await,
        Ok(Negotiated::UpgradeToTls) => {
            let acceptor = context
                .tls
                .clone()
                .ok_or_else(|| PgWireError::Configuration("TLS acceptor missing".into()))?;
            let parts = framed.into_parts();
            if !parts.read_buf.is_empty() {
                return Err(PgWireError::framing("received unencrypted data after SSL request"));
            }
            let tls_stream = acceptor.accept(parts.io).await?;
            debug!("TLS handshake completed");

            let mut framed = Framed::new(tls_stream, parts.codec);
            let properties = ConnectionProperties { ssl: true, ..properties };
            match negotiate(&mut framed, &context, false).await {
                Ok(Negotiated::Startup(startup)) => start_session(framed, startup, properties, context).await,
                Ok(_) => Ok(()),
                Err(e) => fail(&mut framed, e).await,
            }
        }
        Err(e) => fail(&mut framed, e).await,
    }
}

/// Report a pre-session error as FATAL and give up on the connection
async fn fail<S>(framed: &mut Framed<S, PgDecoder>, err: PgWireError) -> Result<(), PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(error = %err, kind = err.code(), "Connection rejected");
    if !matches!(err, PgWireError::Io(_)) {
        let mut fields = ErrorFields::from_error(&err);
        fields.severity = SEVERITY_FATAL.to_string();
        // Best effort; the connection is closed either way
        let _ = send_message(framed, &BackendMessage::ErrorResponse(fields)).await;
    }
    Err(err)
}

fn check_startup(startup: &StartupMessage) -> Result<String, PgWireError> {
    if startup.protocol_version >> 16 != PROTOCOL_VERSION_3 >> 16 {
        return Err(PgWireError::AuthenticationFailure {
            message: format!(
                "unsupported frontend protocol {}.{}: server supports 3.0",
                startup.protocol_version >> 16,
                startup.protocol_version & 0xffff
            ),
            sqlstate: crate::errors::sqlstate::PROTOCOL_VIOLATION,
        });
    }
    match startup.parameter("user") {
        Some(user) if !user.is_empty() => Ok(user.to_string()),
        _ => Err(PgWireError::authentication(
            "no PostgreSQL user name specified in startup packet",
        )),
    }
}

async fn start_session<S>(
    mut framed: Framed<S, PgDecoder>,
    startup: StartupMessage,
    mut properties: ConnectionProperties,
    context: Arc<ServerContext>,
) -> Result<(), PgWireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let user = match check_startup(&startup) {
        Ok(user) => user,
        Err(e) => return fail(&mut framed, e).await,
    };
    properties.database = startup.parameter("database").map(str::to_string);
    properties.application_name = startup.parameter("application_name").map(str::to_string);
    tracing::Span::current().record("user", user.as_str());
    debug!(
        database = properties.database.as_deref().unwrap_or(""),
        application_name = properties.application_name.as_deref().unwrap_or(""),
        ssl = properties.ssl,
        "Startup received"
    );

    let identity = match authenticate(
        &mut framed,
        &user,
        &properties,
        context.auth.as_ref(),
        context.security.as_ref(),
    )
    .await
    {
        Ok(identity) => identity,
        Err(e) => return fail(&mut framed, e).await,
    };

    let cancel = CancelFlag::new();
    let registration = context
        .config
        .send_backend_key_data
        .then(|| context.cancel_registry.register(cancel.clone()));

    let mut greeting = BytesMut::new();
    BackendMessage::AuthenticationOk.encode(&mut greeting);
    for (name, value) in server_parameters(&context.config.server_version) {
        BackendMessage::ParameterStatus {
            name: name.to_string(),
            value,
        }
        .encode(&mut greeting);
    }
    if let Some(registration) = &registration {
        let key = registration.key();
        BackendMessage::BackendKeyData {
            process_id: key.process_id,
            secret_key: key.secret_key,
        }
        .encode(&mut greeting);
    }
    BackendMessage::ReadyForQuery(TRANSACTION_STATUS_IDLE).encode(&mut greeting);
    framed.get_mut().write_all(&greeting).await?;
    framed.get_mut().flush().await?;
    info!(user = %identity.user, ssl = properties.ssl, "Session started");

    // Hand the write half to the ordered writer and keep reading with the same decoder
    let parts = framed.into_parts();
    let (read_half, write_half) = tokio::io::split(parts.io);
    let mut reader = FramedRead::new(read_half, parts.codec);
    *reader.read_buffer_mut() = parts.read_buf;
    let (channel, writer) = DelayableWriteChannel::spawn(write_half);

    let session = Session::new(context.resources.clone(), channel, cancel, identity)
        .with_startup(properties.database, properties.application_name);
    let result = run_query_loop(&mut reader, session).await;
    drop(registration);

    // The session (and every channel clone) is gone once the loop returns
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Writer finished with error: {}", e),
        Err(e) => warn!("Writer task failed: {}", e),
    }
    info!("Connection closed");
    result
}
