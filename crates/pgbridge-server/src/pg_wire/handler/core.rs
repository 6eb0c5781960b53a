//! PgWireServer - PostgreSQL wire protocol server
//!
//! Shared server context plus the accept loop.

use super::cancel::CancelRegistry;
use crate::pg_wire::config::PgWireConfig;
use super::connection::{configure_tcp_keepalive, serve_connection};
use super::dispatcher::ExecutionDispatcher;
use super::session::ExecutionResources;
use super::worker_pool::WorkerPool;
use crate::auth::{AuthenticationProvider, SecurityContextFactory};
use crate::backend::SessionHandler;
use crate::tls_config::TlsConfig;
use pgbridge_common::PgWireError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Everything a connection needs, shared by all connections
pub struct ServerContext {
    pub config: PgWireConfig,
    pub resources: ExecutionResources,
    pub auth: Arc<dyn AuthenticationProvider>,
    pub tls: Option<TlsAcceptor>,
    pub security: Option<Arc<dyn SecurityContextFactory>>,
    pub cancel_registry: Arc<CancelRegistry>,
}

impl ServerContext {
    pub fn new(
        config: PgWireConfig,
        data: Arc<dyn SessionHandler>,
        metadata: Arc<dyn SessionHandler>,
        auth: Arc<dyn AuthenticationProvider>,
    ) -> Self {
        let dispatcher = ExecutionDispatcher::new(data, metadata, config.server_version.clone());
        let resources = ExecutionResources {
            dispatcher: Arc::new(dispatcher),
            pool: Arc::new(WorkerPool::new(config.worker_threads)),
            result_flush_rows: config.result_flush_rows,
        };
        Self {
            config,
            resources,
            auth,
            tls: None,
            security: None,
            cancel_registry: CancelRegistry::new(),
        }
    }

    pub fn with_tls(mut self, tls_config: Option<TlsConfig>) -> Self {
        self.tls = tls_config.map(|tls| tls.acceptor());
        self
    }

    pub fn with_security_context_factory(mut self, factory: Arc<dyn SecurityContextFactory>) -> Self {
        self.security = Some(factory);
        self
    }
}

/// PostgreSQL wire protocol server
pub struct PgWireServer {
    addr: SocketAddr,
    context: Arc<ServerContext>,
}

impl PgWireServer {
    pub fn new(addr: SocketAddr, context: ServerContext) -> Self {
        Self {
            addr,
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Bind the listener and serve connections until the task is dropped
    pub async fn start(&self) -> Result<(), PgWireError> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), PgWireError> {
        let tls_status = if self.context.tls.is_some() {
            "TLS enabled (SSL + non-SSL)"
        } else {
            "TLS disabled (non-SSL only)"
        };
        info!(
            workers = self.context.resources.pool.size(),
            "Starting PostgreSQL wire protocol server on {} ({})",
            listener.local_addr()?,
            tls_status
        );
        self.context.config.log_config();

        loop {
            let (socket, peer_addr) = listener.accept().await?;
            debug!("New PostgreSQL connection from {}", peer_addr);

            configure_tcp_keepalive(&socket, self.context.config.tcp_keepalive_secs);

            let context = self.context.clone();
            tokio::spawn(async move {
                match serve_connection(socket, Some(peer_addr), context).await {
                    Ok(()) => {}
                    Err(PgWireError::Io(e)) => debug!("Client disconnected: {}", e),
                    Err(e) if e.is_fatal() => debug!("Connection from {} closed: {}", peer_addr, e),
                    Err(e) => error!("Error handling PostgreSQL connection from {}: {}", peer_addr, e),
                }
            });
        }
    }
}
