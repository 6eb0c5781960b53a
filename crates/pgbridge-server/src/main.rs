//! pgbridge server
//!
//! Serves the PostgreSQL wire protocol with the built-in backends: constant
//! queries and session commands are answered directly, everything else is
//! rejected until a real engine is wired in through the library.

use clap::Parser;
use pgbridge_common::ServerConfig;
use pgbridge_server::auth::HostBasedAuthentication;
use pgbridge_server::backend::{ConstantSessionHandler, UnavailableSessionHandler};
use pgbridge_server::tls_config::load_tls_config;
use pgbridge_server::{telemetry, PgWireConfig, PgWireServer, ServerContext};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pgbridge-server")]
#[command(about = "PostgreSQL wire protocol server")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(env = "PGBRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = ServerConfig::load(args.config.as_deref())?;
    telemetry::init_from_settings(&config.telemetry)?;

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!(config = ?args.config, "Starting pgbridge server");

    let addr: SocketAddr = config.bind_address().parse()?;
    let auth = HostBasedAuthentication::from_settings(&config.auth)?;
    if let Some(gss) = &config.gss {
        warn!(
            principal = %gss.service_principal,
            keytab = %gss.keytab_path,
            "GSS settings present but no security context factory is linked; gss rules will be rejected"
        );
    }

    let context = ServerContext::new(
        PgWireConfig::from(&config),
        Arc::new(UnavailableSessionHandler),
        Arc::new(ConstantSessionHandler),
        Arc::new(auth),
    )
    .with_tls(load_tls_config(&config.tls)?);
    let server = PgWireServer::new(addr, context);

    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }
    Ok(())
}
