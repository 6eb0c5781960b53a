//! TLS for SSLRequest upgrades
//!
//! Certificates come from PEM files or are generated on startup.

use anyhow::Context;
use chrono::Datelike;
use pgbridge_common::config::TlsSettings;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// rustls server configuration shared by every TLS handshake
#[derive(Clone)]
pub struct TlsConfig {
    pub server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Load a PEM certificate chain and private key
    pub fn from_files(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        info!(cert = %cert_path.display(), key = %key_path.display(), "Loading TLS certificates");
        let certs = read_certificates(cert_path)?;
        let key = read_private_key(key_path)?;
        Self::with_identity(certs, key)
    }

    /// Generate a throwaway certificate for `common_name`, valid for a year
    pub fn self_signed(common_name: &str) -> anyhow::Result<Self> {
        info!("Generating self-signed TLS certificate for: {}", common_name);

        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, common_name);
        subject.push(DnType::OrganizationName, "pgbridge");

        let mut params = CertificateParams::default();
        params.distinguished_name = subject;
        params.subject_alt_names = vec![
            SanType::DnsName(common_name.try_into()?),
            SanType::DnsName("localhost".try_into()?),
        ];
        let today = chrono::Utc::now().date_naive();
        let (month, day) = (today.month() as u8, today.day().min(28) as u8);
        params.not_before = rcgen::date_time_ymd(today.year(), month, day);
        params.not_after = rcgen::date_time_ymd(today.year() + 1, month, day);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        let key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

        Self::with_identity(vec![cert.der().clone()], key)
    }

    fn with_identity(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> anyhow::Result<Self> {
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("TLS configuration error")?;
        Ok(Self {
            server_config: Arc::new(server_config),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

fn read_certificates(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open cert file {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid PEM in {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

/// Build the TLS configuration described by `settings`.
///
/// Certificate files win when both paths are set; otherwise a self-signed
/// certificate is generated if `auto_generate` is on. `None` means SSL
/// requests are declined.
pub fn load_tls_config(settings: &TlsSettings) -> anyhow::Result<Option<TlsConfig>> {
    if !settings.enabled {
        info!("TLS is disabled");
        return Ok(None);
    }

    if let (Some(cert), Some(key)) = (&settings.cert_path, &settings.key_path) {
        let config = TlsConfig::from_files(Path::new(cert), Path::new(key))?;
        info!("Loaded TLS configuration from certificate files");
        return Ok(Some(config));
    }

    if settings.auto_generate {
        return TlsConfig::self_signed(&settings.common_name).map(Some);
    }

    warn!("TLS is enabled but no certificate configured - SSL connections will be declined");
    Ok(None)
}
