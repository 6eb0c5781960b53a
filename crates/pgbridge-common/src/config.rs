//! Configuration for the pgbridge server
//!
//! Values come from an optional config file (TOML, YAML or JSON, picked by
//! extension) with `PGBRIDGE__*` environment variables layered on top.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "PGBRIDGE";

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener to
    pub listen_address: String,
    /// PostgreSQL wire protocol port
    pub port: u16,
    /// Reported through the server_version parameter status
    pub server_version: String,
    /// Largest steady-state frame accepted from a client, in bytes
    pub max_message_length: usize,
    /// Size of the worker pool shared by all sessions
    pub worker_threads: usize,
    /// DataRow messages buffered before a flush to the socket
    pub result_flush_rows: usize,
    /// TCP keepalive interval in seconds
    pub tcp_keepalive_secs: u64,
    /// Send BackendKeyData so clients can issue CancelRequests
    pub send_backend_key_data: bool,
    /// Authentication rules and users
    pub auth: AuthSettings,
    /// Kerberos/GSS key material
    pub gss: Option<GssSettings>,
    /// TLS configuration
    pub tls: TlsSettings,
    /// Logging configuration
    pub telemetry: TelemetrySettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".into(),
            port: 5433,
            server_version: "10.5".into(),
            max_message_length: 64 * 1024 * 1024,
            worker_threads: 32,
            result_flush_rows: 1000,
            tcp_keepalive_secs: 60,
            send_backend_key_data: false,
            auth: AuthSettings::default(),
            gss: None,
            tls: TlsSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Socket address string for the listener
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}

/// Authentication method named by a host-based rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethodKind {
    /// Cleartext password checked by the password authenticator
    Password,
    /// No credential exchange
    Trust,
    /// Negotiated GSSAPI token exchange
    Gss,
    /// Same exchange as `Gss`
    Kerberos,
}

/// Transport requirement of a host-based rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SslRequirement {
    #[default]
    Any,
    Required,
    Disabled,
}

/// One host-based authentication entry; unset fields match everything
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HbaRule {
    #[serde(default)]
    pub user: Option<String>,
    /// Exact IP address or CIDR block (`10.0.0.0/8`)
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub ssl: SslRequirement,
    pub method: AuthMethodKind,
}

/// A user known to the static password authenticator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub name: String,
    /// Plaintext password
    #[serde(default)]
    pub password: Option<String>,
    /// Hex-encoded blake3 digest of the password
    #[serde(default)]
    pub password_blake3: Option<String>,
}

/// Authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Ordered host-based rules; the first match wins
    pub rules: Vec<HbaRule>,
    /// Users for password authentication; empty means accept any password
    pub users: Vec<UserSettings>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            rules: vec![HbaRule {
                user: None,
                address: None,
                ssl: SslRequirement::Any,
                method: AuthMethodKind::Password,
            }],
            users: Vec::new(),
        }
    }
}

/// Kerberos/GSS key material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GssSettings {
    /// Path to the service keytab
    pub keytab_path: String,
    /// Service principal, e.g. `postgres/host.example.com@REALM`
    pub service_principal: String,
}

/// TLS configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Enable TLS
    pub enabled: bool,
    /// Path to certificate file
    pub cert_path: Option<String>,
    /// Path to private key file
    pub key_path: Option<String>,
    /// Generate self-signed certificate if not provided
    pub auto_generate: bool,
    /// Common name for the generated certificate
    pub common_name: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            auto_generate: true,
            common_name: "pgbridge.local".into(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Enable JSON log format
    pub json_logs: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_logs: false,
        }
    }
}
