//! PostgreSQL wire protocol configuration
//!
//! The protocol-facing subset of `ServerConfig`, shared by every connection.

use pgbridge_common::ServerConfig;
use tracing::info;

/// PostgreSQL wire protocol configuration
#[derive(Debug, Clone)]
pub struct PgWireConfig {
    /// Value announced in the server_version ParameterStatus
    pub server_version: String,
    /// Largest steady-state frame accepted by the decoder
    pub max_message_length: usize,
    /// Bounded worker pool size, shared by all sessions
    pub worker_threads: usize,
    /// Rows to buffer before flushing to client (backpressure control)
    pub result_flush_rows: usize,
    /// TCP keepalive time in seconds (detects dead connections)
    pub tcp_keepalive_secs: u64,
    /// Send BackendKeyData so clients can cancel queries
    pub send_backend_key_data: bool,
}

impl Default for PgWireConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for PgWireConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            server_version: config.server_version.clone(),
            max_message_length: config.max_message_length,
            worker_threads: config.worker_threads.max(1),
            result_flush_rows: config.result_flush_rows.max(1),
            tcp_keepalive_secs: config.tcp_keepalive_secs,
            send_backend_key_data: config.send_backend_key_data,
        }
    }
}

impl PgWireConfig {
    /// Log configuration on startup
    pub fn log_config(&self) {
        info!(
            "PgWireServer config: server_version={}, workers={}, flush_rows={}, max_message={}KB, cancel={}",
            self.server_version,
            self.worker_threads,
            self.result_flush_rows,
            self.max_message_length / 1024,
            self.send_backend_key_data
        );
    }
}
