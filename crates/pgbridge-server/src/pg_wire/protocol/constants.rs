//! PostgreSQL wire protocol constants
//!
//! Message tags, special startup codes and transaction status bytes.

/// Protocol version 3.0 as sent in the startup packet
pub const PROTOCOL_VERSION_3: i32 = 196608;

/// Untagged startup-phase request codes
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const GSSENC_REQUEST_CODE: i32 = 80877104;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Largest startup packet accepted before authentication
pub const MAX_STARTUP_PACKET_LENGTH: usize = 10000;

/// Transaction status reported by every ReadyForQuery
pub const TRANSACTION_STATUS_IDLE: u8 = b'I';

/// Authentication request codes carried by the 'R' message
pub const AUTH_OK: i32 = 0;
pub const AUTH_CLEARTEXT_PASSWORD: i32 = 3;
pub const AUTH_GSS: i32 = 7;
pub const AUTH_GSS_CONTINUE: i32 = 8;

/// Frontend message tags
pub mod frontend {
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const CLOSE: u8 = b'C';
    pub const SYNC: u8 = b'S';
    pub const FLUSH: u8 = b'H';
    pub const TERMINATE: u8 = b'X';
    pub const PASSWORD: u8 = b'p';
}

/// Backend message tags
pub mod backend {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const NO_DATA: u8 = b'n';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const PORTAL_SUSPENDED: u8 = b's';
}

/// Single-byte answers to SSLRequest / GSSENCRequest
pub const SSL_ACCEPTED: u8 = b'S';
pub const SSL_DECLINED: u8 = b'N';
