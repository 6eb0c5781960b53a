//! PostgreSQL wire protocol messages
//!
//! Every tagged message is framed as tag byte + big-endian i32 length +
//! payload. Encoders write a placeholder length, the payload, then backpatch
//! the real length (which counts itself but not the tag).

use super::constants::{backend, frontend, *};
use super::types::{FormatCode, Value};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pgbridge_common::PgWireError;

/// Write one tagged frame, backpatching the length after `body` runs
pub fn frame<F>(buf: &mut BytesMut, tag: u8, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    buf.put_u8(tag);
    let len_pos = buf.len();
    buf.put_i32(0);
    body(buf);
    backpatch_len(buf, len_pos);
}

fn backpatch_len(buf: &mut BytesMut, len_pos: usize) {
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstr(buf: &mut Bytes) -> Result<String, PgWireError> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| PgWireError::violation("missing string terminator"))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|e| PgWireError::violation(format!("invalid UTF-8: {}", e)))
}

fn get_u8(buf: &mut Bytes) -> Result<u8, PgWireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_i16(buf: &mut Bytes) -> Result<i16, PgWireError> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, PgWireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), PgWireError> {
    if buf.remaining() < needed {
        return Err(PgWireError::violation(format!(
            "message truncated: needed {} more bytes, {} available",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_count(buf: &mut Bytes) -> Result<usize, PgWireError> {
    let count = get_i16(buf)?;
    usize::try_from(count).map_err(|_| PgWireError::violation(format!("negative count {}", count)))
}

/// One column of a RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_len: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Fields of an ErrorResponse
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorFields {
    /// ERROR or FATAL
    pub severity: String,
    /// SQLSTATE
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    /// Request to start a Kerberos/GSSAPI token exchange
    AuthenticationGss,
    AuthenticationGssContinue(Bytes),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(u8),
    RowDescription(Vec<FieldDescription>),
    /// Already-encoded column values; `None` is SQL NULL
    DataRow(Vec<Option<Bytes>>),
    ParameterDescription(Vec<u32>),
    CommandComplete(String),
    ErrorResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    EmptyQueryResponse,
    PortalSuspended,
}

impl BackendMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            BackendMessage::AuthenticationOk => {
                frame(buf, backend::AUTHENTICATION, |b| b.put_i32(AUTH_OK))
            }
            BackendMessage::AuthenticationCleartextPassword => {
                frame(buf, backend::AUTHENTICATION, |b| b.put_i32(AUTH_CLEARTEXT_PASSWORD))
            }
            BackendMessage::AuthenticationGss => {
                frame(buf, backend::AUTHENTICATION, |b| b.put_i32(AUTH_GSS))
            }
            BackendMessage::AuthenticationGssContinue(token) => {
                frame(buf, backend::AUTHENTICATION, |b| {
                    b.put_i32(AUTH_GSS_CONTINUE);
                    b.put_slice(token);
                })
            }
            BackendMessage::ParameterStatus { name, value } => {
                frame(buf, backend::PARAMETER_STATUS, |b| {
                    put_cstr(b, name);
                    put_cstr(b, value);
                })
            }
            BackendMessage::BackendKeyData { process_id, secret_key } => {
                frame(buf, backend::BACKEND_KEY_DATA, |b| {
                    b.put_i32(*process_id);
                    b.put_i32(*secret_key);
                })
            }
            BackendMessage::ReadyForQuery(status) => {
                frame(buf, backend::READY_FOR_QUERY, |b| b.put_u8(*status))
            }
            BackendMessage::RowDescription(fields) => {
                frame(buf, backend::ROW_DESCRIPTION, |b| {
                    b.put_i16(fields.len() as i16);
                    for field in fields {
                        put_cstr(b, &field.name);
                        b.put_u32(field.table_oid);
                        b.put_i16(field.column_id);
                        b.put_u32(field.type_oid);
                        b.put_i16(field.type_len);
                        b.put_i32(field.type_modifier);
                        b.put_i16(field.format);
                    }
                })
            }
            BackendMessage::DataRow(values) => {
                frame(buf, backend::DATA_ROW, |b| {
                    b.put_i16(values.len() as i16);
                    for value in values {
                        match value {
                            Some(bytes) => {
                                b.put_i32(bytes.len() as i32);
                                b.put_slice(bytes);
                            }
                            None => b.put_i32(-1),
                        }
                    }
                })
            }
            BackendMessage::ParameterDescription(oids) => {
                frame(buf, backend::PARAMETER_DESCRIPTION, |b| {
                    b.put_i16(oids.len() as i16);
                    for oid in oids {
                        b.put_u32(*oid);
                    }
                })
            }
            BackendMessage::CommandComplete(tag) => {
                frame(buf, backend::COMMAND_COMPLETE, |b| put_cstr(b, tag))
            }
            BackendMessage::ErrorResponse(fields) => {
                frame(buf, backend::ERROR_RESPONSE, |b| encode_error_fields(b, fields))
            }
            BackendMessage::ParseComplete => frame(buf, backend::PARSE_COMPLETE, |_| {}),
            BackendMessage::BindComplete => frame(buf, backend::BIND_COMPLETE, |_| {}),
            BackendMessage::CloseComplete => frame(buf, backend::CLOSE_COMPLETE, |_| {}),
            BackendMessage::NoData => frame(buf, backend::NO_DATA, |_| {}),
            BackendMessage::EmptyQueryResponse => frame(buf, backend::EMPTY_QUERY_RESPONSE, |_| {}),
            BackendMessage::PortalSuspended => frame(buf, backend::PORTAL_SUSPENDED, |_| {}),
        }
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Split one complete backend message off the front of `buf`.
    ///
    /// Returns `Ok(None)` until a full frame is buffered. This is the
    /// client-side half of the codec, used by tooling and tests.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<BackendMessage>, PgWireError> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let tag = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(PgWireError::framing(format!("invalid message length {}", len)));
        }
        let total = len as usize + 1;
        if buf.len() < total {
            return Ok(None);
        }
        let mut frame = buf.split_to(total).freeze();
        frame.advance(5);
        Self::decode_payload(tag, frame).map(Some)
    }

    fn decode_payload(tag: u8, mut payload: Bytes) -> Result<BackendMessage, PgWireError> {
        let msg = match tag {
            backend::AUTHENTICATION => match get_i32(&mut payload)? {
                AUTH_OK => BackendMessage::AuthenticationOk,
                AUTH_CLEARTEXT_PASSWORD => BackendMessage::AuthenticationCleartextPassword,
                AUTH_GSS => BackendMessage::AuthenticationGss,
                AUTH_GSS_CONTINUE => BackendMessage::AuthenticationGssContinue(payload.split_off(0)),
                other => {
                    return Err(PgWireError::violation(format!("unknown authentication code {}", other)))
                }
            },
            backend::PARAMETER_STATUS => BackendMessage::ParameterStatus {
                name: get_cstr(&mut payload)?,
                value: get_cstr(&mut payload)?,
            },
            backend::BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
                process_id: get_i32(&mut payload)?,
                secret_key: get_i32(&mut payload)?,
            },
            backend::READY_FOR_QUERY => BackendMessage::ReadyForQuery(get_u8(&mut payload)?),
            backend::ROW_DESCRIPTION => {
                let count = get_count(&mut payload)?;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    fields.push(FieldDescription {
                        name: get_cstr(&mut payload)?,
                        table_oid: get_i32(&mut payload)? as u32,
                        column_id: get_i16(&mut payload)?,
                        type_oid: get_i32(&mut payload)? as u32,
                        type_len: get_i16(&mut payload)?,
                        type_modifier: get_i32(&mut payload)?,
                        format: get_i16(&mut payload)?,
                    });
                }
                BackendMessage::RowDescription(fields)
            }
            backend::DATA_ROW => {
                let count = get_count(&mut payload)?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(get_value(&mut payload)?);
                }
                BackendMessage::DataRow(values)
            }
            backend::PARAMETER_DESCRIPTION => {
                let count = get_count(&mut payload)?;
                let mut oids = Vec::with_capacity(count);
                for _ in 0..count {
                    oids.push(get_i32(&mut payload)? as u32);
                }
                BackendMessage::ParameterDescription(oids)
            }
            backend::COMMAND_COMPLETE => BackendMessage::CommandComplete(get_cstr(&mut payload)?),
            backend::ERROR_RESPONSE => BackendMessage::ErrorResponse(decode_error_fields(&mut payload)?),
            backend::PARSE_COMPLETE => BackendMessage::ParseComplete,
            backend::BIND_COMPLETE => BackendMessage::BindComplete,
            backend::CLOSE_COMPLETE => BackendMessage::CloseComplete,
            backend::NO_DATA => BackendMessage::NoData,
            backend::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
            backend::PORTAL_SUSPENDED => BackendMessage::PortalSuspended,
            other => return Err(PgWireError::UnsupportedMessage(other)),
        };
        if payload.has_remaining() {
            return Err(PgWireError::violation(format!(
                "{} trailing bytes in '{}' message",
                payload.remaining(),
                char::from(tag)
            )));
        }
        Ok(msg)
    }
}

fn get_value(buf: &mut Bytes) -> Result<Option<Bytes>, PgWireError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    ensure(buf, len as usize)?;
    Ok(Some(buf.split_to(len as usize)))
}

fn encode_error_fields(buf: &mut BytesMut, fields: &ErrorFields) {
    buf.put_u8(b'S');
    put_cstr(buf, &fields.severity);
    buf.put_u8(b'V');
    put_cstr(buf, &fields.severity);
    buf.put_u8(b'C');
    put_cstr(buf, &fields.code);
    buf.put_u8(b'M');
    put_cstr(buf, &fields.message);
    if let Some(detail) = &fields.detail {
        buf.put_u8(b'D');
        put_cstr(buf, detail);
    }
    if let Some(hint) = &fields.hint {
        buf.put_u8(b'H');
        put_cstr(buf, hint);
    }
    if let Some(file) = &fields.file {
        buf.put_u8(b'F');
        put_cstr(buf, file);
    }
    if let Some(line) = fields.line {
        buf.put_u8(b'L');
        put_cstr(buf, &line.to_string());
    }
    if let Some(routine) = &fields.routine {
        buf.put_u8(b'R');
        put_cstr(buf, routine);
    }
    buf.put_u8(0);
}

fn decode_error_fields(buf: &mut Bytes) -> Result<ErrorFields, PgWireError> {
    let mut fields = ErrorFields::default();
    loop {
        let kind = get_u8(buf)?;
        if kind == 0 {
            break;
        }
        let value = get_cstr(buf)?;
        match kind {
            b'S' => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            b'F' => fields.file = Some(value),
            b'L' => fields.line = value.parse().ok(),
            b'R' => fields.routine = Some(value),
            // V duplicates S; anything else is informational
            _ => {}
        }
    }
    Ok(fields)
}

/// Write a DataRow directly from backend values.
///
/// On failure nothing is left in `buf` for this row.
pub fn write_data_row(
    buf: &mut BytesMut,
    row: &[Value],
    types: &[super::types::PgType],
    formats: &[FormatCode],
) -> Result<(), PgWireError> {
    let start = buf.len();
    buf.put_u8(backend::DATA_ROW);
    buf.put_i32(0);
    buf.put_i16(row.len() as i16);
    for (idx, value) in row.iter().enumerate() {
        let ty = types.get(idx).copied().unwrap_or_else(|| value.natural_type());
        if let Err(e) = value.encode_field(ty, FormatCode::for_index(formats, idx), buf) {
            buf.truncate(start);
            return Err(e);
        }
    }
    backpatch_len(buf, start + 1);
    Ok(())
}

/// Describe or Close target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn from_byte(b: u8) -> Result<Self, PgWireError> {
        match b {
            b'S' => Ok(Target::Statement),
            b'P' => Ok(Target::Portal),
            other => Err(PgWireError::violation(format!(
                "invalid target type '{}'",
                char::from(other)
            ))),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Steady-state messages sent by the client
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    Query(String),
    Parse {
        name: String,
        query: String,
        param_types: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Bytes>>,
        result_formats: Vec<i16>,
    },
    Describe {
        target: Target,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Close {
        target: Target,
        name: String,
    },
    Sync,
    Flush,
    Terminate,
    /// Password or GSS token; interpretation depends on the auth method
    Password(Bytes),
}

impl FrontendMessage {
    pub fn decode(tag: u8, mut payload: Bytes) -> Result<Self, PgWireError> {
        let msg = match tag {
            frontend::QUERY => FrontendMessage::Query(get_cstr(&mut payload)?),
            frontend::PARSE => {
                let name = get_cstr(&mut payload)?;
                let query = get_cstr(&mut payload)?;
                let count = get_count(&mut payload)?;
                let mut param_types = Vec::with_capacity(count);
                for _ in 0..count {
                    param_types.push(get_i32(&mut payload)? as u32);
                }
                FrontendMessage::Parse { name, query, param_types }
            }
            frontend::BIND => {
                let portal = get_cstr(&mut payload)?;
                let statement = get_cstr(&mut payload)?;
                let count = get_count(&mut payload)?;
                let mut param_formats = Vec::with_capacity(count);
                for _ in 0..count {
                    param_formats.push(get_i16(&mut payload)?);
                }
                let count = get_count(&mut payload)?;
                let mut params = Vec::with_capacity(count);
                for _ in 0..count {
                    params.push(get_value(&mut payload)?);
                }
                let count = get_count(&mut payload)?;
                let mut result_formats = Vec::with_capacity(count);
                for _ in 0..count {
                    result_formats.push(get_i16(&mut payload)?);
                }
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                }
            }
            frontend::DESCRIBE => FrontendMessage::Describe {
                target: Target::from_byte(get_u8(&mut payload)?)?,
                name: get_cstr(&mut payload)?,
            },
            frontend::EXECUTE => FrontendMessage::Execute {
                portal: get_cstr(&mut payload)?,
                max_rows: get_i32(&mut payload)?,
            },
            frontend::CLOSE => FrontendMessage::Close {
                target: Target::from_byte(get_u8(&mut payload)?)?,
                name: get_cstr(&mut payload)?,
            },
            frontend::SYNC => FrontendMessage::Sync,
            frontend::FLUSH => FrontendMessage::Flush,
            frontend::TERMINATE => FrontendMessage::Terminate,
            frontend::PASSWORD => FrontendMessage::Password(payload.split_off(0)),
            other => return Err(PgWireError::UnsupportedMessage(other)),
        };
        Ok(msg)
    }

    /// Client-side encoding, used by tooling and tests
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            FrontendMessage::Query(sql) => frame(buf, frontend::QUERY, |b| put_cstr(b, sql)),
            FrontendMessage::Parse { name, query, param_types } => frame(buf, frontend::PARSE, |b| {
                put_cstr(b, name);
                put_cstr(b, query);
                b.put_i16(param_types.len() as i16);
                for oid in param_types {
                    b.put_u32(*oid);
                }
            }),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => frame(buf, frontend::BIND, |b| {
                put_cstr(b, portal);
                put_cstr(b, statement);
                b.put_i16(param_formats.len() as i16);
                for code in param_formats {
                    b.put_i16(*code);
                }
                b.put_i16(params.len() as i16);
                for param in params {
                    match param {
                        Some(bytes) => {
                            b.put_i32(bytes.len() as i32);
                            b.put_slice(bytes);
                        }
                        None => b.put_i32(-1),
                    }
                }
                b.put_i16(result_formats.len() as i16);
                for code in result_formats {
                    b.put_i16(*code);
                }
            }),
            FrontendMessage::Describe { target, name } => frame(buf, frontend::DESCRIBE, |b| {
                b.put_u8(target.as_byte());
                put_cstr(b, name);
            }),
            FrontendMessage::Execute { portal, max_rows } => frame(buf, frontend::EXECUTE, |b| {
                put_cstr(b, portal);
                b.put_i32(*max_rows);
            }),
            FrontendMessage::Close { target, name } => frame(buf, frontend::CLOSE, |b| {
                b.put_u8(target.as_byte());
                put_cstr(b, name);
            }),
            FrontendMessage::Sync => frame(buf, frontend::SYNC, |_| {}),
            FrontendMessage::Flush => frame(buf, frontend::FLUSH, |_| {}),
            FrontendMessage::Terminate => frame(buf, frontend::TERMINATE, |_| {}),
            FrontendMessage::Password(bytes) => frame(buf, frontend::PASSWORD, |b| b.put_slice(bytes)),
        }
    }

    /// Password frame carrying a NUL-terminated cleartext password
    pub fn password(password: &str) -> Self {
        let mut buf = BytesMut::with_capacity(password.len() + 1);
        put_cstr(&mut buf, password);
        FrontendMessage::Password(buf.freeze())
    }
}

/// Extract the cleartext password from a password frame payload
pub fn decode_password(payload: &Bytes) -> Result<String, PgWireError> {
    let mut payload = payload.clone();
    get_cstr(&mut payload)
}

/// The untagged startup packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub protocol_version: i32,
    pub parameters: Vec<(String, String)>,
}

impl StartupMessage {
    pub fn new(parameters: &[(&str, &str)]) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_3,
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the body after the length word
    pub fn decode(mut payload: Bytes) -> Result<Self, PgWireError> {
        let protocol_version = get_i32(&mut payload).map_err(PgWireError::framing)?;
        let mut parameters = Vec::new();
        loop {
            let key = get_cstr(&mut payload).map_err(PgWireError::framing)?;
            if key.is_empty() {
                break;
            }
            let value = get_cstr(&mut payload).map_err(PgWireError::framing)?;
            parameters.push((key, value));
        }
        Ok(Self {
            protocol_version,
            parameters,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_i32(0);
        buf.put_i32(self.protocol_version);
        for (key, value) in &self.parameters {
            put_cstr(buf, key);
            put_cstr(buf, value);
        }
        buf.put_u8(0);
        backpatch_len(buf, start);
    }
}

/// Encode an 8-byte untagged request such as SSLRequest
pub fn encode_request_code(code: i32, buf: &mut BytesMut) {
    buf.put_i32(8);
    buf.put_i32(code);
}

/// Encode a CancelRequest packet
pub fn encode_cancel_request(process_id: i32, secret_key: i32, buf: &mut BytesMut) {
    buf.put_i32(16);
    buf.put_i32(CANCEL_REQUEST_CODE);
    buf.put_i32(process_id);
    buf.put_i32(secret_key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_wire::protocol::types::PgType;

    fn round_trip(msg: BackendMessage) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let declared = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        assert_eq!(declared, buf.len() - 1, "length mismatch for {:?}", msg);
        let decoded = BackendMessage::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_backend_messages_round_trip() {
        round_trip(BackendMessage::AuthenticationOk);
        round_trip(BackendMessage::AuthenticationGssContinue(Bytes::from_static(b"tok")));
        round_trip(BackendMessage::ParameterStatus {
            name: "TimeZone".into(),
            value: "UTC".into(),
        });
        round_trip(BackendMessage::BackendKeyData {
            process_id: 7,
            secret_key: -99,
        });
        round_trip(BackendMessage::RowDescription(vec![FieldDescription {
            name: "id".into(),
            table_oid: 0,
            column_id: 1,
            type_oid: PgType::Int8.oid(),
            type_len: 8,
            type_modifier: -1,
            format: 0,
        }]));
        round_trip(BackendMessage::DataRow(vec![Some(Bytes::from_static(b"1")), None]));
        round_trip(BackendMessage::CommandComplete("INSERT 0 3".into()));
        round_trip(BackendMessage::ErrorResponse(ErrorFields {
            severity: "ERROR".into(),
            code: "42601".into(),
            message: "syntax error".into(),
            file: Some("parser.rs".into()),
            line: Some(12),
            routine: Some("prepare".into()),
            ..Default::default()
        }));
        round_trip(BackendMessage::PortalSuspended);
    }

    #[test]
    fn test_fixed_encodings() {
        assert_eq!(&BackendMessage::AuthenticationOk.to_bytes()[..], b"R\0\0\0\x08\0\0\0\0");
        assert_eq!(
            &BackendMessage::AuthenticationCleartextPassword.to_bytes()[..],
            b"R\0\0\0\x08\0\0\0\x03"
        );
        assert_eq!(&BackendMessage::AuthenticationGss.to_bytes()[..], b"R\0\0\0\x08\0\0\0\x07");
        assert_eq!(&BackendMessage::ReadyForQuery(b'I').to_bytes()[..], b"Z\0\0\0\x05I");
        assert_eq!(&BackendMessage::NoData.to_bytes()[..], b"n\0\0\0\x04");
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let bytes = BackendMessage::CommandComplete("SELECT 1".into()).to_bytes();
        let mut partial = BytesMut::from(&bytes[..6]);
        assert!(BackendMessage::decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&bytes[6..]);
        assert!(BackendMessage::decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_write_data_row_matches_message() {
        let mut buf = BytesMut::new();
        write_data_row(
            &mut buf,
            &[Value::Int4(5), Value::Null, Value::Text("x".into())],
            &[PgType::Int4, PgType::Text, PgType::Text],
            &[],
        )
        .unwrap();
        let expected = BackendMessage::DataRow(vec![
            Some(Bytes::from_static(b"5")),
            None,
            Some(Bytes::from_static(b"x")),
        ]);
        assert_eq!(buf.freeze(), expected.to_bytes());
    }

    #[test]
    fn test_write_data_row_failure_leaves_buffer_untouched() {
        let mut buf = BytesMut::from(&b"prefix"[..]);
        let result = write_data_row(&mut buf, &[Value::Text("abc".into())], &[PgType::Int4], &[FormatCode::Binary]);
        assert!(result.is_err());
        assert_eq!(&buf[..], b"prefix");
    }

    #[test]
    fn test_frontend_messages_round_trip() {
        let messages = vec![
            FrontendMessage::Query("SELECT 1".into()),
            FrontendMessage::Parse {
                name: "s1".into(),
                query: "SELECT $1".into(),
                param_types: vec![23],
            },
            FrontendMessage::Bind {
                portal: "".into(),
                statement: "s1".into(),
                param_formats: vec![1],
                params: vec![Some(Bytes::copy_from_slice(&5i32.to_be_bytes())), None],
                result_formats: vec![0],
            },
            FrontendMessage::Describe {
                target: Target::Portal,
                name: "p".into(),
            },
            FrontendMessage::Execute {
                portal: "p".into(),
                max_rows: 10,
            },
            FrontendMessage::Close {
                target: Target::Statement,
                name: "s1".into(),
            },
            FrontendMessage::Sync,
            FrontendMessage::password("secret"),
        ];
        for msg in messages {
            let mut buf = BytesMut::new();
            msg.encode(&mut buf);
            let tag = buf[0];
            let payload = buf.freeze().slice(5..);
            assert_eq!(FrontendMessage::decode(tag, payload).unwrap(), msg);
        }
    }

    #[test]
    fn test_truncated_payload_is_violation() {
        let err = FrontendMessage::decode(b'E', Bytes::from_static(b"portal\0\0\0")).unwrap_err();
        assert!(matches!(err, PgWireError::ProtocolViolation(_)));
        let err = FrontendMessage::decode(b'D', Bytes::from_static(b"Xname\0")).unwrap_err();
        assert!(matches!(err, PgWireError::ProtocolViolation(_)));
    }

    #[test]
    fn test_unknown_frontend_tag() {
        let err = FrontendMessage::decode(b'd', Bytes::new()).unwrap_err();
        assert!(matches!(err, PgWireError::UnsupportedMessage(b'd')));
    }

    #[test]
    fn test_startup_message_round_trip() {
        let startup = StartupMessage::new(&[("user", "alice"), ("database", "analytics")]);
        let mut buf = BytesMut::new();
        startup.encode(&mut buf);
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len());
        let decoded = StartupMessage::decode(buf.freeze().slice(4..)).unwrap();
        assert_eq!(decoded.parameter("user"), Some("alice"));
        assert_eq!(decoded, startup);
    }

    #[test]
    fn test_decode_password() {
        if let FrontendMessage::Password(payload) = FrontendMessage::password("secret") {
            assert_eq!(decode_password(&payload).unwrap(), "secret");
        } else {
            panic!("expected password frame");
        }
    }
}
