//! PostgreSQL type OID and length mappings
//!
//! Maps backend logical values to PostgreSQL wire protocol types and
//! encodes/decodes them in text and binary format.
//! PostgreSQL OIDs: https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use pgbridge_common::PgWireError;
use std::fmt::Write as _;

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01)
const PG_EPOCH_UNIX_SECS: i64 = 946_684_800;

fn pg_epoch() -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp(PG_EPOCH_UNIX_SECS, 0)
        .unwrap_or_default()
        .naive_utc()
}

/// Wire format of a parameter or result column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatCode {
    #[default]
    Text,
    Binary,
}

impl FormatCode {
    pub fn from_code(code: i16) -> Result<Self, PgWireError> {
        match code {
            0 => Ok(FormatCode::Text),
            1 => Ok(FormatCode::Binary),
            other => Err(PgWireError::UnsupportedFormatCode(other)),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            FormatCode::Text => 0,
            FormatCode::Binary => 1,
        }
    }

    /// Format for the value at `index`: no codes means text, one code applies to all
    pub fn for_index(codes: &[FormatCode], index: usize) -> FormatCode {
        match codes.len() {
            0 => FormatCode::Text,
            1 => codes[0],
            _ => codes.get(index).copied().unwrap_or_default(),
        }
    }

    /// Reject a per-column code list whose length does not match the columns
    pub fn check_count(codes: &[FormatCode], columns: usize) -> Result<(), PgWireError> {
        if codes.len() > 1 && codes.len() != columns {
            return Err(PgWireError::violation(format!(
                "bind message has {} result formats but query has {} columns",
                codes.len(),
                columns
            )));
        }
        Ok(())
    }
}

/// PostgreSQL types this server can describe, encode and decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgType {
    Bool,
    Bytea,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Varchar,
    Json,
    Jsonb,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    /// Untyped literal / unspecified parameter
    Unknown,
}

impl PgType {
    pub const fn oid(self) -> u32 {
        match self {
            PgType::Bool => 16,
            PgType::Bytea => 17,
            PgType::Int8 => 20,
            PgType::Int2 => 21,
            PgType::Int4 => 23,
            PgType::Text => 25,
            PgType::Json => 114,
            PgType::Float4 => 700,
            PgType::Float8 => 701,
            PgType::Unknown => 705,
            PgType::Varchar => 1043,
            PgType::Date => 1082,
            PgType::Time => 1083,
            PgType::Timestamp => 1114,
            PgType::TimestampTz => 1184,
            PgType::Numeric => 1700,
            PgType::Uuid => 2950,
            PgType::Jsonb => 3802,
        }
    }

    /// Fixed size for fixed-length types, -1 for variable-length
    pub const fn type_len(self) -> i16 {
        match self {
            PgType::Bool => 1,
            PgType::Int2 => 2,
            PgType::Int4 | PgType::Float4 | PgType::Date => 4,
            PgType::Int8 | PgType::Float8 | PgType::Time => 8,
            PgType::Timestamp | PgType::TimestampTz => 8,
            PgType::Uuid => 16,
            _ => -1,
        }
    }

    pub fn from_oid(oid: u32) -> Option<PgType> {
        let ty = match oid {
            16 => PgType::Bool,
            17 => PgType::Bytea,
            20 => PgType::Int8,
            21 => PgType::Int2,
            23 => PgType::Int4,
            25 => PgType::Text,
            114 => PgType::Json,
            700 => PgType::Float4,
            701 => PgType::Float8,
            705 => PgType::Unknown,
            1043 => PgType::Varchar,
            1082 => PgType::Date,
            1083 => PgType::Time,
            1114 => PgType::Timestamp,
            1184 => PgType::TimestampTz,
            1700 => PgType::Numeric,
            2950 => PgType::Uuid,
            3802 => PgType::Jsonb,
            _ => return None,
        };
        Some(ty)
    }

    pub fn name(self) -> &'static str {
        match self {
            PgType::Bool => "bool",
            PgType::Bytea => "bytea",
            PgType::Int2 => "int2",
            PgType::Int4 => "int4",
            PgType::Int8 => "int8",
            PgType::Float4 => "float4",
            PgType::Float8 => "float8",
            PgType::Numeric => "numeric",
            PgType::Text => "text",
            PgType::Varchar => "varchar",
            PgType::Json => "json",
            PgType::Jsonb => "jsonb",
            PgType::Date => "date",
            PgType::Time => "time",
            PgType::Timestamp => "timestamp",
            PgType::TimestampTz => "timestamptz",
            PgType::Uuid => "uuid",
            PgType::Unknown => "unknown",
        }
    }

    /// Decode a bound parameter value
    pub fn decode(self, index: usize, raw: &[u8], format: FormatCode) -> Result<Value, PgWireError> {
        let invalid = |reason: String| PgWireError::InvalidParameterValue { index: index + 1, reason };
        match format {
            FormatCode::Text => {
                let text = std::str::from_utf8(raw).map_err(|e| invalid(e.to_string()))?;
                self.decode_text(text).map_err(invalid)
            }
            FormatCode::Binary => self.decode_binary(raw).map_err(|e| match e {
                BinaryDecodeError::Unsupported => PgWireError::UnsupportedFormatCode(1),
                BinaryDecodeError::Invalid(reason) => invalid(reason),
            }),
        }
    }

    fn decode_text(self, text: &str) -> Result<Value, String> {
        let trimmed = text.trim();
        let value = match self {
            PgType::Bool => match trimmed.to_lowercase().as_str() {
                "t" | "true" | "y" | "yes" | "on" | "1" => Value::Bool(true),
                "f" | "false" | "n" | "no" | "off" | "0" => Value::Bool(false),
                other => return Err(format!("invalid input syntax for type boolean: \"{}\"", other)),
            },
            PgType::Int2 => Value::Int2(trimmed.parse().map_err(|e| format!("{}: \"{}\"", e, trimmed))?),
            PgType::Int4 => Value::Int4(trimmed.parse().map_err(|e| format!("{}: \"{}\"", e, trimmed))?),
            PgType::Int8 => Value::Int8(trimmed.parse().map_err(|e| format!("{}: \"{}\"", e, trimmed))?),
            PgType::Float4 => Value::Float4(parse_float(trimmed)? as f32),
            PgType::Float8 => Value::Float8(parse_float(trimmed)?),
            PgType::Numeric => {
                parse_float(trimmed)?;
                Value::Numeric(trimmed.to_string())
            }
            PgType::Text | PgType::Varchar | PgType::Unknown => Value::Text(text.to_string()),
            PgType::Json | PgType::Jsonb => {
                serde_json::from_str::<serde_json::Value>(text).map_err(|e| e.to_string())?;
                Value::Json(text.to_string())
            }
            PgType::Bytea => match text.strip_prefix("\\x") {
                Some(hex) => Value::Bytes(decode_hex(hex)?),
                None => Value::Bytes(text.as_bytes().to_vec()),
            },
            PgType::Uuid => Value::Uuid(uuid::Uuid::parse_str(trimmed).map_err(|e| e.to_string())?),
            PgType::Date => Value::Date(
                NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|e| e.to_string())?,
            ),
            PgType::Time => Value::Time(
                NaiveTime::parse_from_str(trimmed, "%H:%M:%S%.f").map_err(|e| e.to_string())?,
            ),
            PgType::Timestamp => Value::Timestamp(parse_timestamp(trimmed)?),
            PgType::TimestampTz => Value::TimestampTz(parse_timestamptz(trimmed)?),
        };
        Ok(value)
    }

    fn decode_binary(self, raw: &[u8]) -> Result<Value, BinaryDecodeError> {
        let value = match self {
            PgType::Bool => Value::Bool(fixed::<1>(raw)?[0] != 0),
            PgType::Int2 => Value::Int2(i16::from_be_bytes(fixed(raw)?)),
            PgType::Int4 => Value::Int4(i32::from_be_bytes(fixed(raw)?)),
            PgType::Int8 => Value::Int8(i64::from_be_bytes(fixed(raw)?)),
            PgType::Float4 => Value::Float4(f32::from_be_bytes(fixed(raw)?)),
            PgType::Float8 => Value::Float8(f64::from_be_bytes(fixed(raw)?)),
            PgType::Numeric => return Err(BinaryDecodeError::Unsupported),
            PgType::Text | PgType::Varchar | PgType::Unknown => Value::Text(utf8(raw)?),
            PgType::Json => Value::Json(utf8(raw)?),
            PgType::Jsonb => match raw.split_first() {
                Some((1, rest)) => Value::Json(utf8(rest)?),
                _ => return Err(BinaryDecodeError::Invalid("unsupported jsonb version".into())),
            },
            PgType::Bytea => Value::Bytes(raw.to_vec()),
            PgType::Uuid => Value::Uuid(uuid::Uuid::from_bytes(fixed(raw)?)),
            PgType::Date => {
                let days = i32::from_be_bytes(fixed(raw)?);
                pg_epoch()
                    .date()
                    .checked_add_signed(chrono::Duration::days(days as i64))
                    .map(Value::Date)
                    .ok_or_else(|| BinaryDecodeError::Invalid("date out of range".into()))?
            }
            PgType::Time => {
                let micros = i64::from_be_bytes(fixed(raw)?);
                NaiveTime::from_num_seconds_from_midnight_opt(
                    (micros / 1_000_000) as u32,
                    ((micros % 1_000_000) * 1000) as u32,
                )
                .map(Value::Time)
                .ok_or_else(|| BinaryDecodeError::Invalid("time out of range".into()))?
            }
            PgType::Timestamp | PgType::TimestampTz => {
                let micros = i64::from_be_bytes(fixed(raw)?);
                let ts = pg_epoch()
                    .checked_add_signed(chrono::Duration::microseconds(micros))
                    .ok_or_else(|| BinaryDecodeError::Invalid("timestamp out of range".into()))?;
                if self == PgType::Timestamp {
                    Value::Timestamp(ts)
                } else {
                    Value::TimestampTz(ts.and_utc())
                }
            }
        };
        Ok(value)
    }
}

enum BinaryDecodeError {
    Unsupported,
    Invalid(String),
}

fn fixed<const N: usize>(raw: &[u8]) -> Result<[u8; N], BinaryDecodeError> {
    raw.try_into().map_err(|_| {
        BinaryDecodeError::Invalid(format!("expected {} bytes, got {}", N, raw.len()))
    })
}

fn utf8(raw: &[u8]) -> Result<String, BinaryDecodeError> {
    String::from_utf8(raw.to_vec()).map_err(|e| BinaryDecodeError::Invalid(e.to_string()))
}

fn parse_float(text: &str) -> Result<f64, String> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => text.parse().map_err(|e| format!("{}: \"{}\"", e, text)),
    }
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN))
        })
        .map_err(|e| format!("invalid timestamp \"{}\": {}", text, e))
}

fn parse_timestamptz(text: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| parse_timestamp(text).map(|naive| naive.and_utc()))
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hexadecimal digit in \"{}\"", hex))
        })
        .collect()
}

/// A logical value flowing between the backend and the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Decimal kept in its textual form
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(String),
    Uuid(uuid::Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Wire type a value of this variant is described with by default
    pub fn natural_type(&self) -> PgType {
        match self {
            Value::Null => PgType::Text,
            Value::Bool(_) => PgType::Bool,
            Value::Int2(_) => PgType::Int2,
            Value::Int4(_) => PgType::Int4,
            Value::Int8(_) => PgType::Int8,
            Value::Float4(_) => PgType::Float4,
            Value::Float8(_) => PgType::Float8,
            Value::Numeric(_) => PgType::Numeric,
            Value::Text(_) => PgType::Text,
            Value::Bytes(_) => PgType::Bytea,
            Value::Json(_) => PgType::Json,
            Value::Uuid(_) => PgType::Uuid,
            Value::Date(_) => PgType::Date,
            Value::Time(_) => PgType::Time,
            Value::Timestamp(_) => PgType::Timestamp,
            Value::TimestampTz(_) => PgType::TimestampTz,
        }
    }

    /// PostgreSQL text representation; `None` for NULL
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            Value::Null => return None,
            Value::Bool(b) => (if *b { "t" } else { "f" }).to_string(),
            Value::Int2(v) => v.to_string(),
            Value::Int4(v) => v.to_string(),
            Value::Int8(v) => v.to_string(),
            Value::Float4(v) => format_float(*v),
            Value::Float8(v) => format_float(*v),
            Value::Numeric(s) | Value::Text(s) | Value::Json(s) => s.clone(),
            Value::Bytes(bytes) => {
                let mut out = String::with_capacity(2 + bytes.len() * 2);
                out.push_str("\\x");
                for b in bytes {
                    let _ = write!(out, "{:02x}", b);
                }
                out
            }
            Value::Uuid(u) => u.hyphenated().to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Value::TimestampTz(ts) => format!("{}+00", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        };
        Some(text)
    }

    /// Write this value as a length-prefixed DataRow field
    pub fn encode_field(&self, ty: PgType, format: FormatCode, buf: &mut BytesMut) -> Result<(), PgWireError> {
        if self.is_null() {
            buf.put_i32(-1);
            return Ok(());
        }
        let len_pos = buf.len();
        buf.put_i32(0);
        match format {
            FormatCode::Text => {
                if let Some(text) = self.to_text() {
                    buf.put_slice(text.as_bytes());
                }
            }
            FormatCode::Binary => self.encode_binary(ty, buf)?,
        }
        let len = (buf.len() - len_pos - 4) as i32;
        buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    fn encode_binary(&self, ty: PgType, buf: &mut BytesMut) -> Result<(), PgWireError> {
        let mismatch = || {
            PgWireError::ExecutionFailure(anyhow::anyhow!(
                "cannot encode {:?} as binary {}",
                self,
                ty.name()
            ))
        };
        match ty {
            PgType::Bool => match self {
                Value::Bool(b) => buf.put_u8(*b as u8),
                _ => return Err(mismatch()),
            },
            PgType::Int2 => buf.put_i16(i16::try_from(self.as_i64().ok_or_else(mismatch)?).map_err(|_| mismatch())?),
            PgType::Int4 => buf.put_i32(i32::try_from(self.as_i64().ok_or_else(mismatch)?).map_err(|_| mismatch())?),
            PgType::Int8 => buf.put_i64(self.as_i64().ok_or_else(mismatch)?),
            PgType::Float4 => buf.put_f32(self.as_f64().ok_or_else(mismatch)? as f32),
            PgType::Float8 => buf.put_f64(self.as_f64().ok_or_else(mismatch)?),
            PgType::Numeric => return Err(PgWireError::UnsupportedFormatCode(1)),
            PgType::Bytea => match self {
                Value::Bytes(bytes) => buf.put_slice(bytes),
                other => buf.put_slice(other.to_text().unwrap_or_default().as_bytes()),
            },
            PgType::Uuid => match self {
                Value::Uuid(u) => buf.put_slice(u.as_bytes()),
                Value::Text(s) => buf.put_slice(uuid::Uuid::parse_str(s).map_err(|_| mismatch())?.as_bytes()),
                _ => return Err(mismatch()),
            },
            PgType::Date => match self {
                Value::Date(d) => buf.put_i32((*d - pg_epoch().date()).num_days() as i32),
                _ => return Err(mismatch()),
            },
            PgType::Time => match self {
                Value::Time(t) => {
                    let micros = t.num_seconds_from_midnight() as i64 * 1_000_000
                        + (t.nanosecond() / 1000) as i64;
                    buf.put_i64(micros)
                }
                _ => return Err(mismatch()),
            },
            PgType::Timestamp | PgType::TimestampTz => {
                let naive = match self {
                    Value::Timestamp(ts) => *ts,
                    Value::TimestampTz(ts) => ts.naive_utc(),
                    _ => return Err(mismatch()),
                };
                let micros = (naive - pg_epoch()).num_microseconds().ok_or_else(mismatch)?;
                buf.put_i64(micros)
            }
            PgType::Jsonb => {
                buf.put_u8(1);
                buf.put_slice(self.to_text().unwrap_or_default().as_bytes())
            }
            PgType::Text | PgType::Varchar | PgType::Json | PgType::Unknown => {
                buf.put_slice(self.to_text().unwrap_or_default().as_bytes())
            }
        }
        Ok(())
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int2(v) => Some(*v as i64),
            Value::Int4(v) => Some(*v as i64),
            Value::Int8(v) => Some(*v),
            Value::Text(s) | Value::Numeric(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float4(v) => Some(*v as f64),
            Value::Float8(v) => Some(*v),
            Value::Text(s) | Value::Numeric(s) => parse_float(s.trim()).ok(),
            other => other.as_i64().map(|v| v as f64),
        }
    }
}

fn format_float<F: Into<f64> + ToString + Copy>(v: F) -> String {
    let wide: f64 = v.into();
    if wide.is_nan() {
        "NaN".to_string()
    } else if wide == f64::INFINITY {
        "Infinity".to_string()
    } else if wide == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        v.to_string()
    }
}
