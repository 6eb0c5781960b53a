//! Connection-phase aware frame decoder
//!
//! The first packets on a connection are untagged (SSLRequest, GSSENCRequest,
//! CancelRequest, startup). Once the startup packet is read the decoder
//! switches permanently to tagged steady-state framing.

use super::protocol::constants::*;
use super::protocol::messages::StartupMessage;
use bytes::{Buf, Bytes, BytesMut};
use pgbridge_common::PgWireError;
use tokio_util::codec::Decoder;

/// Where the connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// First packet: SSLRequest, GSSENCRequest, CancelRequest or startup
    AwaitingStartupOrSsl,
    /// SSL was negotiated (or declined); only the startup packet may follow
    AwaitingStartupParameters,
    /// Tagged messages
    SteadyState,
    /// A CancelRequest was read; nothing else is expected on this connection
    CancelRequest,
}

/// One decoded unit from the client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionFrame {
    SslRequest,
    GssEncRequest,
    CancelRequest { process_id: i32, secret_key: i32 },
    Startup(StartupMessage),
    /// Steady-state message; the payload is interpreted by the handler
    Message { tag: u8, payload: Bytes },
}

#[derive(Debug)]
pub struct PgDecoder {
    state: DecoderState,
    max_message_length: usize,
}

impl PgDecoder {
    pub fn new(max_message_length: usize) -> Self {
        Self {
            state: DecoderState::AwaitingStartupOrSsl,
            max_message_length,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    fn decode_startup(&mut self, src: &mut BytesMut) -> Result<Option<ConnectionFrame>, PgWireError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len < 8 || len as usize > MAX_STARTUP_PACKET_LENGTH {
            return Err(PgWireError::framing(format!("invalid startup packet length {}", len)));
        }
        let len = len as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut packet = src.split_to(len).freeze();
        packet.advance(4);
        let code = i32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);

        let frame = match (code, len) {
            (SSL_REQUEST_CODE, 8) => {
                if self.state != DecoderState::AwaitingStartupOrSsl {
                    return Err(PgWireError::framing("SSL negotiation already performed"));
                }
                self.state = DecoderState::AwaitingStartupParameters;
                ConnectionFrame::SslRequest
            }
            (GSSENC_REQUEST_CODE, 8) => ConnectionFrame::GssEncRequest,
            (CANCEL_REQUEST_CODE, 16) => {
                packet.advance(4);
                self.state = DecoderState::CancelRequest;
                ConnectionFrame::CancelRequest {
                    process_id: packet.get_i32(),
                    secret_key: packet.get_i32(),
                }
            }
            _ => {
                let startup = StartupMessage::decode(packet)?;
                self.state = DecoderState::SteadyState;
                ConnectionFrame::Startup(startup)
            }
        };
        Ok(Some(frame))
    }

    fn decode_message(&mut self, src: &mut BytesMut) -> Result<Option<ConnectionFrame>, PgWireError> {
        if src.len() < 5 {
            return Ok(None);
        }
        let tag = src[0];
        let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if len < 4 {
            return Err(PgWireError::framing(format!(
                "invalid length {} for message '{}'",
                len,
                char::from(tag)
            )));
        }
        let len = len as usize;
        if len - 4 > self.max_message_length {
            return Err(PgWireError::framing(format!(
                "message '{}' of {} bytes exceeds the limit of {} bytes",
                char::from(tag),
                len - 4,
                self.max_message_length
            )));
        }
        if src.len() < len + 1 {
            src.reserve(len + 1 - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(len + 1).freeze();
        frame.advance(5);
        Ok(Some(ConnectionFrame::Message { tag, payload: frame }))
    }
}

impl Decoder for PgDecoder {
    type Item = ConnectionFrame;
    type Error = PgWireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            DecoderState::AwaitingStartupOrSsl | DecoderState::AwaitingStartupParameters => {
                self.decode_startup(src)
            }
            DecoderState::SteadyState => self.decode_message(src),
            DecoderState::CancelRequest => {
                src.clear();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_wire::protocol::messages::{encode_cancel_request, encode_request_code, FrontendMessage};

    fn startup_bytes() -> BytesMut {
        let mut buf = BytesMut::new();
        StartupMessage::new(&[("user", "alice"), ("database", "db")]).encode(&mut buf);
        buf
    }

    #[test]
    fn test_startup_then_steady_state() {
        let mut decoder = PgDecoder::new(1024);
        let mut buf = startup_bytes();
        FrontendMessage::Sync.encode(&mut buf);

        match decoder.decode(&mut buf).unwrap() {
            Some(ConnectionFrame::Startup(startup)) => assert_eq!(startup.parameter("user"), Some("alice")),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(decoder.state(), DecoderState::SteadyState);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(ConnectionFrame::Message {
                tag: b'S',
                payload: Bytes::new()
            })
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_partial_frames_are_buffered() {
        let mut decoder = PgDecoder::new(1024);
        let full = startup_bytes();
        let mut buf = BytesMut::from(&full[..3]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[3..10]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[10..]);
        assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(ConnectionFrame::Startup(_))));

        let mut query = BytesMut::new();
        FrontendMessage::Query("SELECT 1".into()).encode(&mut query);
        let mut buf = BytesMut::from(&query[..7]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&query[7..]);
        match decoder.decode(&mut buf).unwrap() {
            Some(ConnectionFrame::Message { tag, payload }) => {
                assert_eq!(tag, b'Q');
                assert_eq!(&payload[..], b"SELECT 1\0");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_ssl_request_only_once() {
        let mut decoder = PgDecoder::new(1024);
        let mut buf = BytesMut::new();
        encode_request_code(SSL_REQUEST_CODE, &mut buf);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(ConnectionFrame::SslRequest));
        assert_eq!(decoder.state(), DecoderState::AwaitingStartupParameters);

        encode_request_code(SSL_REQUEST_CODE, &mut buf);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(PgWireError::ProtocolFraming(_))
        ));
    }

    #[test]
    fn test_gssenc_request_keeps_state() {
        let mut decoder = PgDecoder::new(1024);
        let mut buf = BytesMut::new();
        encode_request_code(GSSENC_REQUEST_CODE, &mut buf);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(ConnectionFrame::GssEncRequest));
        assert_eq!(decoder.state(), DecoderState::AwaitingStartupOrSsl);
    }

    #[test]
    fn test_cancel_request() {
        let mut decoder = PgDecoder::new(1024);
        let mut buf = BytesMut::new();
        encode_cancel_request(42, 1234, &mut buf);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(ConnectionFrame::CancelRequest {
                process_id: 42,
                secret_key: 1234
            })
        );
        assert_eq!(decoder.state(), DecoderState::CancelRequest);
    }

    #[test]
    fn test_negative_length_is_fatal() {
        let mut decoder = PgDecoder::new(1024);
        let mut buf = startup_bytes();
        decoder.decode(&mut buf).unwrap();
        buf.extend_from_slice(&[b'Q', 0xff, 0xff, 0xff, 0xf0]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, PgWireError::ProtocolFraming(_)));
    }

    #[test]
    fn test_oversized_message_is_fatal() {
        let mut decoder = PgDecoder::new(16);
        let mut buf = startup_bytes();
        decoder.decode(&mut buf).unwrap();
        FrontendMessage::Query("SELECT 'this query is longer than sixteen bytes'".into()).encode(&mut buf);
        assert!(matches!(decoder.decode(&mut buf), Err(PgWireError::ProtocolFraming(_))));
    }

    #[test]
    fn test_oversized_startup_is_fatal() {
        let mut decoder = PgDecoder::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&20_000i32.to_be_bytes());
        assert!(matches!(decoder.decode(&mut buf), Err(PgWireError::ProtocolFraming(_))));
    }
}
