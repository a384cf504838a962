//! Binary frame protocol for WebSocket tunnel multiplexing.
//!
//! All integers are little-endian. Two framing shapes share the wire:
//!
//! - Control frames, `Ping`/`Pong`: `[cmd:1][unix_seconds:8]` (9 bytes total).
//! - Request frames: a 5-byte header `[cmd:1][idx:2][tag:2]` followed by a
//!   command-specific payload. A cmd is a request frame iff `0x03 <= cmd <
//!   0x0A`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Request-frame header size: `cmd` + `idx` + `tag`.
pub const HEADER_SIZE: usize = 5;
/// Ping/Pong control frame size: `cmd` + 8-byte timestamp.
pub const PING_PONG_SIZE: usize = 9;

/// Wire command codes. Grounded in the Go original's `CMD` enum
/// (`original_source/proxy/tunnel.go`), but renumbered to the hex scheme this
/// protocol actually specifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Ping = 0x01,
    Pong = 0x02,
    ReqData = 0x03,
    ReqCreated = 0x04,
    ReqClientClosed = 0x05,
    ReqClientFinished = 0x06,
    ReqServerFinished = 0x07,
    ReqServerClosed = 0x08,
    ReqRefreshQuota = 0x09,
}

impl Cmd {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::Pong),
            0x03 => Some(Self::ReqData),
            0x04 => Some(Self::ReqCreated),
            0x05 => Some(Self::ReqClientClosed),
            0x06 => Some(Self::ReqClientFinished),
            0x07 => Some(Self::ReqServerFinished),
            0x08 => Some(Self::ReqServerClosed),
            0x09 => Some(Self::ReqRefreshQuota),
            _ => None,
        }
    }

    /// True for the commands that carry an `(idx, tag)` header rather than a
    /// bare timestamp.
    pub fn is_request_frame(self) -> bool {
        matches!(
            self,
            Cmd::ReqData
                | Cmd::ReqCreated
                | Cmd::ReqClientClosed
                | Cmd::ReqClientFinished
                | Cmd::ReqServerFinished
                | Cmd::ReqServerClosed
                | Cmd::ReqRefreshQuota
        )
    }
}

/// Destination address type carried in `ReqCreated`. Only domain names are
/// distinguished on the wire; IP literals travel as their dotted-decimal
/// string under the same `addr_type`.
pub const ADDR_TYPE_NAME: u8 = 1;

/// A decoded tunnel frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Ping { unix_seconds: u64 },
    Pong { echoed: u64 },
    Request {
        cmd: Cmd,
        idx: u16,
        tag: u16,
        payload: Bytes,
    },
}

impl Frame {
    pub fn ping(unix_seconds: u64) -> Self {
        Frame::Ping { unix_seconds }
    }

    pub fn pong(echoed: u64) -> Self {
        Frame::Pong { echoed }
    }

    pub fn req_data(idx: u16, tag: u16, payload: impl Into<Bytes>) -> Self {
        Frame::Request {
            cmd: Cmd::ReqData,
            idx,
            tag,
            payload: payload.into(),
        }
    }

    /// Build a `ReqCreated` frame for `addr`/`port`. `addr` may be an FQDN or
    /// an IPv4/IPv6 literal in string form; both use `addr_type = 1`.
    pub fn req_created(idx: u16, tag: u16, addr: &str, port: u16) -> Self {
        let addr_bytes = addr.as_bytes();
        let mut payload = BytesMut::with_capacity(1 + 1 + addr_bytes.len() + 2);
        payload.put_u8(ADDR_TYPE_NAME);
        payload.put_u8(addr_bytes.len() as u8);
        payload.put_slice(addr_bytes);
        payload.put_u16_le(port);
        Frame::Request {
            cmd: Cmd::ReqCreated,
            idx,
            tag,
            payload: payload.freeze(),
        }
    }

    fn empty_request(cmd: Cmd, idx: u16, tag: u16) -> Self {
        Frame::Request {
            cmd,
            idx,
            tag,
            payload: Bytes::new(),
        }
    }

    pub fn req_client_closed(idx: u16, tag: u16) -> Self {
        Self::empty_request(Cmd::ReqClientClosed, idx, tag)
    }

    pub fn req_client_finished(idx: u16, tag: u16) -> Self {
        Self::empty_request(Cmd::ReqClientFinished, idx, tag)
    }

    pub fn req_server_finished(idx: u16, tag: u16) -> Self {
        Self::empty_request(Cmd::ReqServerFinished, idx, tag)
    }

    pub fn req_server_closed(idx: u16, tag: u16) -> Self {
        Self::empty_request(Cmd::ReqServerClosed, idx, tag)
    }

    /// Encode into bytes ready for a WebSocket binary message.
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Ping { unix_seconds } => {
                let mut buf = BytesMut::with_capacity(PING_PONG_SIZE);
                buf.put_u8(Cmd::Ping as u8);
                buf.put_u64_le(*unix_seconds);
                buf.freeze()
            }
            Frame::Pong { echoed } => {
                let mut buf = BytesMut::with_capacity(PING_PONG_SIZE);
                buf.put_u8(Cmd::Pong as u8);
                buf.put_u64_le(*echoed);
                buf.freeze()
            }
            Frame::Request {
                cmd,
                idx,
                tag,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
                buf.put_u8(*cmd as u8);
                buf.put_u16_le(*idx);
                buf.put_u16_le(*tag);
                buf.put_slice(payload);
                buf.freeze()
            }
        }
    }

    /// Decode a frame from a WebSocket binary message.
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::TooShort {
                expected: 1,
                actual: 0,
            });
        }
        let cmd_raw = data[0];
        let cmd = Cmd::from_u8(cmd_raw).ok_or(ProtocolError::UnknownCmd(cmd_raw))?;

        match cmd {
            Cmd::Ping | Cmd::Pong => {
                if data.len() != PING_PONG_SIZE {
                    return Err(ProtocolError::TooShort {
                        expected: PING_PONG_SIZE,
                        actual: data.len(),
                    });
                }
                data.advance(1);
                let value = data.get_u64_le();
                Ok(if cmd == Cmd::Ping {
                    Frame::Ping { unix_seconds: value }
                } else {
                    Frame::Pong { echoed: value }
                })
            }
            _ => {
                if data.len() < HEADER_SIZE {
                    return Err(ProtocolError::TooShort {
                        expected: HEADER_SIZE,
                        actual: data.len(),
                    });
                }
                data.advance(1);
                let idx = data.get_u16_le();
                let tag = data.get_u16_le();
                Ok(Frame::Request {
                    cmd,
                    idx,
                    tag,
                    payload: data,
                })
            }
        }
    }
}

/// Parsed payload of a `ReqCreated` frame.
#[derive(Debug, PartialEq, Eq)]
pub struct ReqCreatedBody {
    pub addr: String,
    pub port: u16,
}

impl ReqCreatedBody {
    pub fn parse(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < 2 {
            return Err(ProtocolError::TooShort {
                expected: 2,
                actual: payload.len(),
            });
        }
        let _addr_type = payload.get_u8();
        let addr_len = payload.get_u8() as usize;
        if payload.len() < addr_len + 2 {
            return Err(ProtocolError::TooShort {
                expected: addr_len + 2,
                actual: payload.len(),
            });
        }
        let addr_bytes = payload.split_to(addr_len);
        let addr = String::from_utf8(addr_bytes.to_vec())
            .map_err(|_| ProtocolError::InvalidAddr)?;
        let port = payload.get_u16_le();
        Ok(Self { addr, port })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("unknown command: 0x{0:02x}")]
    UnknownCmd(u8),
    #[error("ReqCreated address is not valid utf-8")]
    InvalidAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_roundtrip() {
        let ping = Frame::ping(1_700_000_000);
        let encoded = ping.encode();
        assert_eq!(encoded.len(), PING_PONG_SIZE);
        match Frame::decode(encoded).unwrap() {
            Frame::Ping { unix_seconds } => assert_eq!(unix_seconds, 1_700_000_000),
            other => panic!("expected Ping, got {other:?}"),
        }

        let pong = Frame::pong(1_700_000_000);
        match Frame::decode(pong.encode()).unwrap() {
            Frame::Pong { echoed } => assert_eq!(echoed, 1_700_000_000),
            other => panic!("expected Pong, got {other:?}"),
        }
    }

    #[test]
    fn req_data_roundtrip() {
        let frame = Frame::req_data(7, 3, Bytes::from_static(b"hello"));
        let encoded = frame.encode();
        match Frame::decode(encoded).unwrap() {
            Frame::Request {
                cmd,
                idx,
                tag,
                payload,
            } => {
                assert_eq!(cmd, Cmd::ReqData);
                assert_eq!(idx, 7);
                assert_eq!(tag, 3);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn req_created_encodes_per_spec_example() {
        // SOCKS5 echo scenario from the testable-properties scenarios:
        // ReqCreated(idx=0, tag=1, addr_type=1, len=11, "example.com", port=80)
        let frame = Frame::req_created(0, 1, "example.com", 80);
        let encoded = frame.encode();
        assert_eq!(encoded[0], Cmd::ReqCreated as u8);
        assert_eq!(&encoded[1..3], &0u16.to_le_bytes());
        assert_eq!(&encoded[3..5], &1u16.to_le_bytes());
        assert_eq!(encoded[5], ADDR_TYPE_NAME);
        assert_eq!(encoded[6], 11);
        assert_eq!(&encoded[7..18], b"example.com");
        assert_eq!(&encoded[18..20], &80u16.to_le_bytes());

        let Frame::Request { payload, .. } = Frame::decode(encoded).unwrap() else {
            panic!("expected Request");
        };
        let body = ReqCreatedBody::parse(payload).unwrap();
        assert_eq!(body.addr, "example.com");
        assert_eq!(body.port, 80);
    }

    #[test]
    fn empty_request_frames_roundtrip() {
        for frame in [
            Frame::req_client_closed(1, 2),
            Frame::req_client_finished(1, 2),
            Frame::req_server_finished(1, 2),
            Frame::req_server_closed(1, 2),
        ] {
            let encoded = frame.encode();
            assert_eq!(encoded.len(), HEADER_SIZE);
            let decoded = Frame::decode(encoded).unwrap();
            let Frame::Request { payload, .. } = decoded else {
                panic!("expected Request");
            };
            assert!(payload.is_empty());
        }
    }

    #[test]
    fn cmd_range_defines_request_frames() {
        assert!(!Cmd::Ping.is_request_frame());
        assert!(!Cmd::Pong.is_request_frame());
        for raw in 0x03u8..0x0A {
            assert!(Cmd::from_u8(raw).unwrap().is_request_frame());
        }
    }

    #[test]
    fn decode_rejects_short_and_unknown() {
        assert!(matches!(
            Frame::decode(Bytes::new()),
            Err(ProtocolError::TooShort { .. })
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0xff])),
            Err(ProtocolError::UnknownCmd(0xff))
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[Cmd::ReqData as u8, 0, 0])),
            Err(ProtocolError::TooShort { .. })
        ));
    }

    #[test]
    fn req_refresh_quota_is_reserved_and_parseable() {
        let frame = Frame::empty_request(Cmd::ReqRefreshQuota, 0, 0);
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert!(matches!(
            decoded,
            Frame::Request {
                cmd: Cmd::ReqRefreshQuota,
                ..
            }
        ));
    }
}
