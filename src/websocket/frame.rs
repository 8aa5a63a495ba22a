//! HYBI-10 frame encoding and decoding.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! Only unfragmented text, close, ping and pong frames are supported.

use crate::websocket::error::{WebSocketError, WebSocketResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FIN: u8 = 0x80;
const MASK: u8 = 0x80;

/// Largest payload the 64-bit length field may carry (its MSB must be 0).
pub const MAX_ENCODABLE_LEN: u64 = i64::MAX as u64;

/// WebSocket operation codes handled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Text frame.
    Text,
    /// Close frame.
    Close,
    /// Ping frame.
    Ping,
    /// Pong frame.
    Pong,
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(Self::Text),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WebSocketError::UnsupportedOpcode(other)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Text => 0x1,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// WebSocket close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure.
    Normal,
    /// Endpoint going away.
    GoingAway,
    /// Protocol error.
    Protocol,
    /// Unsupported data type.
    Unsupported,
    /// Outbound frame too large to encode.
    FrameTooLarge,
    /// No status received.
    NoStatus,
    /// Abnormal closure.
    Abnormal,
    /// Invalid frame payload data.
    InvalidData,
    /// Policy violation.
    PolicyViolation,
    /// Any other code.
    Custom(u16),
}

impl CloseCode {
    /// Reason sent when the caller does not supply one.
    pub fn default_reason(&self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "going away",
            Self::Protocol => "protocol error",
            Self::Unsupported => "unknown data (opcode)",
            Self::FrameTooLarge => "frame too large",
            Self::InvalidData => "utf8 expected",
            Self::PolicyViolation => "message violates server policy",
            Self::NoStatus | Self::Abnormal | Self::Custom(_) => "",
        }
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1004 => Self::FrameTooLarge,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InvalidData,
            1008 => Self::PolicyViolation,
            code => Self::Custom(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> Self {
        match value {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::FrameTooLarge => 1004,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::Custom(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text data.
    Text(Bytes),
    /// Close request; payload is `code (2 bytes, BE) + reason`, or empty.
    Close(Bytes),
    /// Ping.
    Ping(Bytes),
    /// Pong.
    Pong(Bytes),
}

impl Frame {
    /// The opcode of this frame.
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::Text(_) => OpCode::Text,
            Self::Close(_) => OpCode::Close,
            Self::Ping(_) => OpCode::Ping,
            Self::Pong(_) => OpCode::Pong,
        }
    }

    /// The frame payload.
    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Text(p) | Self::Close(p) | Self::Ping(p) | Self::Pong(p) => p,
        }
    }

    fn new(opcode: OpCode, payload: Bytes) -> Self {
        match opcode {
            OpCode::Text => Self::Text(payload),
            OpCode::Close => Self::Close(payload),
            OpCode::Ping => Self::Ping(payload),
            OpCode::Pong => Self::Pong(payload),
        }
    }
}

/// A frame together with how it arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// The frame.
    pub frame: Frame,
    /// Whether the sender masked the payload.
    pub masked: bool,
    /// Bytes the frame occupied in the input.
    pub len: usize,
}

/// Encode `payload` as a single final frame.
///
/// Clients pass `masked = true`; servers never mask.
///
/// # Errors
///
/// Returns [`WebSocketError::FrameTooLarge`] when the payload length does not
/// fit in 63 bits.
pub fn encode(payload: &[u8], opcode: OpCode, masked: bool) -> WebSocketResult<Bytes> {
    let len = payload.len() as u64;
    if len > MAX_ENCODABLE_LEN {
        return Err(WebSocketError::FrameTooLarge {
            size: len,
            max: MAX_ENCODABLE_LEN,
        });
    }

    let mask_bit = if masked { MASK } else { 0 };
    let mut out = BytesMut::with_capacity(payload.len() + 14);
    out.put_u8(FIN | u8::from(opcode));

    if len > 65535 {
        out.put_u8(mask_bit | 127);
        out.put_u64(len);
    } else if len > 125 {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | len as u8);
    }

    if masked {
        let key: [u8; 4] = rand::random();
        out.put_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    } else {
        out.put_slice(payload);
    }

    Ok(out.freeze())
}

/// Decode one frame from a buffer that is expected to hold all of it.
///
/// # Errors
///
/// Returns [`WebSocketError::Truncated`] if the buffer ends early and
/// [`WebSocketError::UnsupportedOpcode`] for opcodes outside text, close,
/// ping and pong.
pub fn decode(raw: &[u8]) -> WebSocketResult<Decoded> {
    match parse(raw, MAX_ENCODABLE_LEN)? {
        Parsed::Complete(decoded) => Ok(decoded),
        Parsed::Incomplete { needed } => Err(WebSocketError::Truncated {
            needed,
            available: raw.len(),
        }),
    }
}

/// Incremental decoder over a connection's read buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_payload: u64,
}

impl FrameDecoder {
    /// Create a decoder that rejects payloads above `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload as u64,
        }
    }

    /// Take the next complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until the declared
    /// frame length is available.
    pub fn decode(&self, buf: &mut BytesMut) -> WebSocketResult<Option<Decoded>> {
        match parse(&buf[..], self.max_payload)? {
            Parsed::Complete(decoded) => {
                buf.advance(decoded.len);
                Ok(Some(decoded))
            },
            Parsed::Incomplete { .. } => Ok(None),
        }
    }
}

enum Parsed {
    Complete(Decoded),
    Incomplete { needed: usize },
}

fn parse(raw: &[u8], max_payload: u64) -> WebSocketResult<Parsed> {
    if raw.len() < 2 {
        return Ok(Parsed::Incomplete { needed: 2 });
    }

    let opcode = OpCode::try_from(raw[0] & 0x0F)?;
    let masked = raw[1] & MASK != 0;

    let (payload_len, mut offset) = match raw[1] & 0x7F {
        126 => {
            if raw.len() < 4 {
                return Ok(Parsed::Incomplete { needed: 4 });
            }
            (u64::from(u16::from_be_bytes([raw[2], raw[3]])), 4)
        },
        127 => {
            if raw.len() < 10 {
                return Ok(Parsed::Incomplete { needed: 10 });
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&raw[2..10]);
            (u64::from_be_bytes(len), 10)
        },
        n => (u64::from(n), 2),
    };

    if payload_len > max_payload {
        return Err(WebSocketError::FrameTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let mask_key = if masked {
        if raw.len() < offset + 4 {
            return Ok(Parsed::Incomplete { needed: offset + 4 });
        }
        let key = [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = usize::try_from(payload_len).map_err(|_| WebSocketError::FrameTooLarge {
        size: payload_len,
        max: usize::MAX as u64,
    })?;
    let end = offset
        .checked_add(payload_len)
        .ok_or(WebSocketError::FrameTooLarge {
            size: payload_len as u64,
            max: max_payload,
        })?;
    if raw.len() < end {
        return Ok(Parsed::Incomplete { needed: end });
    }

    let data = &raw[offset..end];
    let payload: Bytes = match mask_key {
        Some(key) => data
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect::<Vec<u8>>()
            .into(),
        None => Bytes::copy_from_slice(data),
    };

    Ok(Parsed::Complete(Decoded {
        frame: Frame::new(opcode, payload),
        masked,
        len: end,
    }))
}

/// Build a close frame payload: the status code followed by the reason.
pub fn close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&u16::from(code).to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Split a close frame payload into its status code and reason.
///
/// Payloads shorter than two bytes carry no status; normal closure is
/// assumed and the reason is empty.
pub fn parse_close_payload(payload: &[u8]) -> (CloseCode, String) {
    if payload.len() < 2 {
        return (CloseCode::Normal, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (CloseCode::from(code), reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(OpCode::try_from(1).unwrap(), OpCode::Text);
        assert_eq!(OpCode::try_from(8).unwrap(), OpCode::Close);
        assert_eq!(OpCode::try_from(9).unwrap(), OpCode::Ping);
        assert_eq!(OpCode::try_from(10).unwrap(), OpCode::Pong);
        assert!(matches!(
            OpCode::try_from(2),
            Err(WebSocketError::UnsupportedOpcode(2))
        ));
        assert!(matches!(
            OpCode::try_from(0),
            Err(WebSocketError::UnsupportedOpcode(0))
        ));
        assert_eq!(u8::from(OpCode::Pong), 10);
    }

    #[test]
    fn test_close_code_conversion() {
        assert_eq!(CloseCode::from(1000), CloseCode::Normal);
        assert_eq!(CloseCode::from(1004), CloseCode::FrameTooLarge);
        assert_eq!(CloseCode::from(4000), CloseCode::Custom(4000));
        assert_eq!(u16::from(CloseCode::GoingAway), 1001);
        assert_eq!(u16::from(CloseCode::Protocol), 1002);
        assert_eq!(CloseCode::Unsupported.to_string(), "1003");
    }

    #[test]
    fn test_default_reasons() {
        assert_eq!(CloseCode::Normal.default_reason(), "normal closure");
        assert_eq!(CloseCode::FrameTooLarge.default_reason(), "frame too large");
        assert_eq!(CloseCode::Custom(4001).default_reason(), "");
    }

    #[test]
    fn test_header_bytes() {
        let frame = encode(b"hi", OpCode::Text, false).unwrap();
        assert_eq!(&frame[..], &[0x81, 0x02, b'h', b'i']);

        let frame = encode(&[0u8; 126], OpCode::Ping, false).unwrap();
        assert_eq!(&frame[..4], &[0x89, 126, 0x00, 126]);

        let frame = encode(&[0u8; 65536], OpCode::Text, true).unwrap();
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 0xFF);
        assert_eq!(&frame[2..10], &65536u64.to_be_bytes());
        assert_eq!(frame.len(), 2 + 8 + 4 + 65536);
    }

    #[test]
    fn test_masked_payload_offsets() {
        for (len, offset) in [(10usize, 6usize), (126, 8), (65536, 14)] {
            let frame = encode(&vec![7u8; len], OpCode::Text, true).unwrap();
            let key = &frame[offset - 4..offset];
            assert_eq!(frame[offset] ^ key[0], 7);
            assert_eq!(frame.len(), offset + len);
        }
    }

    #[test]
    fn test_round_trip() {
        let lengths = [0usize, 10, 125, 126, 1000, 65535, 65536];
        let opcodes = [OpCode::Text, OpCode::Ping, OpCode::Pong, OpCode::Close];

        for len in lengths {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for opcode in opcodes {
                for masked in [true, false] {
                    let raw = encode(&payload, opcode, masked).unwrap();
                    let decoded = decode(&raw).unwrap();
                    assert_eq!(decoded.frame.opcode(), opcode);
                    assert_eq!(decoded.frame.payload().as_ref(), payload.as_slice());
                    assert_eq!(decoded.masked, masked);
                    assert_eq!(decoded.len, raw.len());
                }
            }
        }
    }

    #[test]
    fn test_decode_unsupported_opcode() {
        // Binary frame.
        let raw = [0x82, 0x80, 0, 0, 0, 0];
        assert!(matches!(
            decode(&raw),
            Err(WebSocketError::UnsupportedOpcode(2))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let raw = encode(b"hello world", OpCode::Text, true).unwrap();
        let err = decode(&raw[..raw.len() - 3]).unwrap_err();
        assert!(matches!(
            err,
            WebSocketError::Truncated { needed, available } if needed == raw.len() && available == raw.len() - 3
        ));
        assert!(matches!(decode(&raw[..1]), Err(WebSocketError::Truncated { .. })));
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let decoder = FrameDecoder::new(1 << 20);
        let raw = encode(&[b'x'; 300], OpCode::Text, true).unwrap();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&raw[..3]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&raw[3..100]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 100);

        buf.extend_from_slice(&raw[100..]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame.payload().len(), 300);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_splits_back_to_back_frames() {
        let decoder = FrameDecoder::new(1 << 20);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(b"one", OpCode::Text, true).unwrap());
        buf.extend_from_slice(&encode(b"", OpCode::Ping, true).unwrap());

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.frame, Frame::Text(Bytes::from_static(b"one")));
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.frame, Frame::Ping(Bytes::new()));
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decoder_rejects_oversized_declaration() {
        let decoder = FrameDecoder::new(100);
        let raw = encode(&[0u8; 200], OpCode::Text, true).unwrap();
        let mut buf = BytesMut::from(&raw[..4]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::FrameTooLarge { size: 200, max: 100 })
        ));
    }

    #[test]
    fn test_unmasked_frame_is_flagged() {
        let raw = encode(b"plain", OpCode::Text, false).unwrap();
        let decoded = decode(&raw).unwrap();
        assert!(!decoded.masked);
        assert_eq!(decoded.frame.payload().as_ref(), b"plain");
    }

    #[test]
    fn test_close_payload() {
        let payload = close_payload(CloseCode::Normal, "bye");
        assert_eq!(payload, vec![0x03, 0xE8, b'b', b'y', b'e']);

        let (code, reason) = parse_close_payload(&payload);
        assert_eq!(code, CloseCode::Normal);
        assert_eq!(reason, "bye");

        let (code, reason) = parse_close_payload(&[0x03]);
        assert_eq!(code, CloseCode::Normal);
        assert!(reason.is_empty());

        let (code, _) = parse_close_payload(&4001u16.to_be_bytes());
        assert_eq!(code, CloseCode::Custom(4001));
    }
}
