//! RFC 6455 frame codec.
//!
//! [`FrameCodec`] is a `tokio_util::codec` decoder/encoder for single frames.
//! It enforces the framing rules that do not depend on connection state:
//! masking direction, reserved bits, control frame limits and the maximum
//! payload size. Message-level rules live in [`crate::assembler`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::ProtocolError;

/// Close status codes used by the gateway.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol violation.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Data type the endpoint cannot accept (binary).
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Payload inconsistent with the message type (bad UTF-8).
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Generic policy violation.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big to process.
    pub const MESSAGE_TOO_BIG: u16 = 1009;

    /// Whether a peer may send `code` in a close frame.
    ///
    /// 1004-1006 and 1015 are reserved and never appear on the wire, and
    /// 1016-2999 are unassigned.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest single buffer reservation made for a partially received frame.
const RESERVE_CHUNK: usize = 64 * 1024;

/// Frame opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text.
    Text,
    /// Binary data.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
    /// Any opcode RFC 6455 reserves.
    Reserved(u8),
}

impl OpCode {
    /// Decode the low nibble of the first header byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Wire value.
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(bits) => bits & 0x0F,
        }
    }

    /// Control opcodes have the high bit of the nibble set.
    pub fn is_control(self) -> bool {
        self.bits() & 0x8 != 0
    }
}

/// One frame as it appears on the wire, unmasked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit.
    pub fin: bool,
    /// Opcode.
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// A frame with arbitrary fields.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    /// A complete text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(true, OpCode::Text, text.into())
    }

    /// Ping with `payload`.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, payload)
    }

    /// Pong echoing `payload`.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Close with a status code and a reason, truncated to fit a control frame.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        let room = MAX_CONTROL_PAYLOAD - 2;
        let mut cut = reason.len().min(room);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        payload.put_slice(&reason.as_bytes()[..cut]);
        Self::new(true, OpCode::Close, payload.freeze())
    }

    /// Close without a status code.
    pub fn empty_close() -> Self {
        Self::new(true, OpCode::Close, Bytes::new())
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        match (self.opcode, self.payload.as_ref()) {
            (OpCode::Close, [hi, lo, ..]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

/// Which end of the connection the codec serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Expects masked frames, writes unmasked ones.
    Server,
    /// Expects unmasked frames, writes masked ones.
    Client,
}

/// Decoder/encoder for single WebSocket frames.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    role: Role,
    max_payload: usize,
}

impl FrameCodec {
    /// Server-side codec rejecting payloads above `max_payload`.
    pub fn server(max_payload: usize) -> Self {
        Self {
            role: Role::Server,
            max_payload,
        }
    }

    /// Client-side codec rejecting payloads above `max_payload`.
    pub fn client(max_payload: usize) -> Self {
        Self {
            role: Role::Client,
            max_payload,
        }
    }

    /// Which end this codec serves.
    pub fn role(&self) -> Role {
        self.role
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let first = src[0];
        let second = src[1];

        let fin = first & 0x80 != 0;
        if first & 0x70 != 0 {
            return Err(ProtocolError::ReservedBits);
        }
        let opcode = OpCode::from_bits(first);
        let masked = second & 0x80 != 0;
        match (self.role, masked) {
            (Role::Server, false) => return Err(ProtocolError::UnmaskedFrame),
            (Role::Client, true) => return Err(ProtocolError::MaskedFrame),
            _ => {}
        }

        let short_len = second & 0x7F;
        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControl);
            }
            if usize::from(short_len) > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlTooLarge);
            }
        }

        let (len_bytes, declared): (usize, u64) = match short_len {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (2, u64::from(u16::from_be_bytes([src[2], src[3]])))
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let declared = u64::from_be_bytes(raw);
                if declared > i64::MAX as u64 {
                    return Err(ProtocolError::InvalidLength(declared));
                }
                (8, declared)
            }
            n => (0, u64::from(n)),
        };

        let too_large = ProtocolError::MessageTooLarge {
            size: declared,
            limit: self.max_payload,
        };
        let Some(payload_len) = usize::try_from(declared)
            .ok()
            .filter(|len| *len <= self.max_payload)
        else {
            return Err(too_large);
        };

        let header_len = 2 + len_bytes + if masked { 4 } else { 0 };
        let Some(total) = header_len.checked_add(payload_len) else {
            return Err(too_large);
        };
        if src.len() < total {
            // grow with the bytes actually arriving, not the declared length
            src.reserve((total - src.len()).min(RESERVE_CHUNK));
            return Ok(None);
        }

        src.advance(2 + len_bytes);
        let mask = if masked {
            let mut key = [0u8; 4];
            src.copy_to_slice(&mut key);
            Some(key)
        } else {
            None
        };
        let mut payload = src.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = frame.payload.len();
        let mask_bit = match self.role {
            Role::Server => 0x00,
            Role::Client => 0x80,
        };

        dst.reserve(14 + len);
        let fin_bit: u8 = if frame.fin { 0x80 } else { 0x00 };
        dst.put_u8(fin_bit | frame.opcode.bits());
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if let Ok(len16) = u16::try_from(len) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match self.role {
            Role::Server => dst.put_slice(&frame.payload),
            Role::Client => {
                let key: [u8; 4] = rand::random();
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&frame.payload);
                apply_mask(&mut dst[start..], key);
            }
        }
        Ok(())
    }
}

/// XOR `buf` with the repeating 4-byte masking key.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
