//! Per-connection message state machine.
//!
//! ```text
//! Idle       + text(fin)          -> deliver, Idle
//! Idle       + text(!fin)         -> Fragmented(buffer)
//! Fragmented + continuation(!fin) -> append, Fragmented
//! Fragmented + continuation(fin)  -> append, deliver, Idle
//! any        + close              -> reply close, Closed
//! ```
//!
//! Ping is answered with a pong carrying the same payload in every open state
//! and pong is ignored. Any violation moves the machine to `Closed` and drops
//! the partial message.

use bytes::{Bytes, BytesMut};

use crate::errors::ProtocolError;
use crate::frame::{Frame, OpCode, close_code};

/// What the connection driver must do after a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Hand a complete message to the session callbacks.
    Deliver(String),
    /// Write a control frame, keep reading.
    Reply(Frame),
    /// Write this close frame and stop reading.
    Close(Frame),
    /// Nothing to do.
    Continue,
}

#[derive(Debug)]
enum State {
    Idle,
    Fragmented(BytesMut),
    Closed,
}

/// Turns a frame stream into whole text messages.
#[derive(Debug)]
pub struct FrameAssembler {
    state: State,
    max_message_size: usize,
}

impl FrameAssembler {
    /// New assembler accepting messages of at most `max_message_size` bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: State::Idle,
            max_message_size,
        }
    }

    /// Whether a close frame was seen or a violation occurred.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Whether a fragmented message is being collected.
    pub fn in_message(&self) -> bool {
        matches!(self.state, State::Fragmented(_))
    }

    /// Bytes buffered for the message in progress.
    pub fn buffered(&self) -> usize {
        match &self.state {
            State::Fragmented(buf) => buf.len(),
            _ => 0,
        }
    }

    /// Feed one frame.
    pub fn push(&mut self, frame: Frame) -> Result<Action, ProtocolError> {
        let result = self.step(frame);
        if result.is_err() {
            self.state = State::Closed;
        }
        result
    }

    fn step(&mut self, frame: Frame) -> Result<Action, ProtocolError> {
        if self.is_closed() {
            return Ok(Action::Continue);
        }
        match frame.opcode {
            OpCode::Ping => Ok(Action::Reply(Frame::pong(frame.payload))),
            OpCode::Pong => Ok(Action::Continue),
            OpCode::Close => {
                self.state = State::Closed;
                check_close_payload(&frame.payload)?;
                let reply = match frame.close_code() {
                    Some(code) => Frame::close(code, ""),
                    None => Frame::empty_close(),
                };
                Ok(Action::Close(reply))
            }
            OpCode::Binary => Err(ProtocolError::UnsupportedFrame),
            OpCode::Reserved(bits) => Err(ProtocolError::ReservedOpcode(bits)),
            OpCode::Text => self.start_message(frame),
            OpCode::Continuation => self.continue_message(frame),
        }
    }

    fn start_message(&mut self, frame: Frame) -> Result<Action, ProtocolError> {
        if self.in_message() {
            return Err(ProtocolError::UnfinishedMessage);
        }
        self.check_size(frame.payload.len())?;
        if frame.fin {
            return decode_text(frame.payload).map(Action::Deliver);
        }
        self.state = State::Fragmented(BytesMut::from(&frame.payload[..]));
        Ok(Action::Continue)
    }

    fn continue_message(&mut self, frame: Frame) -> Result<Action, ProtocolError> {
        let buffered = match &self.state {
            State::Fragmented(buf) => buf.len(),
            _ => return Err(ProtocolError::UnexpectedContinuation),
        };
        self.check_size(buffered + frame.payload.len())?;

        if let State::Fragmented(buf) = &mut self.state {
            buf.extend_from_slice(&frame.payload);
        }
        if !frame.fin {
            return Ok(Action::Continue);
        }
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Fragmented(buf) => decode_text(buf.freeze()).map(Action::Deliver),
            _ => Err(ProtocolError::UnexpectedContinuation),
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: size as u64,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

/// A close payload is empty, or a sendable code followed by a UTF-8 reason.
fn check_close_payload(payload: &[u8]) -> Result<(), ProtocolError> {
    match payload {
        [] => Ok(()),
        [_] => Err(ProtocolError::TruncatedClose),
        [hi, lo, reason @ ..] => {
            let code = u16::from_be_bytes([*hi, *lo]);
            if !close_code::is_sendable(code) {
                return Err(ProtocolError::InvalidCloseCode(code));
            }
            if std::str::from_utf8(reason).is_err() {
                return Err(ProtocolError::InvalidUtf8);
            }
            Ok(())
        }
    }
}

fn decode_text(payload: Bytes) -> Result<String, ProtocolError> {
    String::from_utf8(Vec::from(payload)).map_err(|_| ProtocolError::InvalidUtf8)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(text: &'static str, fin: bool) -> Frame {
        Frame::new(fin, OpCode::Continuation, text)
    }

    #[test]
    fn single_text_frame_is_delivered() {
        let mut asm = FrameAssembler::new(100);
        assert_eq!(
            asm.push(Frame::text("hi")).unwrap(),
            Action::Deliver("hi".into())
        );
        assert!(!asm.in_message());
    }

    #[test]
    fn fragments_are_joined() {
        let mut asm = FrameAssembler::new(100);
        let first = Frame::new(false, OpCode::Text, "Hello, ");
        assert_eq!(asm.push(first).unwrap(), Action::Continue);
        assert!(asm.in_message());
        assert_eq!(asm.buffered(), 7);
        assert_eq!(
            asm.push(fragment("World!", true)).unwrap(),
            Action::Deliver("Hello, World!".into())
        );
        assert!(!asm.in_message());
    }

    #[test]
    fn ping_gets_pong_in_both_states() {
        let mut asm = FrameAssembler::new(100);
        assert_eq!(
            asm.push(Frame::ping("p1")).unwrap(),
            Action::Reply(Frame::pong("p1"))
        );
        let _ = asm.push(Frame::new(false, OpCode::Text, "a")).unwrap();
        assert_eq!(
            asm.push(Frame::ping("p2")).unwrap(),
            Action::Reply(Frame::pong("p2"))
        );
        // Control frames in the middle do not disturb the message
        assert_eq!(
            asm.push(fragment("b", true)).unwrap(),
            Action::Deliver("ab".into())
        );
    }

    #[test]
    fn pong_is_ignored() {
        let mut asm = FrameAssembler::new(100);
        assert_eq!(asm.push(Frame::pong("x")).unwrap(), Action::Continue);
    }

    #[test]
    fn oversized_fragments_fail_and_discard() {
        let mut asm = FrameAssembler::new(10);
        let _ = asm.push(Frame::new(false, OpCode::Text, "123456")).unwrap();
        let err = asm.push(fragment("78901", false)).unwrap_err();
        assert_eq!(err.close_code(), Some(close_code::MESSAGE_TOO_BIG));
        assert!(asm.is_closed());
        assert_eq!(asm.buffered(), 0);
        // Nothing is delivered after the violation
        assert_eq!(asm.push(fragment("x", true)).unwrap(), Action::Continue);
    }

    #[test]
    fn oversized_single_frame_fails() {
        let mut asm = FrameAssembler::new(4);
        let err = asm.push(Frame::text("hello")).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { size: 5, limit: 4 }));
    }

    #[test]
    fn message_at_exact_limit_is_accepted() {
        let mut asm = FrameAssembler::new(5);
        let _ = asm.push(Frame::new(false, OpCode::Text, "hel")).unwrap();
        assert_eq!(
            asm.push(fragment("lo", true)).unwrap(),
            Action::Deliver("hello".into())
        );
    }

    #[test]
    fn close_is_echoed_and_terminal() {
        let mut asm = FrameAssembler::new(100);
        let action = asm.push(Frame::close(close_code::NORMAL, "bye")).unwrap();
        let Action::Close(reply) = action else {
            panic!("expected close reply, got {action:?}");
        };
        assert_eq!(reply.close_code(), Some(close_code::NORMAL));
        assert!(asm.is_closed());
        assert_eq!(asm.push(Frame::text("late")).unwrap(), Action::Continue);
        assert_eq!(asm.push(Frame::ping("late")).unwrap(), Action::Continue);
    }

    #[test]
    fn close_without_code_gets_empty_close() {
        let mut asm = FrameAssembler::new(100);
        assert_eq!(
            asm.push(Frame::empty_close()).unwrap(),
            Action::Close(Frame::empty_close())
        );
    }

    #[test]
    fn application_close_codes_are_echoed() {
        for code in [3000, 4999, close_code::POLICY_VIOLATION] {
            let mut asm = FrameAssembler::new(100);
            assert_eq!(
                asm.push(Frame::close(code, "done")).unwrap(),
                Action::Close(Frame::close(code, ""))
            );
        }
    }

    #[test]
    fn reserved_or_unassigned_close_codes_are_rejected() {
        for code in [999, 1004, 1005, 1006, 1015, 2000, 5000] {
            let mut asm = FrameAssembler::new(100);
            let err = asm.push(Frame::close(code, "")).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidCloseCode(c) if c == code));
            assert_eq!(err.close_code(), Some(close_code::PROTOCOL_ERROR));
            assert!(asm.is_closed());
        }
    }

    #[test]
    fn one_byte_close_payload_is_rejected() {
        let mut asm = FrameAssembler::new(100);
        let err = asm
            .push(Frame::new(true, OpCode::Close, &b"\x03"[..]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedClose));
        assert_eq!(err.close_code(), Some(close_code::PROTOCOL_ERROR));
    }

    #[test]
    fn close_reason_must_be_utf8() {
        let mut asm = FrameAssembler::new(100);
        let err = asm
            .push(Frame::new(true, OpCode::Close, &b"\x03\xe8\xff\xfe"[..]))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(close_code::INVALID_PAYLOAD));
    }

    #[test]
    fn close_during_fragmented_message_drops_it() {
        let mut asm = FrameAssembler::new(100);
        let _ = asm.push(Frame::new(false, OpCode::Text, "part")).unwrap();
        assert!(matches!(
            asm.push(Frame::close(close_code::NORMAL, "")).unwrap(),
            Action::Close(_)
        ));
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn binary_is_unsupported() {
        let mut asm = FrameAssembler::new(100);
        let err = asm.push(Frame::new(true, OpCode::Binary, &b"\x00"[..])).unwrap_err();
        assert_eq!(err.close_code(), Some(close_code::UNSUPPORTED_DATA));
    }

    #[test]
    fn reserved_opcode_is_protocol_error() {
        let mut asm = FrameAssembler::new(100);
        let err = asm.push(Frame::new(true, OpCode::Reserved(0x3), "")).unwrap_err();
        assert_eq!(err.close_code(), Some(close_code::PROTOCOL_ERROR));
    }

    #[test]
    fn continuation_without_message_fails() {
        let mut asm = FrameAssembler::new(100);
        assert!(matches!(
            asm.push(fragment("x", true)),
            Err(ProtocolError::UnexpectedContinuation)
        ));
    }

    #[test]
    fn new_text_during_fragmented_message_fails() {
        let mut asm = FrameAssembler::new(100);
        let _ = asm.push(Frame::new(false, OpCode::Text, "a")).unwrap();
        assert!(matches!(
            asm.push(Frame::text("b")),
            Err(ProtocolError::UnfinishedMessage)
        ));
    }

    #[test]
    fn invalid_utf8_fails() {
        let mut asm = FrameAssembler::new(100);
        let err = asm
            .push(Frame::new(true, OpCode::Text, &b"\xff\xfe"[..]))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(close_code::INVALID_PAYLOAD));
    }

    #[test]
    fn utf8_split_across_fragments_is_accepted() {
        let mut asm = FrameAssembler::new(100);
        let bytes = "é".as_bytes();
        let _ = asm
            .push(Frame::new(false, OpCode::Text, Bytes::copy_from_slice(&bytes[..1])))
            .unwrap();
        assert_eq!(
            asm.push(Frame::new(true, OpCode::Continuation, Bytes::copy_from_slice(&bytes[1..])))
                .unwrap(),
            Action::Deliver("é".into())
        );
    }
}
