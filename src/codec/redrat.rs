// MIT License - Copyright (c) 2021 TJForc

//! RedRat IR blaster framing.
//!
//! ```text
//! host   -> device   [P#50]\r
//! device -> host     [A#41]\r\n>
//! ```
//!
//! The checksum is the byte-sum of the command and payload bytes, sent as
//! two hex digits. Inbound bytes are decoded one at a time by
//! [`RedRatDecoder`]; every state either advances on a byte or rejects it.

use crate::codec::{hex_pair, hex_value, sum_checksum};
use crate::constants::{CR, LF, REDRAT_CLOSE, REDRAT_DIVIDER, REDRAT_OPEN, REDRAT_PROMPT};
use crate::error::{LinkError, Result};
use crate::message::{MessageKind, RawMessage};

/// Command codes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedRatCommand {
    /// `V`: firmware version query and reply
    Version,
    /// `P`: keep-alive
    Ping,
    /// `A`: command accepted
    Ack,
    /// `E`: command rejected, payload is the decimal code
    Error,
    /// `B`: blast the IR signal in the payload
    Blast,
    /// `L`: start learning
    Learn,
    /// `C`: cancel learning
    CancelLearn,
    /// `D`: learned signal data, sent unsolicited
    LearnedData,
}

impl RedRatCommand {
    pub fn code(&self) -> u8 {
        match self {
            Self::Version => b'V',
            Self::Ping => b'P',
            Self::Ack => b'A',
            Self::Error => b'E',
            Self::Blast => b'B',
            Self::Learn => b'L',
            Self::CancelLearn => b'C',
            Self::LearnedData => b'D',
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'V' => Self::Version,
            b'P' => Self::Ping,
            b'A' => Self::Ack,
            b'E' => Self::Error,
            b'B' => Self::Blast,
            b'L' => Self::Learn,
            b'C' => Self::CancelLearn,
            b'D' => Self::LearnedData,
            _ => return None,
        })
    }
}

/// One decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedRatFrame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl RedRatFrame {
    pub fn new(command: RedRatCommand, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command: command.code(),
            payload: payload.into(),
        }
    }

    pub fn bare(command: RedRatCommand) -> Self {
        Self::new(command, Vec::new())
    }

    pub fn kind(&self) -> Option<RedRatCommand> {
        RedRatCommand::from_code(self.command)
    }

    pub fn checksum(&self) -> u8 {
        sum_checksum(&self.payload).wrapping_add(self.command)
    }

    fn encode_core(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 8);
        out.push(REDRAT_OPEN);
        out.push(self.command);
        out.extend_from_slice(&self.payload);
        out.push(REDRAT_DIVIDER);
        out.extend_from_slice(&hex_pair(self.checksum()));
        out.push(REDRAT_CLOSE);
        out.push(CR);
        out
    }

    /// Host to device: `[cmd payload #HH]CR`
    pub fn encode_host(&self) -> Vec<u8> {
        self.encode_core()
    }

    /// Device to host: `[cmd payload #HH]CR LF >`
    pub fn encode_device(&self) -> Vec<u8> {
        let mut out = self.encode_core();
        out.push(LF);
        out.push(REDRAT_PROMPT);
        out
    }

    /// Translate into the shape the wait engine matches on. Data frames
    /// become reports whose command class is the command code.
    pub fn to_message(&self) -> Result<RawMessage> {
        match self.kind() {
            Some(RedRatCommand::Ack) => Ok(RawMessage::new(MessageKind::Ack)),
            Some(RedRatCommand::Error) => {
                let text = std::str::from_utf8(&self.payload)
                    .map_err(|_| LinkError::format("error code is not ASCII"))?;
                let code = text
                    .trim()
                    .parse()
                    .map_err(|_| LinkError::format(format!("bad error code {:?}", text)))?;
                Ok(RawMessage::with_status(MessageKind::Nak, code))
            }
            _ => {
                let mut values = Vec::with_capacity(self.payload.len() + 1);
                values.push(self.command);
                values.extend_from_slice(&self.payload);
                Ok(RawMessage::report(0, 0, values))
            }
        }
    }
}

/// Decoder position. Each state names the element most recently accepted,
/// except the checksum and trailer states which name the element expected next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeState {
    Waiting,
    OpenBracket,
    Command,
    Data,
    CheckSum1,
    CheckSum2,
    CloseBracket,
    Cr,
    Lf,
    Prompt,
    Complete,
}

impl DecodeState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::OpenBracket => "OpenBracket",
            Self::Command => "Command",
            Self::Data => "Data",
            Self::CheckSum1 => "CheckSum1",
            Self::CheckSum2 => "CheckSum2",
            Self::CloseBracket => "CloseBracket",
            Self::Cr => "Cr",
            Self::Lf => "Lf",
            Self::Prompt => "Prompt",
            Self::Complete => "Complete",
        }
    }
}

/// Which trailer the decoder expects after the closing bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frames written by the device, ending `CR LF >`.
    FromDevice,
    /// Frames written by the host, ending `CR`.
    FromHost,
}

/// Byte-at-a-time frame decoder.
#[derive(Debug, Clone)]
pub struct RedRatDecoder {
    direction: Direction,
    state: DecodeState,
    command: u8,
    payload: Vec<u8>,
    running: u8,
    received: u8,
    bad_messages: u64,
}

impl RedRatDecoder {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: DecodeState::Waiting,
            command: 0,
            payload: Vec::new(),
            running: 0,
            received: 0,
            bad_messages: 0,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// A frame has started but not finished.
    pub fn in_frame(&self) -> bool {
        self.state != DecodeState::Waiting
    }

    pub fn bad_messages(&self) -> u64 {
        self.bad_messages
    }

    /// Abandon any partial frame.
    pub fn reset(&mut self) {
        self.state = DecodeState::Waiting;
        self.command = 0;
        self.payload.clear();
        self.running = 0;
        self.received = 0;
    }

    fn reject(&mut self, byte: u8) -> LinkError {
        let state = self.state.name();
        self.bad_messages += 1;
        self.reset();
        LinkError::BadByte { state, byte }
    }

    /// Feed one byte. Returns a frame when the last byte of one arrives.
    /// On any error the partial frame is dropped and decoding restarts at
    /// `Waiting`.
    pub fn feed(&mut self, byte: u8) -> Result<Option<RedRatFrame>> {
        use DecodeState::*;

        self.state = match (self.state, byte) {
            (Waiting, REDRAT_OPEN) => OpenBracket,
            (Waiting, CR | LF | b' ' | REDRAT_PROMPT) => Waiting,
            (OpenBracket, b) if b.is_ascii_alphanumeric() => {
                self.command = b;
                self.running = b;
                Command
            }
            (Command | Data, REDRAT_DIVIDER) => CheckSum1,
            (Command | Data, b) if b < 0x80 => {
                self.payload.push(b);
                self.running = self.running.wrapping_add(b);
                Data
            }
            (CheckSum1, b) => match hex_value(b) {
                Some(v) => {
                    self.received = v << 4;
                    CheckSum2
                }
                None => return Err(self.reject(byte)),
            },
            (CheckSum2, b) => match hex_value(b) {
                Some(v) => {
                    self.received |= v;
                    CloseBracket
                }
                None => return Err(self.reject(byte)),
            },
            (CloseBracket, REDRAT_CLOSE) => Cr,
            (Cr, CR) if self.direction == Direction::FromHost => Complete,
            (Cr, CR) => Lf,
            (Lf, LF) => Prompt,
            (Prompt, REDRAT_PROMPT) => Complete,
            _ => return Err(self.reject(byte)),
        };

        if self.state != Complete {
            return Ok(None);
        }

        let computed = self.running;
        let received = self.received;
        let frame = RedRatFrame {
            command: self.command,
            payload: std::mem::take(&mut self.payload),
        };
        self.reset();
        if computed != received {
            self.bad_messages += 1;
            return Err(LinkError::ChecksumMismatch { computed, received });
        }
        Ok(Some(frame))
    }

    /// Feed a whole buffer, collecting frames and errors in arrival order.
    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<Result<RedRatFrame>> {
        bytes
            .iter()
            .filter_map(|b| self.feed(*b).transpose())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Result<RedRatFrame> {
        let mut decoder = RedRatDecoder::new(Direction::FromDevice);
        let mut out = decoder.feed_all(bytes);
        assert_eq!(out.len(), 1, "expected exactly one outcome");
        out.remove(0)
    }

    #[test]
    fn test_encode_layout() {
        assert_eq!(RedRatFrame::bare(RedRatCommand::Ping).encode_host(), b"[P#50]\r");
        assert_eq!(RedRatFrame::bare(RedRatCommand::Ack).encode_device(), b"[A#41]\r\n>");
        let blast = RedRatFrame::new(RedRatCommand::Blast, b"12".to_vec());
        // 'B' + '1' + '2' = 0x42 + 0x31 + 0x32 = 0xA5
        assert_eq!(blast.encode_host(), b"[B12#A5]\r");
    }

    #[test]
    fn test_decode_device_frame() {
        let frame = decode_one(b"\r\n>[V2.31#1A]\r\n>").unwrap();
        assert_eq!(frame.kind(), Some(RedRatCommand::Version));
        assert_eq!(frame.payload, b"2.31");
    }

    #[test]
    fn test_host_direction() {
        let mut decoder = RedRatDecoder::new(Direction::FromHost);
        let frames = decoder.feed_all(b"[P#50]\r[C#43]\r");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].as_ref().unwrap().kind(), Some(RedRatCommand::CancelLearn));
    }

    #[test]
    fn test_accepted_frames_verify_checksum() {
        let frames = [
            RedRatFrame::bare(RedRatCommand::Ack),
            RedRatFrame::new(RedRatCommand::Version, b"1.07".to_vec()),
            RedRatFrame::new(RedRatCommand::LearnedData, b"0A1B2C3D4E5F".to_vec()),
            RedRatFrame::new(RedRatCommand::Error, b"4".to_vec()),
        ];
        for frame in frames {
            let decoded = decode_one(&frame.encode_device()).unwrap();
            assert_eq!(decoded.checksum(), frame.checksum());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_single_bit_corruption_rejected() {
        let frame = RedRatFrame::new(RedRatCommand::Blast, b"0123456789ABCDEF".to_vec());
        let wire = frame.encode_device();
        // Payload region: command byte through the byte before '#'
        let end = wire.iter().position(|&b| b == REDRAT_DIVIDER).unwrap();
        for index in 1..end {
            for bit in 0..8 {
                let mut corrupt = wire.clone();
                corrupt[index] ^= 1 << bit;
                let mut decoder = RedRatDecoder::new(Direction::FromDevice);
                let results = decoder.feed_all(&corrupt);
                assert!(
                    results.iter().all(|r| r.is_err()),
                    "corruption at {} bit {} accepted",
                    index,
                    bit
                );
                assert!(decoder.bad_messages() >= 1);
            }
        }
    }

    #[test]
    fn test_checksum_mismatch_reported() {
        let mut decoder = RedRatDecoder::new(Direction::FromDevice);
        let results = decoder.feed_all(b"[A#42]\r\n>");
        assert!(matches!(
            results.as_slice(),
            [Err(LinkError::ChecksumMismatch {
                computed: 0x41,
                received: 0x42
            })]
        ));
        assert_eq!(decoder.bad_messages(), 1);
        assert_eq!(decoder.state(), DecodeState::Waiting);
    }

    #[test]
    fn test_state_machine_totality() {
        // Prefixes that leave the decoder in each non-terminal state
        let prefixes: [(&[u8], DecodeState); 10] = [
            (b"", DecodeState::Waiting),
            (b"[", DecodeState::OpenBracket),
            (b"[V", DecodeState::Command),
            (b"[V1", DecodeState::Data),
            (b"[V1#", DecodeState::CheckSum1),
            (b"[V1#8", DecodeState::CheckSum2),
            (b"[V1#87", DecodeState::CloseBracket),
            (b"[V1#87]", DecodeState::Cr),
            (b"[V1#87]\r", DecodeState::Lf),
            (b"[V1#87]\r\n", DecodeState::Prompt),
        ];
        for (prefix, state) in prefixes {
            let mut base = RedRatDecoder::new(Direction::FromDevice);
            assert!(base.feed_all(prefix).is_empty());
            assert_eq!(base.state(), state);

            for byte in 0..=255u8 {
                let mut decoder = base.clone();
                match decoder.feed(byte) {
                    Ok(Some(_)) => assert_eq!(decoder.state(), DecodeState::Waiting),
                    Ok(None) => assert!(decoder.state() != DecodeState::Complete),
                    Err(LinkError::BadByte { state: name, byte: b }) => {
                        assert_eq!(name, state.name());
                        assert_eq!(b, byte);
                        assert_eq!(decoder.state(), DecodeState::Waiting);
                        assert_eq!(decoder.bad_messages(), 1);
                    }
                    Err(LinkError::ChecksumMismatch { .. }) => {
                        assert_eq!(state, DecodeState::Prompt);
                    }
                    Err(other) => panic!("undefined outcome {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_recovers_after_garbage() {
        let mut decoder = RedRatDecoder::new(Direction::FromDevice);
        let results = decoder.feed_all(b"x[A#41]\r\n>");
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().kind(), Some(RedRatCommand::Ack));
    }

    #[test]
    fn test_to_message() {
        let nak = RedRatFrame::new(RedRatCommand::Error, b"4".to_vec())
            .to_message()
            .unwrap();
        assert_eq!((nak.kind, nak.status), (MessageKind::Nak, 4));

        let version = RedRatFrame::new(RedRatCommand::Version, b"2".to_vec())
            .to_message()
            .unwrap();
        assert_eq!(version.kind, MessageKind::GenericReport);
        assert_eq!(version.command_class(), b'V');
        assert_eq!(version.args(), b"");
        assert_eq!(version.command(), b'2');
    }
}
