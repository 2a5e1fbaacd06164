// MIT License - Copyright (c) 2021 TJForc

//! VRCOP serial interface framing.
//!
//! Host frames: `>` body `|` HH CR, where HH is the byte-sum of body.
//!
//! ```text
//! >N12SE37,1,255|D8\r     set unit 12, plain, payload [37,1,255]
//! >F|46\r                 query interface unit id
//! >!0|51\r                leave learn mode
//! ```
//!
//! Device lines: `<` prefix body CR. Reports longer than the device's
//! line buffer are split with a trailing `\` and the next line repeats
//! everything up to the first `:`.

use crate::codec::{hex_pair, hex_value, sum_checksum};
use crate::constants::{
    class, cmd, CHANNEL_ENCAP_LEAD, CR, LF, VRCOP_CONTINUATION, VRCOP_DEVICE_START,
    VRCOP_DIVIDER, VRCOP_HOST_START, VRCOP_MAX_LINE,
};
use crate::error::{LinkError, Result};
use crate::message::{MessageKind, MultiType, RawMessage};

/// Payload addressed to one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPayload {
    pub unit: u8,
    /// 0 sends without encapsulation.
    pub instance: u8,
    pub secure: bool,
    pub multi: MultiType,
    /// Command class, command, arguments.
    pub payload: Vec<u8>,
}

/// Everything the host sends to the interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// `F`: ask for the interface's own unit id.
    NodeId,
    /// `!0` / `!1`
    LearnMode(bool),
    /// `N<unit>S<S|E><values>`
    Send(UnitPayload),
}

impl HostCommand {
    pub fn send(unit: u8, payload: Vec<u8>) -> Self {
        HostCommand::Send(UnitPayload {
            unit,
            instance: 0,
            secure: false,
            multi: MultiType::Instance,
            payload,
        })
    }

    /// Target unit, 0 for interface commands.
    pub fn unit(&self) -> u8 {
        match self {
            HostCommand::Send(p) => p.unit,
            _ => 0,
        }
    }

    /// Frame body, the bytes covered by the checksum.
    pub fn body(&self) -> String {
        match self {
            HostCommand::NodeId => "F".to_string(),
            HostCommand::LearnMode(on) => format!("!{}", u8::from(*on)),
            HostCommand::Send(p) => {
                let bytes = encapsulate(p.instance, p.multi, &p.payload);
                format!(
                    "N{}S{}{}",
                    p.unit,
                    if p.secure { 'S' } else { 'E' },
                    join_values(&bytes)
                )
            }
        }
    }

    /// Complete wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        let mut frame = Vec::with_capacity(body.len() + 5);
        frame.push(VRCOP_HOST_START);
        frame.extend_from_slice(body.as_bytes());
        frame.push(VRCOP_DIVIDER);
        frame.extend_from_slice(&hex_pair(sum_checksum(body.as_bytes())));
        frame.push(CR);
        frame
    }

    /// Parse a host frame back into a command. Used by device simulators
    /// and for diagnostics.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let frame = trim_line(frame);
        let Some((&VRCOP_HOST_START, rest)) = frame.split_first() else {
            return Err(LinkError::format("host frame must start with '>'"));
        };
        let divider = rest
            .iter()
            .rposition(|&b| b == VRCOP_DIVIDER)
            .ok_or_else(|| LinkError::format("host frame has no divider"))?;
        let (body, tail) = rest.split_at(divider);
        let received = match tail {
            [_, hi, lo] => match (hex_value(*hi), hex_value(*lo)) {
                (Some(hi), Some(lo)) => (hi << 4) | lo,
                _ => return Err(LinkError::format("checksum is not hex")),
            },
            _ => return Err(LinkError::format("checksum must be two digits")),
        };
        let computed = sum_checksum(body);
        if computed != received {
            return Err(LinkError::ChecksumMismatch { computed, received });
        }

        let body = std::str::from_utf8(body)
            .map_err(|_| LinkError::format("host frame is not ASCII"))?;
        match body.as_bytes().first() {
            Some(b'F') if body.len() == 1 => Ok(HostCommand::NodeId),
            Some(b'!') => match &body[1..] {
                "0" => Ok(HostCommand::LearnMode(false)),
                "1" => Ok(HostCommand::LearnMode(true)),
                other => Err(LinkError::format(format!("bad learn flag {:?}", other))),
            },
            Some(b'N') => parse_send_body(&body[1..]),
            _ => Err(LinkError::format(format!("unknown host body {:?}", body))),
        }
    }
}

fn parse_send_body(text: &str) -> Result<HostCommand> {
    let marker = text
        .find('S')
        .ok_or_else(|| LinkError::format("send body has no 'S' marker"))?;
    let unit = parse_u8(&text[..marker])?;
    let rest = &text[marker + 1..];
    let secure = match rest.as_bytes().first() {
        Some(b'S') => true,
        Some(b'E') => false,
        _ => return Err(LinkError::format("send body needs S or E after unit")),
    };
    let values = parse_values(&rest[1..])?;
    let (instance, multi, payload) = match values.as_slice() {
        [class::MULTI_INSTANCE, cmd::MULTI_INSTANCE_ENCAP, inst, tail @ ..] if *inst > 0 => {
            (*inst, MultiType::Instance, tail.to_vec())
        }
        [class::MULTI_INSTANCE, cmd::MULTI_CHANNEL_ENCAP, CHANNEL_ENCAP_LEAD, inst, tail @ ..]
            if *inst > 0 =>
        {
            (*inst, MultiType::Channel, tail.to_vec())
        }
        _ => (0, MultiType::Instance, values),
    };
    Ok(HostCommand::Send(UnitPayload {
        unit,
        instance,
        secure,
        multi,
        payload,
    }))
}

/// Prepend the encapsulation header when `instance` is non-zero.
pub fn encapsulate(instance: u8, multi: MultiType, payload: &[u8]) -> Vec<u8> {
    if instance == 0 {
        return payload.to_vec();
    }
    let mut out = match multi {
        MultiType::Instance => vec![class::MULTI_INSTANCE, cmd::MULTI_INSTANCE_ENCAP, instance],
        MultiType::Channel => vec![
            class::MULTI_INSTANCE,
            cmd::MULTI_CHANNEL_ENCAP,
            CHANNEL_ENCAP_LEAD,
            instance,
        ],
    };
    out.extend_from_slice(payload);
    out
}

/// Strip an encapsulation header, returning the instance and inner values.
/// Values without a header come back unchanged with instance 0.
pub fn decapsulate(values: Vec<u8>) -> Result<(u8, Vec<u8>)> {
    match values.as_slice() {
        [class::MULTI_INSTANCE, cmd::MULTI_INSTANCE_ENCAP, rest @ ..] => match rest {
            [inst, inner @ ..] => Ok((*inst, inner.to_vec())),
            [] => Err(LinkError::format("truncated instance encapsulation")),
        },
        [class::MULTI_INSTANCE, cmd::MULTI_CHANNEL_ENCAP, rest @ ..] => match rest {
            [_source, inst, inner @ ..] => Ok((*inst, inner.to_vec())),
            _ => Err(LinkError::format("truncated channel encapsulation")),
        },
        _ => Ok((0, values)),
    }
}

/// Line-level decoder. Holds the first half of a continued line between calls.
#[derive(Debug, Default)]
pub struct VrcopDecoder {
    pending: Option<String>,
}

impl VrcopDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A continued line is waiting for its second half.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any half-assembled line.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Feed one raw device line (terminator optional). Returns `None` while
    /// a continuation is outstanding.
    pub fn feed_line(&mut self, line: &[u8]) -> Result<Option<RawMessage>> {
        let line = trim_line(line);
        // Line noise between frames
        if line.is_empty() {
            return Ok(None);
        }
        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(_) => {
                self.pending = None;
                return Err(LinkError::format("device line is not ASCII"));
            }
        };
        let Some(text) = text.strip_prefix(VRCOP_DEVICE_START as char) else {
            self.pending = None;
            return Err(LinkError::format(format!("line without start marker: {:?}", text)));
        };

        let joined = match self.pending.take() {
            Some(head) => join_continuation(&head, text)?,
            None => text.to_string(),
        };

        if let Some(head) = joined.strip_suffix(VRCOP_CONTINUATION as char) {
            if !head.contains(':') {
                return Err(LinkError::Continuation {
                    details: format!("continued line has no prefix: {:?}", head),
                });
            }
            self.pending = Some(head.to_string());
            return Ok(None);
        }

        decode_body(&joined).map(Some)
    }
}

/// Check that `next` repeats the prefix of `head` through the first colon
/// and append the remainder.
fn join_continuation(head: &str, next: &str) -> Result<String> {
    let colon = head.find(':').map(|i| i + 1).unwrap_or(head.len());
    let prefix = &head[..colon];
    match next.strip_prefix(prefix) {
        Some(rest) => Ok(format!("{}{}", head, rest)),
        None => Err(LinkError::Continuation {
            details: format!("expected prefix {:?}, got {:?}", prefix, next),
        }),
    }
}

/// Decode one complete, joined line body (after the `<`).
pub fn decode_body(text: &str) -> Result<RawMessage> {
    let mut chars = text.chars();
    let prefix = chars
        .next()
        .ok_or_else(|| LinkError::format("empty device line"))?;
    let body = chars.as_str();

    match prefix {
        'E' => {
            let status = parse_u16(body)?;
            let kind = if status == 0 {
                MessageKind::Ack
            } else {
                MessageKind::Nak
            };
            Ok(RawMessage::with_status(kind, status))
        }
        'X' => Ok(RawMessage::with_status(
            MessageKind::TransmitAck,
            parse_u16(body)?,
        )),
        'F' => {
            let id = parse_u8(body)?;
            Ok(RawMessage {
                unit_id: id,
                ..RawMessage::with_status(MessageKind::UnitId, u16::from(id))
            })
        }
        '!' => Ok(RawMessage::with_status(
            MessageKind::LearnMode,
            parse_u16(body)?,
        )),
        'N' => {
            let (unit, values) = split_report(body)?;
            if values.is_empty() {
                return Err(LinkError::format("report without values"));
            }
            finish_report(unit, values)
        }
        'n' => {
            let (unit, mut values) = split_report(body)?;
            if values.len() < 2 {
                return Err(LinkError::format("secure report without values"));
            }
            values.remove(0);
            finish_report(unit, values)
        }
        'B' => {
            let (unit, values) = split_report(body)?;
            let [value] = values.as_slice() else {
                return Err(LinkError::format("basic report needs exactly one value"));
            };
            finish_report(unit, vec![class::BASIC, cmd::REPORT, *value])
        }
        'S' => {
            let (unit, values) = split_report(body)?;
            let [scene] = values.as_slice() else {
                return Err(LinkError::format("scene report needs exactly one value"));
            };
            finish_report(
                unit,
                vec![class::SCENE_ACTIVATION, cmd::SCENE_ACTIVATION_SET, *scene],
            )
        }
        other => Err(LinkError::UnknownMessage { prefix: other }),
    }
}

fn finish_report(unit: u8, values: Vec<u8>) -> Result<RawMessage> {
    let (instance, values) = decapsulate(values)?;
    Ok(RawMessage::report(unit, instance, values))
}

fn split_report(body: &str) -> Result<(u8, Vec<u8>)> {
    let (unit, values) = body
        .split_once(':')
        .ok_or_else(|| LinkError::format(format!("report without unit separator: {:?}", body)))?;
    Ok((parse_u8(unit)?, parse_values(values)?))
}

/// Encode a device line for `msg`, split into continuation lines where it
/// exceeds the device line length. Reports with a non-zero instance get
/// instance-style encapsulation.
pub fn encode_device_lines(msg: &RawMessage) -> Vec<Vec<u8>> {
    let text = match msg.kind {
        MessageKind::Ack => "E0".to_string(),
        MessageKind::Nak => format!("E{}", msg.status),
        MessageKind::TransmitAck => format!("X{}", msg.status),
        MessageKind::UnitId => format!("F{}", msg.unit_id),
        MessageKind::LearnMode => format!("!{}", msg.status),
        MessageKind::GenericReport => {
            let values = encapsulate(msg.instance_id, MultiType::Instance, &msg.values);
            format!("N{}:{}", msg.unit_id, join_values(&values))
        }
    };
    split_for_device(&text)
}

fn split_for_device(text: &str) -> Vec<Vec<u8>> {
    let finish = |body: &str| {
        let mut line = Vec::with_capacity(body.len() + 2);
        line.push(VRCOP_DEVICE_START);
        line.extend_from_slice(body.as_bytes());
        line.push(CR);
        line
    };
    let Some(colon) = text.find(':') else {
        return vec![finish(text)];
    };
    let prefix = &text[..=colon];
    // Start marker, continuation marker and CR share the line with the prefix
    let budget = VRCOP_MAX_LINE.saturating_sub(prefix.len() + 3).max(8);

    let mut lines = Vec::new();
    let mut rest = &text[colon + 1..];
    loop {
        if rest.len() <= budget {
            lines.push(finish(&format!("{}{}", prefix, rest)));
            break;
        }
        // Split after a comma so every chunk ends on a value boundary
        let cut = rest[..budget].rfind(',').map(|i| i + 1).unwrap_or(budget);
        lines.push(finish(&format!(
            "{}{}{}",
            prefix,
            &rest[..cut],
            VRCOP_CONTINUATION as char
        )));
        rest = &rest[cut..];
    }
    lines
}

fn join_values(values: &[u8]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_values(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',').map(parse_u8).collect()
}

fn parse_u8(text: &str) -> Result<u8> {
    text.trim()
        .parse()
        .map_err(|_| LinkError::format(format!("bad byte value {:?}", text)))
}

fn parse_u16(text: &str) -> Result<u16> {
    text.trim()
        .parse()
        .map_err(|_| LinkError::format(format!("bad numeric value {:?}", text)))
}

/// Strip CR/LF on both ends; the LF of the previous line lands at the front.
fn trim_line(line: &[u8]) -> &[u8] {
    let is_end = |b: &u8| *b == CR || *b == LF;
    let start = line.iter().position(|b| !is_end(b)).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !is_end(b)).map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(line: &str) -> Result<Option<RawMessage>> {
        VrcopDecoder::new().feed_line(line.as_bytes())
    }

    #[test]
    fn test_host_frame_layout() {
        let frame = HostCommand::send(12, vec![37, 1, 255]).encode();
        let body = b"N12SE37,1,255";
        let mut expected = vec![b'>'];
        expected.extend_from_slice(body);
        expected.push(b'|');
        expected.extend_from_slice(&hex_pair(sum_checksum(body)));
        expected.push(b'\r');
        assert_eq!(frame, expected);

        assert_eq!(HostCommand::NodeId.encode(), b">F|46\r");
        assert_eq!(HostCommand::LearnMode(false).encode(), b">!0|51\r");
    }

    #[test]
    fn test_host_encapsulation_shapes() {
        let instance = HostCommand::Send(UnitPayload {
            unit: 9,
            instance: 2,
            secure: true,
            multi: MultiType::Instance,
            payload: vec![0x25, 0x02],
        });
        assert_eq!(instance.body(), "N9SS96,6,2,37,2");

        let channel = HostCommand::Send(UnitPayload {
            unit: 9,
            instance: 3,
            secure: false,
            multi: MultiType::Channel,
            payload: vec![0x25, 0x02],
        });
        assert_eq!(channel.body(), "N9SE96,13,1,3,37,2");
    }

    #[test]
    fn test_host_parse_inverts_encode() {
        let cases = [
            HostCommand::NodeId,
            HostCommand::LearnMode(true),
            HostCommand::send(200, vec![0x20, 0x01, 0x63]),
            HostCommand::Send(UnitPayload {
                unit: 5,
                instance: 4,
                secure: true,
                multi: MultiType::Channel,
                payload: vec![0x31, 0x04],
            }),
            HostCommand::Send(UnitPayload {
                unit: 5,
                instance: 1,
                secure: false,
                multi: MultiType::Instance,
                payload: vec![0x26, 0x01, 50],
            }),
        ];
        for cmd in cases {
            assert_eq!(HostCommand::parse(&cmd.encode()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_host_parse_rejects_bad_checksum() {
        let mut frame = HostCommand::send(3, vec![0x25, 0x02]).encode();
        // Flip one bit in the payload region
        frame[4] ^= 0x01;
        assert!(matches!(
            HostCommand::parse(&frame),
            Err(LinkError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_basic_report_normalized() {
        let msg = decode("<B12:80\r").unwrap().unwrap();
        assert_eq!(msg.kind, MessageKind::GenericReport);
        assert_eq!(msg.unit_id, 12);
        assert_eq!(msg.instance_id, 0);
        assert_eq!(msg.values, vec![class::BASIC, cmd::REPORT, 80]);
    }

    #[test]
    fn test_scene_report_normalized() {
        let msg = decode("<S7:4\r").unwrap().unwrap();
        assert_eq!(msg.values, vec![class::SCENE_ACTIVATION, cmd::SCENE_ACTIVATION_SET, 4]);
    }

    #[test]
    fn test_secure_report_stripped() {
        let msg = decode("<n8:152,49,5,10,20\r").unwrap().unwrap();
        assert_eq!(msg.kind, MessageKind::GenericReport);
        assert_eq!(msg.unit_id, 8);
        assert_eq!(msg.values, vec![49, 5, 10, 20]);
    }

    #[test]
    fn test_multichannel_decapsulation() {
        let msg = decode("<N4:96,13,1,3,37,3,42\r").unwrap().unwrap();
        assert_eq!(msg.instance_id, 3);
        assert_eq!(msg.values, vec![37, 3, 42]);

        let msg = decode("<N4:96,6,2,37,3,0\r").unwrap().unwrap();
        assert_eq!(msg.instance_id, 2);
        assert_eq!(msg.values, vec![37, 3, 0]);

        assert!(decode("<N4:96,13,1\r").is_err());
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(decode("<E0\r").unwrap().unwrap().kind, MessageKind::Ack);
        let nak = decode("<E003\r\n").unwrap().unwrap();
        assert_eq!(nak.kind, MessageKind::Nak);
        assert_eq!(nak.status, 3);
        let x = decode("<X0\r").unwrap().unwrap();
        assert_eq!((x.kind, x.status), (MessageKind::TransmitAck, 0));
        let f = decode("<F1\r").unwrap().unwrap();
        assert_eq!((f.kind, f.unit_id), (MessageKind::UnitId, 1));
        assert_eq!(decode("<!0\r").unwrap().unwrap().kind, MessageKind::LearnMode);
    }

    #[test]
    fn test_unknown_prefix() {
        assert!(matches!(
            decode("<Q12\r"),
            Err(LinkError::UnknownMessage { prefix: 'Q' })
        ));
        assert!(decode("N12:1,2\r").is_err());
        assert_eq!(decode("\r\n").unwrap(), None);
        assert_eq!(decode("\n<E0\r").unwrap().unwrap().kind, MessageKind::Ack);
    }

    #[test]
    fn test_continuation_join() {
        let whole = decode("<N9:49,5,1,2,3,4,5,6\r").unwrap().unwrap();

        let mut decoder = VrcopDecoder::new();
        assert_eq!(decoder.feed_line(b"<N9:49,5,1,2,3,\\\r").unwrap(), None);
        assert!(decoder.is_pending());
        let joined = decoder.feed_line(b"<N9:4,5,6\r").unwrap().unwrap();
        assert_eq!(joined, whole);
        assert!(!decoder.is_pending());
    }

    #[test]
    fn test_continuation_mismatch() {
        let mut decoder = VrcopDecoder::new();
        decoder.feed_line(b"<N9:49,5,1,\\\r").unwrap();
        assert!(matches!(
            decoder.feed_line(b"<N10:2,3\r"),
            Err(LinkError::Continuation { .. })
        ));
        assert!(!decoder.is_pending());

        assert!(matches!(
            VrcopDecoder::new().feed_line(b"<E0\\\r"),
            Err(LinkError::Continuation { .. })
        ));
    }

    #[test]
    fn test_device_lines_split_and_rejoin() {
        let values: Vec<u8> = (0..80).map(|i| 100 + (i % 100) as u8).collect();
        let msg = RawMessage::report(17, 2, values);
        let lines = encode_device_lines(&msg);
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.len() <= VRCOP_MAX_LINE));

        let mut decoder = VrcopDecoder::new();
        let mut decoded = None;
        for line in &lines {
            decoded = decoder.feed_line(line).unwrap();
        }
        assert_eq!(decoded, Some(msg));
    }
}
