// MIT License - Copyright (c) 2021 TJForc

//! Message wait engine.
//!
//! A [`Session`] owns the link and the frame decoder for one driver. Its
//! [`wait`](Session::wait) call reads frames until one matches a
//! [`WaitSpec`]. Reports that do not match are parked in the session's
//! inbox; the driver hands them to the dispatcher once the exchange in
//! progress has finished, so waiting never re-enters unit handling.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::redrat::RedRatDecoder;
use crate::codec::vrcop::{HostCommand, VrcopDecoder};
use crate::config::WaitPolicy;
use crate::error::{DeviceErrorCode, LinkError, ProtocolFamily, Result};
use crate::event::{DriverEvent, EventSender};
use crate::message::{InstanceMatch, MessageKind, RawMessage};
use crate::transport::{Link, LinkStats};

/// What a wait is looking for. Zero unit, zero class and zero command are
/// wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSpec {
    pub kind: MessageKind,
    pub unit: u8,
    pub instance: InstanceMatch,
    pub class: u8,
    pub command: u8,
    /// Hand non-matching reports to the dispatcher (default) or drop them.
    pub dispatch_others: bool,
}

impl WaitSpec {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            unit: 0,
            instance: InstanceMatch::Any,
            class: 0,
            command: 0,
            dispatch_others: true,
        }
    }

    /// A report from `unit` carrying `class`/`command`.
    pub fn report(unit: u8, class: u8, command: u8) -> Self {
        Self {
            unit,
            class,
            command,
            ..Self::new(MessageKind::GenericReport)
        }
    }

    pub fn unit(mut self, unit: u8) -> Self {
        self.unit = unit;
        self
    }

    pub fn instance(mut self, instance: InstanceMatch) -> Self {
        self.instance = instance;
        self
    }

    pub fn class(mut self, class: u8, command: u8) -> Self {
        self.class = class;
        self.command = command;
        self
    }

    /// Drop non-matching traffic instead of dispatching it.
    pub fn suppress_others(mut self) -> Self {
        self.dispatch_others = false;
        self
    }

    /// Class and command filters only make sense on report kinds.
    pub fn validate(&self) -> Result<()> {
        if (self.class != 0 || self.command != 0) && !self.kind.is_report() {
            return Err(LinkError::usage(format!(
                "wait for {:?} cannot filter on class {:#04x} command {:#04x}",
                self.kind, self.class, self.command
            )));
        }
        Ok(())
    }

    pub fn matches(&self, msg: &RawMessage) -> bool {
        msg.kind == self.kind
            && (self.unit == 0 || msg.unit_id == self.unit)
            && self.instance.matches(msg.instance_id)
            && (self.class == 0 || msg.command_class() == self.class)
            && (self.command == 0 || msg.command() == self.command)
    }
}

/// Result of a wait that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Matched(RawMessage),
    TimedOut,
    /// The device answered with an error code instead.
    Rejected(DeviceErrorCode),
}

impl WaitOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched(_))
    }

    pub fn into_message(self) -> Option<RawMessage> {
        match self {
            Self::Matched(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Whether a negative outcome is returned as a value or raised as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFailure {
    #[default]
    Return,
    Raise,
}

/// The decoder used on a link.
#[derive(Debug)]
pub enum Framing {
    Vrcop(VrcopDecoder),
    RedRat(RedRatDecoder),
}

impl Framing {
    fn family(&self) -> ProtocolFamily {
        match self {
            Framing::Vrcop(_) => ProtocolFamily::Vrcop,
            Framing::RedRat(_) => ProtocolFamily::RedRat,
        }
    }

    fn reset(&mut self) {
        match self {
            Framing::Vrcop(d) => d.reset(),
            Framing::RedRat(d) => d.reset(),
        }
    }
}

/// Link, decoder and inbox for one connected driver.
pub struct Session {
    link: Link,
    framing: Framing,
    policy: WaitPolicy,
    inbox: VecDeque<RawMessage>,
    events: Option<EventSender>,
}

impl Session {
    pub fn new(link: Link, framing: Framing, policy: WaitPolicy) -> Self {
        Self {
            link,
            framing,
            policy,
            inbox: VecDeque::new(),
            events: None,
        }
    }

    /// Report discarded frames on the driver event channel.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    pub fn stats(&self) -> LinkStats {
        self.link.stats()
    }

    /// Reports that arrived while waiting for something else, oldest first.
    pub fn take_inbox(&mut self) -> Vec<RawMessage> {
        self.inbox.drain(..).collect()
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    pub async fn send_raw(&mut self, frame: &[u8]) -> Result<()> {
        self.link.send(frame).await
    }

    /// Read the next frame from the link, skipping and counting malformed ones.
    /// `Ok(None)` when the deadline passes first.
    pub async fn next_message(&mut self, deadline: Instant) -> Result<Option<RawMessage>> {
        loop {
            match self.read_frame(deadline).await {
                Ok(msg) => return Ok(msg),
                Err(e) if e.is_protocol_format() => {
                    self.framing.reset();
                    let stats = self.link.stats_mut();
                    if matches!(e, LinkError::UnknownMessage { .. }) {
                        stats.unknown_messages += 1;
                    } else {
                        stats.bad_messages += 1;
                    }
                    warn!("Discarding frame: {}", e);
                    if let Some(events) = &self.events {
                        let _ = events.send(DriverEvent::BadMessage {
                            details: e.to_string(),
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_frame(&mut self, deadline: Instant) -> Result<Option<RawMessage>> {
        let extension = self.link.extension();
        match &mut self.framing {
            Framing::Vrcop(decoder) => {
                let mut deadline = deadline;
                loop {
                    if decoder.is_pending() {
                        // Second bounded read for the continuation line
                        deadline = deadline.max(Instant::now() + extension);
                    }
                    match self.link.read_line(deadline).await? {
                        Some(line) => {
                            if let Some(msg) = decoder.feed_line(&line)? {
                                return Ok(Some(msg));
                            }
                        }
                        None if decoder.is_pending() => {
                            decoder.reset();
                            return Err(LinkError::Continuation {
                                details: "continuation line never arrived".into(),
                            });
                        }
                        None => return Ok(None),
                    }
                }
            }
            Framing::RedRat(decoder) => {
                let mut deadline = deadline;
                let mut extended = false;
                loop {
                    match self.link.read_byte(deadline).await? {
                        Some(byte) => {
                            if let Some(frame) = decoder.feed(byte)? {
                                self.link.stats_mut().frames_in += 1;
                                return frame.to_message().map(Some);
                            }
                        }
                        None if decoder.in_frame() && !extended => {
                            debug!("Frame in progress, extending read deadline");
                            deadline = Instant::now() + extension;
                            extended = true;
                        }
                        None if decoder.in_frame() => {
                            decoder.reset();
                            return Err(LinkError::format("frame truncated at deadline"));
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Wait up to `limit` for a message matching `spec`.
    ///
    /// Non-matching reports go to the inbox unless `spec` suppresses them.
    /// Timeouts and device errors come back as [`WaitOutcome`] values unless
    /// `on_failure` is [`OnFailure::Raise`]. An invalid `spec` is always an
    /// error.
    pub async fn wait(
        &mut self,
        spec: WaitSpec,
        limit: Duration,
        on_failure: OnFailure,
    ) -> Result<WaitOutcome> {
        spec.validate()?;
        let deadline = Instant::now() + limit;

        loop {
            let Some(msg) = self.next_message(deadline).await? else {
                self.link.stats_mut().timeouts += 1;
                debug!("Timed out waiting for {:?} from unit {}", spec.kind, spec.unit);
                if on_failure == OnFailure::Raise {
                    return Err(LinkError::timeout(format!("{:?}", spec.kind)));
                }
                return Ok(WaitOutcome::TimedOut);
            };

            if msg.kind.is_error() && spec.kind != msg.kind {
                self.link.stats_mut().naks += 1;
                let code = DeviceErrorCode {
                    family: self.framing.family(),
                    code: msg.status,
                };
                if on_failure == OnFailure::Raise {
                    return Err(LinkError::Device(code));
                }
                warn!(code = msg.status, "Device rejected request: {}", code);
                return Ok(WaitOutcome::Rejected(code));
            }

            if spec.matches(&msg) {
                return Ok(WaitOutcome::Matched(msg));
            }

            if spec.dispatch_others && msg.kind == MessageKind::GenericReport {
                trace!(unit = msg.unit_id, "Queueing report for dispatch");
                self.inbox.push_back(msg);
            } else {
                debug!("Ignoring {:?} while waiting for {:?}", msg.kind, spec.kind);
            }
        }
    }

    /// Send a frame and wait for the interface ack, resending on timeout or
    /// on a transient device code.
    pub async fn send_and_wait_ack(
        &mut self,
        frame: &[u8],
        what: &str,
        on_failure: OnFailure,
    ) -> Result<bool> {
        let attempts = self.policy.send_attempts.max(1);
        let ack_timeout = self.policy.ack_timeout();

        for attempt in 1..=attempts {
            self.link.send(frame).await?;
            match self
                .wait(WaitSpec::new(MessageKind::Ack), ack_timeout, OnFailure::Return)
                .await?
            {
                WaitOutcome::Matched(_) => return Ok(true),
                WaitOutcome::TimedOut => {
                    debug!(attempt, "No ack for {}", what);
                }
                WaitOutcome::Rejected(code) if self.policy.is_transient(code) => {
                    debug!(attempt, "Transient rejection of {}: {}", what, code);
                }
                WaitOutcome::Rejected(code) => {
                    if on_failure == OnFailure::Raise {
                        return Err(LinkError::Device(code));
                    }
                    return Ok(false);
                }
            }
        }

        warn!("No ack for {} after {} attempts", what, attempts);
        if on_failure == OnFailure::Raise {
            return Err(LinkError::timeout(format!("ack for {}", what)));
        }
        Ok(false)
    }

    /// Send a VRCOP host command. Unit-targeted sends also wait for the
    /// transmit ack when the policy requires it.
    pub async fn send_command(&mut self, cmd: &HostCommand, on_failure: OnFailure) -> Result<bool> {
        let what = cmd.body();
        if !self.send_and_wait_ack(&cmd.encode(), &what, on_failure).await? {
            return Ok(false);
        }
        if cmd.unit() == 0 || !self.policy.require_transmit_ack {
            return Ok(true);
        }

        let limit = self.policy.transmit_ack_timeout();
        let outcome = self
            .wait(WaitSpec::new(MessageKind::TransmitAck), limit, on_failure)
            .await?;
        match outcome {
            WaitOutcome::Matched(msg) if msg.status == 0 => Ok(true),
            WaitOutcome::Matched(msg) => {
                let code = DeviceErrorCode::vrcop(msg.status);
                if on_failure == OnFailure::Raise {
                    return Err(LinkError::Device(code));
                }
                warn!(unit = cmd.unit(), "Transmit failed: {}", code);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Close the transport.
    pub async fn close(self) {
        self.link.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::redrat::{Direction, RedRatCommand, RedRatFrame};
    use tokio::io::{
        duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf,
        WriteHalf,
    };
    use tokio::sync::watch;

    fn fast_policy() -> WaitPolicy {
        WaitPolicy {
            ack_timeout_ms: 40,
            report_timeout_ms: 80,
            transmit_ack_timeout_ms: 80,
            read_tick_ms: 10,
            read_extension_ms: 50,
            ..WaitPolicy::default()
        }
    }

    struct Device {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Device {
        async fn write(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn read_frame(&mut self) -> Vec<u8> {
            let mut buf = Vec::new();
            self.reader.read_until(b'\r', &mut buf).await.unwrap();
            buf
        }
    }

    fn session(framing: Framing) -> (Session, Device, watch::Sender<bool>) {
        let (host, device) = duplex(4096);
        let (tx, rx) = watch::channel(false);
        let policy = fast_policy();
        let link = Link::new(Box::new(host), Duration::ZERO, &policy, rx);
        let (reader, writer) = split(device);
        (
            Session::new(link, framing, policy),
            Device {
                reader: BufReader::new(reader),
                writer,
            },
            tx,
        )
    }

    fn vrcop_session() -> (Session, Device, watch::Sender<bool>) {
        session(Framing::Vrcop(VrcopDecoder::new()))
    }

    const LIMIT: Duration = Duration::from_millis(150);

    #[tokio::test]
    async fn test_wildcard_unit_matches_first() {
        let (mut s, mut dev, _tx) = vrcop_session();
        dev.write(b"<N7:37,3,0\r<N5:37,3,255\r").await;

        let out = s
            .wait(WaitSpec::new(MessageKind::GenericReport), LIMIT, OnFailure::Return)
            .await
            .unwrap();
        assert_eq!(out.into_message().unwrap().unit_id, 7);
    }

    #[tokio::test]
    async fn test_specific_unit_dispatches_others() {
        let (mut s, mut dev, _tx) = vrcop_session();
        dev.write(b"<N7:37,3,0\r<N5:37,3,255\r").await;

        let spec = WaitSpec::new(MessageKind::GenericReport).unit(5);
        let msg = s
            .wait(spec, LIMIT, OnFailure::Return)
            .await
            .unwrap()
            .into_message()
            .unwrap();
        assert_eq!(msg.unit_id, 5);
        assert_eq!(msg.args(), &[255]);

        let parked = s.take_inbox();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].unit_id, 7);
    }

    #[tokio::test]
    async fn test_specific_unit_times_out() {
        let (mut s, mut dev, _tx) = vrcop_session();
        dev.write(b"<N7:37,3,0\r").await;

        let spec = WaitSpec::new(MessageKind::GenericReport).unit(5);
        let out = s.wait(spec, LIMIT, OnFailure::Return).await.unwrap();
        assert_eq!(out, WaitOutcome::TimedOut);
        assert_eq!(s.inbox_len(), 1);
        assert_eq!(s.stats().timeouts, 1);

        let err = s.wait(spec, LIMIT, OnFailure::Raise).await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_suppressed_reports_are_dropped() {
        let (mut s, mut dev, _tx) = vrcop_session();
        dev.write(b"<N7:37,3,0\r<E0\r").await;
        let spec = WaitSpec::new(MessageKind::Ack).suppress_others();
        assert!(s.wait(spec, LIMIT, OnFailure::Return).await.unwrap().is_matched());
        assert_eq!(s.inbox_len(), 0);
    }

    #[tokio::test]
    async fn test_class_filter_on_non_report_is_usage_error() {
        let (mut s, _dev, _tx) = vrcop_session();
        let spec = WaitSpec::new(MessageKind::Ack).class(0x25, 0x03);
        let err = s.wait(spec, LIMIT, OnFailure::Return).await.unwrap_err();
        assert!(err.is_usage());
    }

    #[tokio::test]
    async fn test_class_and_instance_filters() {
        let (mut s, mut dev, _tx) = vrcop_session();
        dev.write(b"<N4:96,6,1,37,3,0\r<N4:96,6,2,49,5,1,10\r<N4:96,6,2,37,3,99\r")
            .await;
        let spec = WaitSpec::report(4, 0x25, 0x03).instance(InstanceMatch::Exact(2));
        let msg = s
            .wait(spec, LIMIT, OnFailure::Return)
            .await
            .unwrap()
            .into_message()
            .unwrap();
        assert_eq!((msg.instance_id, msg.args()), (2, &[99u8][..]));
        assert_eq!(s.inbox_len(), 2);
    }

    #[tokio::test]
    async fn test_nak_outcome() {
        let (mut s, mut dev, _tx) = vrcop_session();
        dev.write(b"<E5\r").await;
        let out = s
            .wait(WaitSpec::new(MessageKind::Ack), LIMIT, OnFailure::Return)
            .await
            .unwrap();
        assert_eq!(out, WaitOutcome::Rejected(DeviceErrorCode::vrcop(5)));

        dev.write(b"<E5\r").await;
        let err = s
            .wait(WaitSpec::new(MessageKind::Ack), LIMIT, OnFailure::Raise)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Device(code) if code.code == 5));
        assert_eq!(s.stats().naks, 2);
    }

    #[tokio::test]
    async fn test_bad_frames_are_skipped() {
        let (mut s, mut dev, _tx) = vrcop_session();
        dev.write(b"<Q1\r<N:1\r<E0\r").await;
        let out = s
            .wait(WaitSpec::new(MessageKind::Ack), LIMIT, OnFailure::Return)
            .await
            .unwrap();
        assert!(out.is_matched());
        assert_eq!(s.stats().unknown_messages, 1);
        assert_eq!(s.stats().bad_messages, 1);
    }

    #[tokio::test]
    async fn test_missing_continuation_is_counted() {
        let (mut s, mut dev, _tx) = vrcop_session();
        dev.write(b"<N9:49,5,1,\\\r").await;
        let out = s
            .wait(WaitSpec::new(MessageKind::GenericReport), LIMIT, OnFailure::Return)
            .await
            .unwrap();
        assert_eq!(out, WaitOutcome::TimedOut);
        assert_eq!(s.stats().bad_messages, 1);
    }

    #[tokio::test]
    async fn test_send_and_wait_ack_retries_transient() {
        let (mut s, mut dev, _tx) = vrcop_session();
        let device = tokio::spawn(async move {
            let first = dev.read_frame().await;
            dev.write(b"<E3\r").await;
            let second = dev.read_frame().await;
            dev.write(b"<E0\r").await;
            (first, second)
        });

        let cmd = HostCommand::NodeId;
        let ok = s
            .send_and_wait_ack(&cmd.encode(), "node id", OnFailure::Return)
            .await
            .unwrap();
        assert!(ok);
        let (first, second) = device.await.unwrap();
        assert_eq!(first, cmd.encode());
        assert_eq!(second, cmd.encode());
    }

    #[tokio::test]
    async fn test_send_and_wait_ack_hard_failure() {
        let (mut s, mut dev, _tx) = vrcop_session();
        let device = tokio::spawn(async move {
            dev.read_frame().await;
            dev.write(b"<E2\r").await;
            dev
        });
        let ok = s
            .send_and_wait_ack(&HostCommand::NodeId.encode(), "node id", OnFailure::Return)
            .await
            .unwrap();
        assert!(!ok);
        let _dev = device.await.unwrap();
        assert_eq!(s.stats().frames_out, 1);
    }

    #[tokio::test]
    async fn test_send_and_wait_ack_exhausts_attempts() {
        let (mut s, _dev, _tx) = vrcop_session();
        let err = s
            .send_and_wait_ack(&HostCommand::NodeId.encode(), "node id", OnFailure::Raise)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
        assert_eq!(s.stats().frames_out, 4);
    }

    #[tokio::test]
    async fn test_redrat_error_is_not_resent() {
        let (mut s, mut dev, _tx) = session(Framing::RedRat(RedRatDecoder::new(
            Direction::FromDevice,
        )));
        let device = tokio::spawn(async move {
            dev.read_frame().await;
            // Signal data malformed: a VRCOP 3 would be retried
            dev.write(&RedRatFrame::new(RedRatCommand::Error, b"3".to_vec()).encode_device())
                .await;
            dev
        });

        let blast = RedRatFrame::new(RedRatCommand::Blast, b"TV1".to_vec()).encode_host();
        let ok = s
            .send_and_wait_ack(&blast, "blast", OnFailure::Return)
            .await
            .unwrap();
        assert!(!ok);
        let _dev = device.await.unwrap();
        assert_eq!(s.stats().frames_out, 1);
        assert_eq!(s.stats().naks, 1);
    }

    #[tokio::test]
    async fn test_send_command_requires_transmit_ack() {
        let (mut s, mut dev, _tx) = vrcop_session();
        let device = tokio::spawn(async move {
            dev.read_frame().await;
            dev.write(b"<E0\r<N3:37,3,0\r<X0\r").await;
            dev.read_frame().await;
            dev.write(b"<E0\r<X6\r").await;
            dev
        });

        let cmd = HostCommand::send(3, vec![0x25, 0x01, 0]);
        assert!(s.send_command(&cmd, OnFailure::Return).await.unwrap());
        assert_eq!(s.take_inbox().len(), 1);

        let err = s.send_command(&cmd, OnFailure::Raise).await.unwrap_err();
        assert!(matches!(err, LinkError::Device(code) if code.code == 6));
        let _dev = device.await.unwrap();
    }

    #[tokio::test]
    async fn test_redrat_wait() {
        let (mut s, mut dev, _tx) = session(Framing::RedRat(RedRatDecoder::new(
            Direction::FromDevice,
        )));
        let mut wire = RedRatFrame::new(RedRatCommand::LearnedData, b"AB".to_vec()).encode_device();
        wire.extend(RedRatFrame::new(RedRatCommand::Version, b"3.0".to_vec()).encode_device());
        dev.write(&wire).await;

        let spec = WaitSpec::new(MessageKind::GenericReport).class(b'V', 0);
        let msg = s
            .wait(spec, LIMIT, OnFailure::Return)
            .await
            .unwrap()
            .into_message()
            .unwrap();
        assert_eq!(&msg.values[1..], b"3.0");
        assert_eq!(s.take_inbox()[0].command_class(), b'D');
    }

    #[tokio::test]
    async fn test_redrat_truncated_frame() {
        let (mut s, mut dev, _tx) = session(Framing::RedRat(RedRatDecoder::new(
            Direction::FromDevice,
        )));
        dev.write(b"[A#4").await;
        let out = s
            .wait(WaitSpec::new(MessageKind::Ack), LIMIT, OnFailure::Return)
            .await
            .unwrap();
        assert_eq!(out, WaitOutcome::TimedOut);
        assert_eq!(s.stats().bad_messages, 1);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_wait() {
        let (mut s, _dev, tx) = vrcop_session();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });
        let err = s
            .wait(
                WaitSpec::new(MessageKind::Ack),
                Duration::from_secs(10),
                OnFailure::Return,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Shutdown));
    }
}
