// MIT License - Copyright (c) 2021 TJForc

//! RedRat IR blaster.

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::redrat::{Direction, RedRatCommand, RedRatDecoder, RedRatFrame};
use crate::config::DriverConfig;
use crate::driver::Driver;
use crate::error::{LinkError, Result};
use crate::event::EventSender;
use crate::field::{
    CommResult, FieldAccess, FieldDef, FieldId, FieldKind, FieldStore, FieldValue,
};
use crate::message::{MessageKind, RawMessage};
use crate::transport::{Link, LinkStats, Transport};
use crate::wait::{Framing, OnFailure, Session, WaitOutcome, WaitSpec};

// Field offsets from the registration base
const FIELD_FIRMWARE: FieldId = 0;
const FIELD_BLAST: FieldId = 1;
const FIELD_LEARN: FieldId = 2;
const FIELD_LAST_LEARNED: FieldId = 3;
const FIELD_COUNT: FieldId = 4;

pub struct RedRatDriver {
    config: DriverConfig,
    events: EventSender,
    session: Option<Session>,
    field_base: Option<FieldId>,
    firmware: Option<String>,
    last_stats: LinkStats,
}

/// Text after the command byte of a RedRat report.
fn payload_text(msg: &RawMessage) -> String {
    let payload = msg.values.get(1..).unwrap_or_default();
    String::from_utf8_lossy(payload).trim().to_string()
}

/// Signal data must survive framing: printable ASCII without the divider.
fn valid_signal(signal: &str) -> bool {
    !signal.is_empty() && signal.bytes().all(|b| b.is_ascii_graphic() && b != b'#')
}

impl RedRatDriver {
    pub fn new(config: DriverConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            session: None,
            field_base: None,
            firmware: None,
            last_stats: LinkStats::default(),
        }
    }

    /// Firmware version reported during the handshake.
    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    fn publish(&mut self, offset: FieldId, value: FieldValue) {
        if let Some(base) = self.field_base {
            self.events.store(base + offset, value);
        }
    }

    async fn handshake(session: &mut Session) -> Result<String> {
        session
            .send_raw(&RedRatFrame::bare(RedRatCommand::Version).encode_host())
            .await?;
        let limit = session.policy().handshake_timeout();
        let spec = WaitSpec::new(MessageKind::GenericReport).class(RedRatCommand::Version.code(), 0);
        let firmware = match session.wait(spec, limit, OnFailure::Raise).await? {
            WaitOutcome::Matched(msg) => payload_text(&msg),
            _ => return Err(LinkError::timeout("firmware version")),
        };
        // Leave any capture mode a previous session started
        session
            .send_and_wait_ack(
                &RedRatFrame::bare(RedRatCommand::CancelLearn).encode_host(),
                "cancel learn",
                OnFailure::Raise,
            )
            .await?;
        Ok(firmware)
    }

    /// Apply frames parked during waits. Returns how many were used.
    fn drain_inbox(&mut self) -> usize {
        let Some(session) = self.session.as_mut() else {
            return 0;
        };
        let mut used = 0;
        for msg in session.take_inbox() {
            match RedRatCommand::from_code(msg.command_class()) {
                Some(RedRatCommand::LearnedData) => {
                    info!("Learned a signal");
                    self.publish(FIELD_LAST_LEARNED, FieldValue::String(payload_text(&msg)));
                    used += 1;
                }
                Some(RedRatCommand::Version) => {
                    let firmware = payload_text(&msg);
                    self.publish(FIELD_FIRMWARE, FieldValue::String(firmware.clone()));
                    self.firmware = Some(firmware);
                    used += 1;
                }
                _ => debug!("Ignoring unsolicited frame {:?}", msg.values),
            }
        }
        used
    }
}

#[async_trait]
impl Driver for RedRatDriver {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn connect(
        &mut self,
        transport: Box<dyn Transport>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.disconnect().await;

        let link = Link::new(
            transport,
            self.config.min_send_interval(),
            &self.config.wait,
            shutdown,
        );
        let mut session = Session::new(
            link,
            Framing::RedRat(RedRatDecoder::new(Direction::FromDevice)),
            self.config.wait.clone(),
        )
        .with_events(self.events.clone());

        match Self::handshake(&mut session).await {
            Ok(firmware) => {
                info!("RedRat firmware {}", firmware);
                self.publish(FIELD_FIRMWARE, FieldValue::String(firmware.clone()));
                self.firmware = Some(firmware);
                self.session = Some(session);
                self.drain_inbox();
                Ok(())
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                self.last_stats = session.stats();
                session.close().await;
                Err(e)
            }
        }
    }

    /// Ping; silence means the device is gone.
    async fn poll(&mut self) -> Result<CommResult> {
        let session = self.session.as_mut().ok_or(LinkError::Disconnected)?;
        session
            .send_raw(&RedRatFrame::bare(RedRatCommand::Ping).encode_host())
            .await?;
        let limit = session.policy().ping_timeout();
        match session
            .wait(WaitSpec::new(MessageKind::Ack), limit, OnFailure::Return)
            .await?
        {
            WaitOutcome::Matched(_) => {}
            WaitOutcome::TimedOut => {
                warn!("No answer to ping");
                return Err(LinkError::Disconnected);
            }
            WaitOutcome::Rejected(code) => debug!("Ping answered with {}", code),
        }
        self.drain_inbox();
        Ok(CommResult::Success)
    }

    async fn write_field(&mut self, field: FieldId, value: FieldValue) -> Result<CommResult> {
        let offset = self
            .field_base
            .and_then(|base| field.checked_sub(base))
            .filter(|offset| *offset < FIELD_COUNT)
            .ok_or(LinkError::UnknownField { field })?;

        let (frame, what) = match offset {
            FIELD_BLAST => {
                let signal = value
                    .as_str()
                    .filter(|s| valid_signal(s))
                    .ok_or_else(|| LinkError::InvalidValue {
                        field,
                        details: "expected printable signal data".into(),
                    })?;
                (
                    RedRatFrame::new(RedRatCommand::Blast, signal.as_bytes().to_vec()),
                    "blast",
                )
            }
            FIELD_LEARN => {
                let on = value.as_bool().ok_or_else(|| LinkError::InvalidValue {
                    field,
                    details: "expected a boolean".into(),
                })?;
                match on {
                    true => (RedRatFrame::bare(RedRatCommand::Learn), "learn"),
                    false => (RedRatFrame::bare(RedRatCommand::CancelLearn), "cancel learn"),
                }
            }
            _ => return Err(LinkError::NotWritable { field }),
        };

        let session = self.session.as_mut().ok_or(LinkError::Disconnected)?;
        let accepted = session
            .send_and_wait_ack(&frame.encode_host(), what, OnFailure::Return)
            .await?;
        if accepted {
            self.publish(offset, value);
        }
        self.drain_inbox();

        Ok(if accepted {
            CommResult::Success
        } else {
            CommResult::Failed
        })
    }

    fn register_fields(&mut self, base: FieldId) -> Vec<FieldDef> {
        self.field_base = Some(base);
        let name = &self.config.name;
        vec![
            FieldDef::new(format!("{}_Firmware", name), FieldKind::String, FieldAccess::Read),
            FieldDef::new(format!("{}_Blast", name), FieldKind::String, FieldAccess::Write),
            FieldDef::new(format!("{}_Learn", name), FieldKind::Bool, FieldAccess::Write),
            FieldDef::new(
                format!("{}_LastLearned", name),
                FieldKind::String,
                FieldAccess::Read,
            ),
        ]
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            self.last_stats = session.stats();
            session.close().await;
            info!("RedRat closed");
        }
    }

    fn stats(&self) -> LinkStats {
        self.session
            .as_ref()
            .map(Session::stats)
            .unwrap_or(self.last_stats)
    }
}
