// MIT License - Copyright (c) 2021 TJForc

//! Z-Wave over a VRCOP serial interface.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::vrcop::{HostCommand, VrcopDecoder};
use crate::config::DriverConfig;
use crate::dispatch::{self, escalates, DispatchResult, Dispatcher};
use crate::driver::Driver;
use crate::error::{LinkError, Result};
use crate::event::{DriverEvent, EventSender};
use crate::field::{CommResult, FieldDef, FieldId, FieldValue};
use crate::message::{MessageKind, RawMessage};
use crate::persist;
use crate::transport::{Link, LinkStats, Transport};
use crate::units::device_info::DeviceCatalog;
use crate::units::{QueuedCommand, Unit, UnitTable};
use crate::wait::{Framing, OnFailure, Session, WaitOutcome, WaitSpec};

pub struct ZwaveDriver {
    config: DriverConfig,
    events: EventSender,
    session: Option<Session>,
    units: UnitTable,
    dispatcher: Dispatcher,
    controller: Option<u8>,
    last_stats: LinkStats,
}

/// Dispatch one report and announce wake-ups. Returns whether it was handled.
async fn dispatch_report(
    dispatcher: &Dispatcher,
    session: &mut Session,
    units: &mut UnitTable,
    events: &mut EventSender,
    msg: &RawMessage,
) -> Result<bool> {
    let result = dispatcher.handle_report(session, units, msg, events).await?;
    if result == DispatchResult::WokeUp {
        let _ = events.send(DriverEvent::UnitAwake { unit: msg.unit_id });
    }
    Ok(result.is_handled())
}

impl ZwaveDriver {
    pub fn new(config: DriverConfig, events: EventSender) -> Self {
        let dispatcher = Dispatcher::new(config.secure);
        Self {
            config,
            events,
            session: None,
            units: UnitTable::new(),
            dispatcher,
            controller: None,
            last_stats: LinkStats::default(),
        }
    }

    pub fn with_units(mut self, units: impl IntoIterator<Item = Unit>) -> Self {
        for unit in units {
            self.units
                .insert(unit.with_queue_capacity(self.config.queue_capacity));
        }
        self
    }

    pub fn units(&self) -> &UnitTable {
        &self.units
    }

    /// Unit id of the interface itself, learned during the handshake.
    pub fn controller_id(&self) -> Option<u8> {
        self.controller
    }

    /// Replace the unit table with persisted records. Returns the unit count.
    pub fn load_units(&mut self, data: &[u8], catalog: &DeviceCatalog) -> Result<usize> {
        let units = persist::decode_units(data, catalog)?;
        let count = units.len();
        self.units = UnitTable::new();
        for unit in units {
            self.units
                .insert(unit.with_queue_capacity(self.config.queue_capacity));
        }
        Ok(count)
    }

    async fn handshake(session: &mut Session) -> Result<u8> {
        session
            .send_command(&HostCommand::NodeId, OnFailure::Raise)
            .await?;
        let limit = session.policy().handshake_timeout();
        let id = match session
            .wait(WaitSpec::new(MessageKind::UnitId), limit, OnFailure::Raise)
            .await?
        {
            WaitOutcome::Matched(msg) => msg.unit_id,
            _ => return Err(LinkError::timeout("interface unit id")),
        };
        session
            .send_command(&HostCommand::LearnMode(false), OnFailure::Raise)
            .await?;
        Ok(id)
    }

    /// Dispatch reports parked by earlier waits, including any parked while
    /// doing so. Returns how many were handled.
    async fn drain_inbox(&mut self) -> Result<usize> {
        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };
        let mut handled = 0;
        loop {
            let pending = session.take_inbox();
            if pending.is_empty() {
                return Ok(handled);
            }
            for msg in pending {
                if dispatch_report(
                    &self.dispatcher,
                    session,
                    &mut self.units,
                    &mut self.events,
                    &msg,
                )
                .await?
                {
                    handled += 1;
                }
            }
        }
    }

    /// Read unsolicited traffic for up to `limit`.
    async fn pump(&mut self, limit: Duration) -> Result<usize> {
        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };
        let deadline = Instant::now() + limit;
        let mut handled = 0;
        while let Some(msg) = session.next_message(deadline).await? {
            if msg.kind != MessageKind::GenericReport {
                debug!("Ignoring unsolicited {:?}", msg.kind);
                continue;
            }
            if dispatch_report(
                &self.dispatcher,
                session,
                &mut self.units,
                &mut self.events,
                &msg,
            )
            .await?
            {
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Query every readable handler on awake units whose value is older
    /// than `max_age`. One failing handler does not stop the sweep.
    async fn active_poll(&mut self, max_age: Duration) -> Result<usize> {
        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };
        let now = std::time::Instant::now();
        let mut queried = 0;

        for id in self.units.ids() {
            let Some(unit) = self.units.get_mut(id) else {
                continue;
            };
            if !unit.is_viable() || unit.is_wakeup() {
                continue;
            }
            let stale: Vec<usize> = unit
                .handlers()
                .iter()
                .enumerate()
                .filter(|(_, h)| h.build_query().is_some() && h.is_stale(now, max_age))
                .map(|(index, _)| index)
                .collect();

            for index in stale {
                queried += 1;
                match self
                    .dispatcher
                    .query_handler(session, unit, index, &mut self.events)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!(unit = id, handler = index, "No answer to active poll"),
                    Err(e) if escalates(&e) => return Err(e),
                    Err(e) => warn!(unit = id, handler = index, "Active poll failed: {}", e),
                }
            }
        }
        Ok(queried)
    }
}

#[async_trait]
impl Driver for ZwaveDriver {
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
            Framing::Vrcop(VrcopDecoder::new()),
            self.config.wait.clone(),
        )
        .with_events(self.events.clone());

        match Self::handshake(&mut session).await {
            Ok(id) => {
                info!("Interface ready, controller unit {}", id);
                self.controller = Some(id);
                self.session = Some(session);
                self.drain_inbox().await?;
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

    async fn poll(&mut self) -> Result<CommResult> {
        if self.session.is_none() {
            return Err(LinkError::Disconnected);
        }
        let tick = self.config.wait.read_tick();

        let mut worked = self.drain_inbox().await? > 0;
        worked |= self.pump(tick).await? > 0;
        if let Some(max_age) = self.config.active_poll_interval() {
            worked |= self.active_poll(max_age).await? > 0;
        }
        worked |= self.drain_inbox().await? > 0;

        Ok(if worked {
            CommResult::Success
        } else {
            CommResult::Idle
        })
    }

    async fn write_field(&mut self, field: FieldId, value: FieldValue) -> Result<CommResult> {
        let binding = self
            .units
            .binding(field)
            .ok_or(LinkError::UnknownField { field })?;
        let unit = self
            .units
            .get_mut(binding.unit)
            .ok_or(LinkError::UnknownField { field })?;
        if !unit.is_viable() {
            return Err(LinkError::UnitUnavailable { unit: unit.id() });
        }
        let handler = unit
            .handlers()
            .get(binding.handler)
            .ok_or(LinkError::UnknownField { field })?;
        let command = QueuedCommand {
            class_id: handler.class_id(),
            instance: handler.instance(),
            payload: handler.build_write(&value)?,
            value: Some(value),
        };

        if unit.is_wakeup() {
            dispatch::queue_command(unit, command)?;
            return Ok(CommResult::Success);
        }

        let session = self.session.as_mut().ok_or(LinkError::Disconnected)?;
        let sent = self
            .dispatcher
            .send_now(session, unit, &command, &mut self.events)
            .await?;
        self.drain_inbox().await?;

        Ok(if sent {
            CommResult::Success
        } else {
            CommResult::Failed
        })
    }

    fn write_needs_connection(&self, field: FieldId) -> bool {
        self.units
            .binding(field)
            .and_then(|binding| self.units.get(binding.unit))
            .is_none_or(|unit| !unit.is_wakeup())
    }

    fn register_fields(&mut self, base: FieldId) -> Vec<FieldDef> {
        self.units.register_fields(base)
    }

    fn configure_unit(&mut self, unit: Unit) -> Result<()> {
        debug!(unit = unit.id(), "Configuring unit {}", unit.name());
        self.units
            .insert(unit.with_queue_capacity(self.config.queue_capacity));
        Ok(())
    }

    fn save_units(&self) -> Result<Vec<u8>> {
        Ok(persist::encode_units(self.units.iter())?.to_vec())
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            self.last_stats = session.stats();
            session.close().await;
            info!("Interface closed");
        }
    }

    fn stats(&self) -> LinkStats {
        self.session
            .as_ref()
            .map(Session::stats)
            .unwrap_or(self.last_stats)
    }
}
