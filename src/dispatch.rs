// MIT License - Copyright (c) 2021 TJForc

//! Routing of unit reports to handlers, and the sleeping-unit protocol.

use tracing::{debug, info, trace, warn};

use crate::codec::vrcop::{HostCommand, UnitPayload};
use crate::constants::{class, cmd};
use crate::error::{LinkError, Result};
use crate::field::FieldStore;
use crate::message::{InstanceMatch, RawMessage};
use crate::units::{QueuedCommand, Unit, UnitTable};
use crate::wait::{OnFailure, Session, WaitOutcome, WaitSpec};

/// What became of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Unknown or unusable unit.
    Ignored,
    /// No handler took it.
    Unhandled,
    Handled,
    /// Wake-up notification processed.
    WokeUp,
}

impl DispatchResult {
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled | Self::WokeUp)
    }
}

/// Errors that end a batch instead of being skipped.
pub(crate) fn escalates(e: &LinkError) -> bool {
    e.is_transport_fatal() || e.is_usage() || matches!(e, LinkError::Shutdown)
}

/// Deliver an ordinary report to the unit's handlers.
///
/// Basic reports go to the single handler of the unit's base class. Other
/// reports go to every handler on the report's instance, plus handlers that
/// accept instance-0 traffic for their class. Returns whether any handler
/// consumed it.
pub fn deliver_report(unit: &mut Unit, msg: &RawMessage, store: &mut dyn FieldStore) -> bool {
    let (class_id, command, args) = (msg.command_class(), msg.command(), msg.args());
    let mut handled = false;

    if class_id == class::BASIC {
        let base = unit.base_class();
        let handlers = unit.handlers_mut();
        let index = handlers
            .iter()
            .position(|h| h.class_id() == base && h.instance() == msg.instance_id)
            .or_else(|| handlers.iter().position(|h| h.class_id() == base));
        if let Some(index) = index {
            handled = handlers[index].consume_report(class_id, command, args, store);
        }
    } else {
        for handler in unit.handlers_mut() {
            let on_instance = handler.instance() == msg.instance_id
                || (msg.instance_id == 0
                    && handler.accepts_zero_instance()
                    && handler.class_id() == class_id);
            if on_instance && handler.consume_report(class_id, command, args, store) {
                handled = true;
            }
        }
    }

    if handled {
        unit.touch();
    }
    handled
}

/// Hold `command` for a sleeping unit. Fails when the queue is full.
pub fn queue_command(unit: &mut Unit, command: QueuedCommand) -> Result<()> {
    unit.queue_command(command)?;
    debug!(
        unit = unit.id(),
        "Queued command, {} waiting for wake-up",
        unit.queue_len()
    );
    Ok(())
}

/// Sends on behalf of units: addressing, queries and the wake-up exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher {
    secure: bool,
}

impl Dispatcher {
    pub fn new(secure: bool) -> Self {
        Self { secure }
    }

    /// Host command carrying `payload` to `unit`.
    pub fn unit_command(&self, unit: &Unit, instance: u8, payload: Vec<u8>) -> HostCommand {
        HostCommand::Send(UnitPayload {
            unit: unit.id(),
            instance,
            secure: self.secure,
            multi: unit.multi(),
            payload,
        })
    }

    /// Route one report. Unknown and unusable units are ignored silently.
    pub async fn handle_report(
        &self,
        session: &mut Session,
        units: &mut UnitTable,
        msg: &RawMessage,
        store: &mut dyn FieldStore,
    ) -> Result<DispatchResult> {
        let Some(unit) = units.get_mut(msg.unit_id) else {
            trace!(unit = msg.unit_id, "Report for unknown unit");
            return Ok(DispatchResult::Ignored);
        };
        if !unit.is_viable() {
            trace!(unit = msg.unit_id, "Report for unusable unit");
            return Ok(DispatchResult::Ignored);
        }

        if msg.is_wakeup_notification() {
            self.wake_up(session, unit, store).await?;
            return Ok(DispatchResult::WokeUp);
        }

        if deliver_report(unit, msg, store) {
            Ok(DispatchResult::Handled)
        } else {
            debug!(
                unit = msg.unit_id,
                instance = msg.instance_id,
                "No handler for class {:#04x} command {:#04x}",
                msg.command_class(),
                msg.command()
            );
            Ok(DispatchResult::Unhandled)
        }
    }

    /// Ask one handler for its value and deliver the answer.
    pub async fn query_handler(
        &self,
        session: &mut Session,
        unit: &mut Unit,
        index: usize,
        store: &mut dyn FieldStore,
    ) -> Result<bool> {
        let Some(handler) = unit.handlers().get(index) else {
            return Err(LinkError::usage(format!(
                "unit {} has no handler {}",
                unit.id(),
                index
            )));
        };
        let Some(query) = handler.build_query() else {
            return Ok(false);
        };
        let instance = match handler.accepts_zero_instance() {
            true => InstanceMatch::Any,
            false => InstanceMatch::Exact(handler.instance()),
        };
        let spec = WaitSpec::report(
            unit.id(),
            handler.class_id(),
            handler.capability().report_command(),
        )
        .instance(instance);
        let command = self.unit_command(unit, handler.instance(), query);

        if !session.send_command(&command, OnFailure::Return).await? {
            return Ok(false);
        }
        let limit = session.policy().report_timeout();
        match session.wait(spec, limit, OnFailure::Return).await? {
            WaitOutcome::Matched(msg) => Ok(deliver_report(unit, &msg, store)),
            _ => Ok(false),
        }
    }

    /// Send a command now. The owning handler, if any, records the value.
    pub async fn send_now(
        &self,
        session: &mut Session,
        unit: &mut Unit,
        command: &QueuedCommand,
        store: &mut dyn FieldStore,
    ) -> Result<bool> {
        let frame = self.unit_command(unit, command.instance, command.payload.clone());
        if !session.send_command(&frame, OnFailure::Return).await? {
            return Ok(false);
        }
        if let Some(index) = unit.handler_index(command.class_id, command.instance)
            && let Some(value) = &command.value
        {
            unit.handlers_mut()[index].note_written(value, store);
        }
        Ok(true)
    }

    /// Initialise handlers still waiting for a value, flush the queue in
    /// order, and release the unit back to sleep.
    async fn wake_up(
        &self,
        session: &mut Session,
        unit: &mut Unit,
        store: &mut dyn FieldStore,
    ) -> Result<()> {
        info!(unit = unit.id(), "Unit awake, {} queued", unit.queue_len());

        for index in 0..unit.handlers().len() {
            if !unit.handlers()[index].waiting_for_init() {
                continue;
            }
            match self.query_handler(session, unit, index, store).await {
                Ok(true) => {}
                Ok(false) => warn!(unit = unit.id(), handler = index, "Initial query failed"),
                Err(e) if escalates(&e) => return Err(e),
                Err(e) => warn!(unit = unit.id(), handler = index, "Initial query failed: {}", e),
            }
        }

        let queued = unit.drain_queue();
        let total = queued.len();
        for (position, command) in queued.iter().enumerate() {
            match self.send_now(session, unit, command, store).await {
                Ok(true) => {}
                Ok(false) => warn!(unit = unit.id(), "Queued command {} of {} failed", position + 1, total),
                Err(e) if escalates(&e) => {
                    warn!(
                        unit = unit.id(),
                        "Dropping {} queued commands: {}",
                        total - position - 1,
                        e
                    );
                    return Err(e);
                }
                Err(e) => warn!(unit = unit.id(), "Queued command {} of {} failed: {}", position + 1, total, e),
            }
        }

        let done = self.unit_command(
            unit,
            0,
            vec![class::WAKE_UP, cmd::WAKE_UP_NO_MORE_INFORMATION],
        );
        match session.send_command(&done, OnFailure::Return).await {
            Ok(true) => debug!(unit = unit.id(), "Unit released to sleep"),
            Ok(false) => warn!(unit = unit.id(), "Wake-up release not acknowledged"),
            Err(e) if escalates(&e) => return Err(e),
            Err(e) => warn!(unit = unit.id(), "Wake-up release failed: {}", e),
        }
        Ok(())
    }
}
