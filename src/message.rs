// MIT License - Copyright (c) 2021 TJForc

//! Decoded protocol frames as seen by the wait engine and the dispatcher.

use crate::constants::{class, cmd};

/// Classification of one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Interface accepted the last command.
    Ack,
    /// Interface rejected the last command; `status` carries the code.
    Nak,
    /// Mesh-level delivery result; `status` 0 means delivered.
    TransmitAck,
    /// Reply to the unit-id query.
    UnitId,
    /// Normalised unit report: command class, command, arguments.
    GenericReport,
    /// Learn mode state change.
    LearnMode,
}

impl MessageKind {
    /// Only reports carry a command class and command.
    pub fn is_report(&self) -> bool {
        matches!(self, Self::GenericReport)
    }

    /// Kinds that express a device-side failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Nak)
    }
}

/// Style of the encapsulation header used for instance traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiType {
    /// `[0x60, 0x06, instance]`
    #[default]
    Instance,
    /// `[0x60, 0x0D, source, instance]`
    Channel,
}

/// Instance criterion of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceMatch {
    #[default]
    Any,
    Exact(u8),
}

impl InstanceMatch {
    pub fn matches(&self, instance: u8) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(want) => *want == instance,
        }
    }
}

/// One decoded frame. Transient: built by the codec, consumed by the
/// wait engine or the dispatcher, then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub kind: MessageKind,
    /// Unit the frame concerns, 0 if not unit specific.
    pub unit_id: u8,
    /// 0 is the base instance.
    pub instance_id: u8,
    /// Status or code for ack, nak, transmit-ack, unit-id and learn mode.
    pub status: u16,
    /// Command class, command, arguments for reports.
    pub values: Vec<u8>,
}

impl RawMessage {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            unit_id: 0,
            instance_id: 0,
            status: 0,
            values: Vec::new(),
        }
    }

    pub fn with_status(kind: MessageKind, status: u16) -> Self {
        Self {
            status,
            ..Self::new(kind)
        }
    }

    pub fn report(unit_id: u8, instance_id: u8, values: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::GenericReport,
            unit_id,
            instance_id,
            status: 0,
            values,
        }
    }

    pub fn command_class(&self) -> u8 {
        self.values.first().copied().unwrap_or(0)
    }

    pub fn command(&self) -> u8 {
        self.values.get(1).copied().unwrap_or(0)
    }

    pub fn args(&self) -> &[u8] {
        self.values.get(2..).unwrap_or(&[])
    }

    pub fn is_wakeup_notification(&self) -> bool {
        self.kind == MessageKind::GenericReport
            && self.command_class() == class::WAKE_UP
            && self.command() == cmd::WAKE_UP_NOTIFICATION
    }
}
