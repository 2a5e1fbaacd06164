// MIT License - Copyright (c) 2021 TJForc

//! Driver notifications. Field values reach the outside world only through
//! here; the worker broadcasts, and any number of bridges may listen.

use tokio::sync::broadcast;

use crate::field::{FieldId, FieldValue};

/// What a driver reports outside request/reply traffic.
///
/// `FieldChanged` and `FieldError` are the store callback of the field
/// engine; the rest describe the link and its units.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Transport opened and handshake completed
    Connected,
    /// Transport failed and was closed; the next request reconnects
    ConnectionLost { reason: String },
    /// A handler parsed a fresh value for a field
    FieldChanged { field: FieldId, value: FieldValue },
    /// A field's value is no longer trustworthy
    FieldError { field: FieldId },
    /// A sleeping unit sent its wake-up notification
    UnitAwake { unit: u8 },
    /// A frame was discarded because of a format or checksum problem
    BadMessage { details: String },
}

impl DriverEvent {
    /// The field this event updates, if any.
    pub fn field(&self) -> Option<FieldId> {
        match self {
            Self::FieldChanged { field, .. } | Self::FieldError { field } => Some(*field),
            _ => None,
        }
    }
}

pub type EventSender = broadcast::Sender<DriverEvent>;

pub type EventReceiver = broadcast::Receiver<DriverEvent>;

/// A slow listener loses the oldest events once `capacity` are pending;
/// the worker never waits on listeners.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
