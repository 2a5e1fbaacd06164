// MIT License - Copyright (c) 2021 TJForc

use std::fmt;

use crate::field::{CommResult, FieldId};

/// Which device family reported an error code. The two families use
/// unrelated numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    Vrcop,
    RedRat,
}

/// An error code reported by the device itself (nak, error status,
/// failed transmit acknowledgement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceErrorCode {
    pub family: ProtocolFamily,
    pub code: u16,
}

impl DeviceErrorCode {
    pub fn vrcop(code: u16) -> Self {
        Self {
            family: ProtocolFamily::Vrcop,
            code,
        }
    }

    pub fn redrat(code: u16) -> Self {
        Self {
            family: ProtocolFamily::RedRat,
            code,
        }
    }

    /// Human-readable reason for the code.
    pub fn description(&self) -> &'static str {
        match self.family {
            ProtocolFamily::Vrcop => match self.code {
                1 => "Unknown command",
                2 => "Invalid parameter",
                3 => "Interface busy",
                4 => "No route to node",
                5 => "Node not in network",
                6 => "Node did not acknowledge",
                7 => "Checksum error",
                8 => "Receive buffer overflow",
                9 => "Command not supported by node",
                10 => "Network is in learn mode",
                _ => "Unknown error",
            },
            ProtocolFamily::RedRat => match self.code {
                1 => "Unknown command",
                2 => "Checksum error",
                3 => "Signal data malformed",
                4 => "Output port busy",
                5 => "Learn timed out",
                6 => "Signal too long",
                _ => "Unknown error",
            },
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.family {
            ProtocolFamily::Vrcop => "E",
            ProtocolFamily::RedRat => "RR",
        };
        write!(f, "{}{:03}: {}", tag, self.code, self.description())
    }
}

/// All errors that can occur in the framelink library.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Connection timeout: {endpoint}")]
    ConnectTimeout { endpoint: String },

    #[error("Transport disconnected")]
    Disconnected,

    #[error("Timed out waiting for {waiting_for}")]
    Timeout { waiting_for: String },

    #[error("Device error: {0}")]
    Device(DeviceErrorCode),

    #[error("Illegal byte 0x{byte:02X} in state {state}")]
    BadByte { state: &'static str, byte: u8 },

    #[error("Checksum mismatch (computed {computed:02X}, received {received:02X})")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("Malformed message: {details}")]
    BadFormat { details: String },

    #[error("Bad continuation line: {details}")]
    Continuation { details: String },

    #[error("Unknown message prefix {prefix:?}")]
    UnknownMessage { prefix: char },

    #[error("Command queue full for unit {unit} (capacity {capacity})")]
    QueueFull { unit: u8, capacity: usize },

    #[error("Internal usage error: {details}")]
    Usage { details: String },

    #[error("Unknown unit {unit}")]
    UnknownUnit { unit: u8 },

    #[error("Unit {unit} is disabled, failed or missing")]
    UnitUnavailable { unit: u8 },

    #[error("Unknown field id {field}")]
    UnknownField { field: FieldId },

    #[error("Field {field} is not writable")]
    NotWritable { field: FieldId },

    #[error("Invalid value for field {field}: {details}")]
    InvalidValue { field: FieldId, details: String },

    #[error("Persisted data error: {details}")]
    Persist { details: String },

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Driver channel closed")]
    ChannelClosed,
}

impl LinkError {
    pub(crate) fn usage(details: impl Into<String>) -> Self {
        LinkError::Usage {
            details: details.into(),
        }
    }

    pub(crate) fn format(details: impl Into<String>) -> Self {
        LinkError::BadFormat {
            details: details.into(),
        }
    }

    pub(crate) fn timeout(waiting_for: impl Into<String>) -> Self {
        LinkError::Timeout {
            waiting_for: waiting_for.into(),
        }
    }

    /// The transport can no longer be trusted and must be closed and reopened.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_)
                | LinkError::Serial(_)
                | LinkError::ConnectTimeout { .. }
                | LinkError::Disconnected
        )
    }

    /// A framing problem: the frame is discarded, the connection survives.
    pub fn is_protocol_format(&self) -> bool {
        matches!(
            self,
            LinkError::BadByte { .. }
                | LinkError::ChecksumMismatch { .. }
                | LinkError::BadFormat { .. }
                | LinkError::Continuation { .. }
                | LinkError::UnknownMessage { .. }
        )
    }

    /// A programming defect. Never swallowed.
    pub fn is_usage(&self) -> bool {
        matches!(self, LinkError::Usage { .. } | LinkError::QueueFull { .. })
    }

    /// Whether retrying the connection may succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_transport_fatal() || matches!(self, LinkError::Timeout { .. })
    }

    /// Translate into the result reported across the field-engine boundary.
    pub fn comm_result(&self) -> CommResult {
        if self.is_transport_fatal() {
            CommResult::LostConnection
        } else {
            match self {
                LinkError::InvalidValue { .. } | LinkError::NotWritable { .. } => {
                    CommResult::ValueRejected
                }
                LinkError::Shutdown | LinkError::ChannelClosed => CommResult::LostConnection,
                _ => CommResult::Failed,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
