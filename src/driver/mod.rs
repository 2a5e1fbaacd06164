// MIT License - Copyright (c) 2021 TJForc

//! Protocol drivers. A driver owns one session and everything that is
//! addressed through it; the worker serialises every call into it.

pub mod redrat;
pub mod zwave;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::{DriverConfig, DriverKind};
use crate::error::{LinkError, Result};
use crate::event::EventSender;
use crate::field::{CommResult, FieldDef, FieldId, FieldValue};
use crate::transport::{LinkStats, Transport};
use crate::units::Unit;

pub use redrat::RedRatDriver;
pub use zwave::ZwaveDriver;

#[async_trait]
pub trait Driver: Send {
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Take ownership of a freshly opened transport and run the handshake.
    /// On failure the transport is closed and the driver stays disconnected.
    async fn connect(
        &mut self,
        transport: Box<dyn Transport>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;

    /// One tick of the external polling engine. `Idle` when there was
    /// nothing to do.
    async fn poll(&mut self) -> Result<CommResult>;

    async fn write_field(&mut self, field: FieldId, value: FieldValue) -> Result<CommResult>;

    /// Whether writing `field` needs an open transport. Writes that only
    /// queue for a sleeping unit do not.
    fn write_needs_connection(&self, _field: FieldId) -> bool {
        true
    }

    /// Enumerate and bind fields, numbering from `base`.
    fn register_fields(&mut self, base: FieldId) -> Vec<FieldDef>;

    /// Add or replace a unit. Fields must be registered again afterwards.
    fn configure_unit(&mut self, unit: Unit) -> Result<()> {
        Err(LinkError::usage(format!(
            "driver {} has no units, cannot add unit {}",
            self.name(),
            unit.id()
        )))
    }

    /// Persisted form of the configured units, empty for drivers without
    /// units.
    fn save_units(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Close the transport, if open.
    async fn disconnect(&mut self);

    fn stats(&self) -> LinkStats;
}

/// Driver for `config.kind`, reporting through `events`.
pub fn build_driver(config: DriverConfig, events: EventSender) -> Box<dyn Driver> {
    match config.kind {
        DriverKind::Zwave => Box::new(ZwaveDriver::new(config, events)),
        DriverKind::Redrat => Box::new(RedRatDriver::new(config, events)),
    }
}
