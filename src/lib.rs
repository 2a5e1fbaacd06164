// MIT License - Copyright (c) 2021 TJForc
//
//! # framelink
//!
//! Protocol engine for home-automation device drivers that talk framed,
//! checksummed request/response protocols over serial ports or TCP.
//!
//! Two protocol families are supported: Z-Wave through a VRCOP interface
//! (line oriented, with per-unit command queues for sleeping devices) and
//! RedRat IR blasters (byte oriented framing with a checksum).
//!
//! Each driver runs on its own task. Callers reach it through a
//! [`DriverHandle`]; values come back as [`DriverEvent`]s.
//!
//! ## Quick Start
//!
//! ```no_run
//! use framelink::{spawn_driver, DriverConfig, DriverEvent, Unit};
//! use framelink::units::device_info::DeviceCatalog;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DriverConfig::builder()
//!         .name("zwave")
//!         .serial("/dev/ttyUSB0", 9600)
//!         .build();
//!     let (driver, task) = spawn_driver(config);
//!
//!     let catalog = DeviceCatalog::builtin();
//!     let mut lamp = Unit::new(4, "Lamp");
//!     lamp.apply_device_info(catalog.get("dimmer").unwrap());
//!     driver.configure_unit(lamp).await?;
//!     let fields = driver.register_fields(1).await?;
//!
//!     let mut events = driver.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let DriverEvent::FieldChanged { field, value } = event {
//!                 println!("{} = {}", fields[(field - 1) as usize].name, value);
//!             }
//!         }
//!     });
//!
//!     driver.poll().await?;
//!     driver.shutdown();
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod event;
pub mod field;
pub mod message;
pub mod persist;
pub mod transport;
pub mod units;
pub mod wait;
pub mod worker;

// Re-exports for convenience
pub use config::{DriverConfig, DriverConfigBuilder, DriverKind, Endpoint, WaitPolicy};
pub use error::{DeviceErrorCode, LinkError, Result};
pub use event::{DriverEvent, EventReceiver};
pub use field::{CommResult, FieldDef, FieldId, FieldValue};
pub use message::{MessageKind, RawMessage};
pub use transport::LinkStats;
pub use units::{Unit, UnitFlags};
pub use worker::{spawn_driver, spawn_with, DriverHandle, DriverState};
