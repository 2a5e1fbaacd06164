// MIT License - Copyright (c) 2021 TJForc

//! Command-class handlers: one per (command class, instance) on a unit.

use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::constants::{class, cmd};
use crate::error::{LinkError, Result};
use crate::field::{FieldAccess, FieldDef, FieldId, FieldKind, FieldStore, FieldValue};

bitflags! {
    /// Handler behaviour flags derived from device info.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HandlerFlags: u8 {
        /// The capability can be queried and produces values
        const READABLE      = 0b0000_0001;
        /// The capability accepts writes
        const WRITABLE      = 0b0000_0010;
        /// Also accept instance-0 reports for this class (devices that omit
        /// the instance on multi-instance traffic)
        const ZERO_INSTANCE = 0b0000_0100;
    }
}

/// The closed set of supported capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Basic,
    BinarySwitch,
    MultilevelSwitch,
    SceneActivation,
    BinarySensor,
    MultilevelSensor,
    ThermostatMode,
    ThermostatSetpoint,
    Battery,
}

/// Setpoint type used for reads and writes (heating).
const SETPOINT_HEATING: u8 = 0x01;

impl Capability {
    pub fn from_class(class_id: u8) -> Option<Self> {
        Some(match class_id {
            class::BASIC => Self::Basic,
            class::SWITCH_BINARY => Self::BinarySwitch,
            class::SWITCH_MULTILEVEL => Self::MultilevelSwitch,
            class::SCENE_ACTIVATION => Self::SceneActivation,
            class::SENSOR_BINARY => Self::BinarySensor,
            class::SENSOR_MULTILEVEL => Self::MultilevelSensor,
            class::THERMOSTAT_MODE => Self::ThermostatMode,
            class::THERMOSTAT_SETPOINT => Self::ThermostatSetpoint,
            class::BATTERY => Self::Battery,
            _ => return None,
        })
    }

    pub fn class_id(&self) -> u8 {
        match self {
            Self::Basic => class::BASIC,
            Self::BinarySwitch => class::SWITCH_BINARY,
            Self::MultilevelSwitch => class::SWITCH_MULTILEVEL,
            Self::SceneActivation => class::SCENE_ACTIVATION,
            Self::BinarySensor => class::SENSOR_BINARY,
            Self::MultilevelSensor => class::SENSOR_MULTILEVEL,
            Self::ThermostatMode => class::THERMOSTAT_MODE,
            Self::ThermostatSetpoint => class::THERMOSTAT_SETPOINT,
            Self::Battery => class::BATTERY,
        }
    }

    /// Suffix used in field names.
    pub fn field_suffix(&self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::BinarySwitch => "Switch",
            Self::MultilevelSwitch => "Dimmer",
            Self::SceneActivation => "Scene",
            Self::BinarySensor => "Sensor",
            Self::MultilevelSensor => "Measure",
            Self::ThermostatMode => "Mode",
            Self::ThermostatSetpoint => "Setpoint",
            Self::Battery => "Battery",
        }
    }

    fn field_kind(&self) -> FieldKind {
        match self {
            Self::BinarySwitch | Self::BinarySensor => FieldKind::Bool,
            Self::MultilevelSensor | Self::ThermostatSetpoint => FieldKind::Float,
            _ => FieldKind::Card,
        }
    }

    fn limits(&self) -> Option<&'static str> {
        match self {
            Self::Basic | Self::SceneActivation => Some("Range: 0, 255"),
            Self::MultilevelSwitch => Some("Range: 0, 99"),
            Self::ThermostatMode => Some("Range: 0, 31"),
            Self::ThermostatSetpoint => Some("Range: -40, 120"),
            Self::Battery => Some("Range: 0, 100"),
            _ => None,
        }
    }

    /// Whether the device can be asked for the current value.
    pub fn queryable(&self) -> bool {
        !matches!(self, Self::SceneActivation)
    }

    /// Whether writes make sense for the capability at all.
    pub fn settable(&self) -> bool {
        matches!(
            self,
            Self::Basic
                | Self::BinarySwitch
                | Self::MultilevelSwitch
                | Self::ThermostatMode
                | Self::ThermostatSetpoint
        )
    }

    /// Command id of the report answering this capability's query.
    pub fn report_command(&self) -> u8 {
        match self {
            Self::MultilevelSensor => cmd::SENSOR_MULTILEVEL_REPORT,
            Self::SceneActivation => cmd::SCENE_ACTIVATION_SET,
            _ => cmd::REPORT,
        }
    }
}

/// One capability instance on a unit and the field bound to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    capability: Capability,
    instance: u8,
    flags: HandlerFlags,
    field: Option<FieldId>,
    initialized: bool,
    last_update: Option<Instant>,
}

impl Handler {
    pub fn new(capability: Capability, instance: u8, flags: HandlerFlags) -> Self {
        Self {
            capability,
            instance,
            flags,
            field: None,
            initialized: false,
            last_update: None,
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn class_id(&self) -> u8 {
        self.capability.class_id()
    }

    pub fn instance(&self) -> u8 {
        self.instance
    }

    pub fn flags(&self) -> HandlerFlags {
        self.flags
    }

    pub fn field(&self) -> Option<FieldId> {
        self.field
    }

    pub fn is_readable(&self) -> bool {
        self.flags.contains(HandlerFlags::READABLE)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(HandlerFlags::WRITABLE) && self.capability.settable()
    }

    pub fn accepts_zero_instance(&self) -> bool {
        self.flags.contains(HandlerFlags::ZERO_INSTANCE)
    }

    /// Field this handler exposes for a unit called `unit_name`.
    pub fn field_def(&self, unit_name: &str) -> FieldDef {
        let mut name = format!("{}_{}", unit_name, self.capability.field_suffix());
        if self.instance > 0 {
            name.push_str(&self.instance.to_string());
        }
        let access = match (self.is_readable(), self.is_writable()) {
            (_, false) => FieldAccess::Read,
            (true, true) => FieldAccess::ReadWrite,
            (false, true) => FieldAccess::Write,
        };
        let def = FieldDef::new(name, self.capability.field_kind(), access);
        match self.capability.limits() {
            Some(limits) => def.with_limits(limits),
            None => def,
        }
    }

    pub fn bind(&mut self, field: FieldId) {
        self.field = Some(field);
    }

    /// Still needs a first value from the device.
    pub fn waiting_for_init(&self) -> bool {
        self.is_readable() && self.capability.queryable() && !self.initialized
    }

    /// No value for longer than `max_age` (or never).
    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        match self.last_update {
            Some(at) => now.saturating_duration_since(at) >= max_age,
            None => true,
        }
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Payload asking the device for the current value.
    pub fn build_query(&self) -> Option<Vec<u8>> {
        if !self.is_readable() || !self.capability.queryable() {
            return None;
        }
        let id = self.class_id();
        Some(match self.capability {
            Capability::MultilevelSensor => vec![id, cmd::SENSOR_MULTILEVEL_GET],
            Capability::ThermostatSetpoint => vec![id, cmd::GET, SETPOINT_HEATING],
            _ => vec![id, cmd::GET],
        })
    }

    /// Payload setting the device to `value`.
    pub fn build_write(&self, value: &FieldValue) -> Result<Vec<u8>> {
        let field = self.field.unwrap_or_default();
        if !self.is_writable() {
            return Err(LinkError::NotWritable { field });
        }
        let invalid = |details: &str| LinkError::InvalidValue {
            field,
            details: details.to_string(),
        };
        let id = self.class_id();

        match self.capability {
            Capability::BinarySwitch => {
                let on = value.as_bool().ok_or_else(|| invalid("expected a boolean"))?;
                Ok(vec![id, cmd::SET, if on { 0xFF } else { 0x00 }])
            }
            Capability::Basic => {
                let level = value
                    .as_card()
                    .filter(|v| *v <= 99 || *v == 255)
                    .ok_or_else(|| invalid("expected 0-99 or 255"))?;
                Ok(vec![id, cmd::SET, level as u8])
            }
            Capability::MultilevelSwitch => {
                let level = value
                    .as_card()
                    .filter(|v| *v <= 99)
                    .ok_or_else(|| invalid("expected 0-99"))?;
                Ok(vec![id, cmd::SET, level as u8])
            }
            Capability::ThermostatMode => {
                let mode = value
                    .as_card()
                    .filter(|v| *v <= 31)
                    .ok_or_else(|| invalid("expected mode 0-31"))?;
                Ok(vec![id, cmd::SET, mode as u8])
            }
            Capability::ThermostatSetpoint => {
                let degrees = value
                    .as_float()
                    .filter(|v| (-40.0..=120.0).contains(v))
                    .ok_or_else(|| invalid("expected -40 to 120 degrees"))?;
                // One decimal of precision, Celsius, two-byte value
                let raw = (degrees * 10.0).round() as i16;
                let [hi, lo] = raw.to_be_bytes();
                Ok(vec![id, cmd::SET, SETPOINT_HEATING, 0x22, hi, lo])
            }
            _ => Err(LinkError::NotWritable { field }),
        }
    }

    /// Parse a report addressed to this handler and push the value to
    /// `store`. Returns whether the report was consumed.
    ///
    /// A basic report is accepted too; the dispatcher only routes those to
    /// the unit's base-class handler.
    pub fn consume_report(
        &mut self,
        report_class: u8,
        command: u8,
        args: &[u8],
        store: &mut dyn FieldStore,
    ) -> bool {
        let parsed = if report_class == class::BASIC && self.capability != Capability::Basic {
            if command != cmd::REPORT {
                return false;
            }
            args.first().map(|v| self.basic_value(*v))
        } else {
            if report_class != self.class_id() || command != self.capability.report_command() {
                return false;
            }
            self.parse_value(args)
        };

        let Some(value) = parsed else {
            if let Some(field) = self.field {
                store.set_error(field);
            }
            return false;
        };

        if let Some(field) = self.field {
            store.store(field, value);
        }
        self.initialized = true;
        self.last_update = Some(Instant::now());
        true
    }

    /// Record a value the device accepted from us.
    pub fn note_written(&mut self, value: &FieldValue, store: &mut dyn FieldStore) {
        if let Some(field) = self.field {
            store.store(field, value.clone());
        }
        self.last_update = Some(Instant::now());
    }

    fn basic_value(&self, v: u8) -> FieldValue {
        match self.capability {
            Capability::BinarySwitch | Capability::BinarySensor => FieldValue::Bool(v != 0),
            Capability::MultilevelSwitch => FieldValue::Card(u32::from(v.min(99))),
            Capability::ThermostatMode => FieldValue::Card(u32::from(v & 0x1F)),
            Capability::Battery => FieldValue::Card(battery_level(v)),
            Capability::MultilevelSensor | Capability::ThermostatSetpoint => {
                FieldValue::Float(f64::from(v))
            }
            Capability::Basic | Capability::SceneActivation => FieldValue::Card(u32::from(v)),
        }
    }

    fn parse_value(&self, args: &[u8]) -> Option<FieldValue> {
        match self.capability {
            Capability::Basic | Capability::SceneActivation => {
                args.first().map(|v| FieldValue::Card(u32::from(*v)))
            }
            Capability::BinarySwitch | Capability::BinarySensor => {
                args.first().map(|v| FieldValue::Bool(*v != 0))
            }
            Capability::MultilevelSwitch => {
                args.first().map(|v| FieldValue::Card(u32::from((*v).min(99))))
            }
            Capability::ThermostatMode => {
                args.first().map(|v| FieldValue::Card(u32::from(*v & 0x1F)))
            }
            Capability::Battery => args.first().map(|v| FieldValue::Card(battery_level(*v))),
            // [sensor type, precision/scale/size, value...]
            Capability::MultilevelSensor => match args {
                [_sensor_type, pss, value @ ..] => decode_scaled(*pss, value),
                _ => None,
            },
            // [setpoint type, precision/scale/size, value...]
            Capability::ThermostatSetpoint => match args {
                [_setpoint_type, pss, value @ ..] => decode_scaled(*pss, value),
                _ => None,
            },
        }
    }
}

/// 0xFF is the low-battery warning.
fn battery_level(raw: u8) -> u32 {
    if raw == 0xFF { 0 } else { u32::from(raw.min(100)) }
}

/// Decode a signed big-endian value whose size and decimal precision are
/// packed in `pss` (precision:3 scale:2 size:3).
fn decode_scaled(pss: u8, bytes: &[u8]) -> Option<FieldValue> {
    let precision = i32::from(pss >> 5);
    let size = usize::from(pss & 0x07);
    let raw = match (size, bytes) {
        (1, [b, ..]) => i64::from(*b as i8),
        (2, [a, b, ..]) => i64::from(i16::from_be_bytes([*a, *b])),
        (4, [a, b, c, d, ..]) => i64::from(i32::from_be_bytes([*a, *b, *c, *d])),
        _ => return None,
    };
    Some(FieldValue::Float(raw as f64 / 10f64.powi(precision)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::CapturedFields;

    fn rw() -> HandlerFlags {
        HandlerFlags::READABLE | HandlerFlags::WRITABLE
    }

    #[test]
    fn test_field_names_and_access() {
        let switch = Handler::new(Capability::BinarySwitch, 0, rw());
        let def = switch.field_def("Porch");
        assert_eq!(def.name, "Porch_Switch");
        assert_eq!(def.access, FieldAccess::ReadWrite);
        assert_eq!(def.kind, FieldKind::Bool);

        let relay = Handler::new(Capability::BinarySwitch, 2, rw());
        assert_eq!(relay.field_def("Pump").name, "Pump_Switch2");

        // Writable flag on a read-only capability is ignored
        let battery = Handler::new(Capability::Battery, 0, rw());
        assert_eq!(battery.field_def("Door").access, FieldAccess::Read);
        assert_eq!(battery.field_def("Door").limits.as_deref(), Some("Range: 0, 100"));
    }

    #[test]
    fn test_queries() {
        let sensor = Handler::new(Capability::MultilevelSensor, 0, HandlerFlags::READABLE);
        assert_eq!(sensor.build_query(), Some(vec![0x31, 0x04]));
        let scene = Handler::new(Capability::SceneActivation, 0, HandlerFlags::READABLE);
        assert_eq!(scene.build_query(), None);
        assert!(!scene.waiting_for_init());
        let silent = Handler::new(Capability::BinarySwitch, 0, HandlerFlags::WRITABLE);
        assert_eq!(silent.build_query(), None);
    }

    #[test]
    fn test_writes() {
        let mut dimmer = Handler::new(Capability::MultilevelSwitch, 0, rw());
        dimmer.bind(7);
        assert_eq!(
            dimmer.build_write(&FieldValue::Card(42)).unwrap(),
            vec![0x26, 0x01, 42]
        );
        assert!(matches!(
            dimmer.build_write(&FieldValue::Card(100)),
            Err(LinkError::InvalidValue { field: 7, .. })
        ));

        let switch = Handler::new(Capability::BinarySwitch, 0, rw());
        assert_eq!(
            switch.build_write(&FieldValue::String("on".into())).unwrap(),
            vec![0x25, 0x01, 0xFF]
        );

        let setpoint = Handler::new(Capability::ThermostatSetpoint, 0, rw());
        assert_eq!(
            setpoint.build_write(&FieldValue::Float(21.5)).unwrap(),
            vec![0x43, 0x01, 0x01, 0x22, 0x00, 0xD7]
        );

        let sensor = Handler::new(Capability::BinarySensor, 0, rw());
        assert!(matches!(
            sensor.build_write(&FieldValue::Bool(true)),
            Err(LinkError::NotWritable { .. })
        ));
    }

    #[test]
    fn test_consume_reports() {
        let mut store = CapturedFields::default();

        let mut switch = Handler::new(Capability::BinarySwitch, 0, rw());
        switch.bind(1);
        assert!(switch.waiting_for_init());
        assert!(switch.consume_report(0x25, 0x03, &[0xFF], &mut store));
        assert!(!switch.waiting_for_init());
        assert_eq!(store.last(1), Some(&FieldValue::Bool(true)));
        assert!(!switch.consume_report(0x25, 0x02, &[], &mut store));
        assert!(!switch.consume_report(0x26, 0x03, &[5], &mut store));

        let mut sensor = Handler::new(Capability::MultilevelSensor, 0, HandlerFlags::READABLE);
        sensor.bind(2);
        // Temperature, precision 1, size 2, 0x00E1 = 225 -> 22.5
        assert!(sensor.consume_report(0x31, 0x05, &[0x01, 0x22, 0x00, 0xE1], &mut store));
        assert_eq!(store.last(2), Some(&FieldValue::Float(22.5)));

        // Truncated report flags the field
        assert!(!sensor.consume_report(0x31, 0x05, &[0x01, 0x22, 0x00], &mut store));
        assert_eq!(store.errors, vec![2]);

        let mut battery = Handler::new(Capability::Battery, 0, HandlerFlags::READABLE);
        battery.bind(3);
        assert!(battery.consume_report(0x80, 0x03, &[0xFF], &mut store));
        assert_eq!(store.last(3), Some(&FieldValue::Card(0)));
    }

    #[test]
    fn test_basic_report_mapping() {
        let mut store = CapturedFields::default();
        let mut dimmer = Handler::new(Capability::MultilevelSwitch, 0, rw());
        dimmer.bind(4);
        assert!(dimmer.consume_report(0x20, 0x03, &[80], &mut store));
        assert_eq!(store.last(4), Some(&FieldValue::Card(80)));
        assert!(!dimmer.consume_report(0x20, 0x01, &[80], &mut store));
    }

    #[test]
    fn test_staleness() {
        let mut store = CapturedFields::default();
        let mut switch = Handler::new(Capability::BinarySwitch, 0, rw());
        let now = Instant::now();
        assert!(switch.is_stale(now, Duration::from_secs(60)));
        switch.consume_report(0x25, 0x03, &[0], &mut store);
        assert!(!switch.is_stale(Instant::now(), Duration::from_secs(60)));
        assert!(switch.is_stale(Instant::now(), Duration::ZERO));
    }
}
