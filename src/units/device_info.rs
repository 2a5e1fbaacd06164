// MIT License - Copyright (c) 2021 TJForc

//! Device descriptions and the handler sets derived from them.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use tracing::debug;

use crate::constants::class;
use crate::message::MultiType;
use crate::units::handler::{Capability, Handler, HandlerFlags};

/// One command class a device supports.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClassSpec {
    pub class_id: u8,
    #[serde(default)]
    pub instance: u8,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub zero_instance: bool,
}

fn default_true() -> bool {
    true
}

impl ClassSpec {
    pub fn new(class_id: u8) -> Self {
        Self {
            class_id,
            instance: 0,
            readable: true,
            writable: false,
            zero_instance: false,
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn instance(mut self, instance: u8) -> Self {
        self.instance = instance;
        self
    }

    pub fn zero_instance(mut self) -> Self {
        self.zero_instance = true;
        self
    }

    fn flags(&self) -> HandlerFlags {
        let mut flags = HandlerFlags::empty();
        flags.set(HandlerFlags::READABLE, self.readable);
        flags.set(HandlerFlags::WRITABLE, self.writable);
        flags.set(HandlerFlags::ZERO_INSTANCE, self.zero_instance);
        flags
    }
}

/// What a unit is: its classes, which one answers basic traffic, and
/// whether it sleeps.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceInfo {
    pub key: String,
    pub base_class: u8,
    #[serde(default)]
    pub wakeup: bool,
    #[serde(default)]
    pub multi: MultiType,
    pub classes: Vec<ClassSpec>,
}

/// Derive the handler set for `info`. Deterministic: classes are taken in
/// listed order, unknown classes are skipped, and a repeated
/// (class, instance) pair keeps its first entry.
pub fn build_handlers(info: &DeviceInfo) -> Vec<Handler> {
    let mut seen = HashSet::new();
    let mut handlers = Vec::with_capacity(info.classes.len());

    for spec in &info.classes {
        let Some(capability) = Capability::from_class(spec.class_id) else {
            debug!(
                "Device {} lists unsupported class {:#04x}",
                info.key, spec.class_id
            );
            continue;
        };
        if !seen.insert((spec.class_id, spec.instance)) {
            continue;
        }
        handlers.push(Handler::new(capability, spec.instance, spec.flags()));
    }
    handlers
}

/// Known device descriptions by key.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    entries: BTreeMap<String, DeviceInfo>,
}

impl DeviceCatalog {
    /// Catalog holding the built-in descriptions.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        let entries = [
            DeviceInfo {
                key: "binary-switch".into(),
                base_class: class::SWITCH_BINARY,
                wakeup: false,
                multi: MultiType::Instance,
                classes: vec![ClassSpec::new(class::SWITCH_BINARY).writable()],
            },
            DeviceInfo {
                key: "dimmer".into(),
                base_class: class::SWITCH_MULTILEVEL,
                wakeup: false,
                multi: MultiType::Instance,
                classes: vec![ClassSpec::new(class::SWITCH_MULTILEVEL).writable()],
            },
            DeviceInfo {
                key: "dual-relay".into(),
                base_class: class::SWITCH_BINARY,
                wakeup: false,
                multi: MultiType::Channel,
                classes: vec![
                    ClassSpec::new(class::SWITCH_BINARY)
                        .instance(1)
                        .writable()
                        .zero_instance(),
                    ClassSpec::new(class::SWITCH_BINARY).instance(2).writable(),
                ],
            },
            DeviceInfo {
                key: "door-sensor".into(),
                base_class: class::SENSOR_BINARY,
                wakeup: true,
                multi: MultiType::Instance,
                classes: vec![
                    ClassSpec::new(class::SENSOR_BINARY),
                    ClassSpec::new(class::BATTERY),
                ],
            },
            DeviceInfo {
                key: "thermostat".into(),
                base_class: class::THERMOSTAT_MODE,
                wakeup: false,
                multi: MultiType::Instance,
                classes: vec![
                    ClassSpec::new(class::THERMOSTAT_MODE).writable(),
                    ClassSpec::new(class::THERMOSTAT_SETPOINT).writable(),
                    ClassSpec::new(class::SENSOR_MULTILEVEL),
                ],
            },
            DeviceInfo {
                key: "multisensor".into(),
                base_class: class::SENSOR_MULTILEVEL,
                wakeup: true,
                multi: MultiType::Instance,
                classes: vec![
                    ClassSpec::new(class::SENSOR_MULTILEVEL),
                    ClassSpec::new(class::SENSOR_BINARY),
                    ClassSpec::new(class::BATTERY),
                ],
            },
            DeviceInfo {
                key: "scene-controller".into(),
                base_class: class::SCENE_ACTIVATION,
                wakeup: true,
                multi: MultiType::Instance,
                classes: vec![
                    ClassSpec::new(class::SCENE_ACTIVATION),
                    ClassSpec::new(class::BATTERY),
                ],
            },
        ];
        for info in entries {
            catalog.insert(info);
        }
        catalog
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, info: DeviceInfo) {
        self.entries.insert(info.key.clone(), info);
    }

    pub fn get(&self, key: &str) -> Option<&DeviceInfo> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = DeviceCatalog::builtin();
        assert_eq!(catalog.keys().count(), 7);
        let relay = catalog.get("dual-relay").unwrap();
        assert_eq!(relay.multi, MultiType::Channel);

        let handlers = build_handlers(relay);
        assert_eq!(handlers.len(), 2);
        assert!(handlers[0].accepts_zero_instance());
        assert!(!handlers[1].accepts_zero_instance());
        assert_eq!(handlers[1].instance(), 2);
    }

    #[test]
    fn test_build_handlers_deterministic() {
        let info = DeviceInfo {
            key: "odd".into(),
            base_class: class::SWITCH_BINARY,
            wakeup: false,
            multi: MultiType::Instance,
            classes: vec![
                ClassSpec::new(class::SWITCH_BINARY).writable(),
                ClassSpec::new(0x9F),
                ClassSpec::new(class::SWITCH_BINARY),
                ClassSpec::new(class::BATTERY),
            ],
        };
        let first = build_handlers(&info);
        let second = build_handlers(&info);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first[0].is_writable());
        assert_eq!(first[1].capability(), Capability::Battery);
    }

    #[test]
    fn test_device_info_from_toml() {
        let text = r#"
            key = "garage"
            base_class = 37
            multi = "channel"

            [[classes]]
            class_id = 37
            writable = true

            [[classes]]
            class_id = 48
            instance = 2
            readable = false
        "#;
        let info: DeviceInfo = toml::from_str(text).unwrap();
        assert!(!info.wakeup);
        assert_eq!(info.multi, MultiType::Channel);
        assert!(info.classes[0].readable);
        assert!(!info.classes[1].readable);
        assert_eq!(info.classes[1].instance, 2);
    }
}
