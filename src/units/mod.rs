// MIT License - Copyright (c) 2021 TJForc

pub mod device_info;
pub mod handler;

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use bitflags::bitflags;
use tracing::debug;

use crate::constants::UNIT_QUEUE_CAPACITY;
use crate::error::{LinkError, Result};
use crate::field::{FieldDef, FieldId, FieldValue};
use crate::message::MultiType;

use device_info::{build_handlers, DeviceInfo};
use handler::Handler;

bitflags! {
    /// Unit state flags. Persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UnitFlags: u8 {
        /// Configured for use
        const ENABLED = 0b0000_0001;
        /// Stopped answering
        const FAILED  = 0b0000_0010;
        /// Not found in the last network scan
        const MISSING = 0b0000_0100;
    }
}

/// A command held for a sleeping unit until it wakes.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub class_id: u8,
    pub instance: u8,
    /// Complete payload: class, command, arguments.
    pub payload: Vec<u8>,
    /// Value written, echoed to the owning handler's field once sent.
    pub value: Option<FieldValue>,
}

/// One addressed device on the network.
#[derive(Debug, Clone)]
pub struct Unit {
    id: u8,
    name: String,
    flags: UnitFlags,
    info_key: String,
    base_class: u8,
    wakeup: bool,
    multi: MultiType,
    handlers: Vec<Handler>,
    queue: VecDeque<QueuedCommand>,
    queue_capacity: usize,
    last_value: Option<Instant>,
}

impl Unit {
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            flags: UnitFlags::ENABLED,
            info_key: String::new(),
            base_class: 0,
            wakeup: false,
            multi: MultiType::Instance,
            handlers: Vec::new(),
            queue: VecDeque::new(),
            queue_capacity: UNIT_QUEUE_CAPACITY,
            last_value: None,
        }
    }

    pub fn with_flags(mut self, flags: UnitFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> UnitFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: UnitFlags, on: bool) {
        self.flags.set(flag, on);
    }

    pub fn info_key(&self) -> &str {
        &self.info_key
    }

    pub fn base_class(&self) -> u8 {
        self.base_class
    }

    pub fn is_wakeup(&self) -> bool {
        self.wakeup
    }

    pub fn multi(&self) -> MultiType {
        self.multi
    }

    /// Enabled, not failed, present in the last scan.
    pub fn is_viable(&self) -> bool {
        self.flags.contains(UnitFlags::ENABLED)
            && !self.flags.intersects(UnitFlags::FAILED | UnitFlags::MISSING)
    }

    /// Adopt `info`. Handlers are rebuilt only when the key changes;
    /// returns whether they were.
    pub fn apply_device_info(&mut self, info: &DeviceInfo) -> bool {
        if self.info_key == info.key && !self.handlers.is_empty() {
            return false;
        }
        debug!(unit = self.id, "Building handlers for {}", info.key);
        self.info_key = info.key.clone();
        self.base_class = info.base_class;
        self.wakeup = info.wakeup;
        self.multi = info.multi;
        self.handlers = build_handlers(info);
        true
    }

    /// Remember the device-info key without building handlers (load path).
    pub(crate) fn set_info_key(&mut self, key: impl Into<String>) {
        self.info_key = key.into();
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut [Handler] {
        &mut self.handlers
    }

    /// Handler owning (class, instance), if any.
    pub fn handler_index(&self, class_id: u8, instance: u8) -> Option<usize> {
        self.handlers
            .iter()
            .position(|h| h.class_id() == class_id && h.instance() == instance)
    }

    pub fn touch(&mut self) {
        self.last_value = Some(Instant::now());
    }

    pub fn last_value(&self) -> Option<Instant> {
        self.last_value
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Hold `command` until the unit wakes. A full queue is an error.
    pub fn queue_command(&mut self, command: QueuedCommand) -> Result<()> {
        if self.queue.len() >= self.queue_capacity {
            return Err(LinkError::QueueFull {
                unit: self.id,
                capacity: self.queue_capacity,
            });
        }
        self.queue.push_back(command);
        Ok(())
    }

    /// Take every queued command in enqueue order, leaving the queue empty.
    pub fn drain_queue(&mut self) -> Vec<QueuedCommand> {
        self.queue.drain(..).collect()
    }
}

/// Where a registered field lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldBinding {
    pub unit: u8,
    pub handler: usize,
}

/// All units of one driver, ordered by id.
#[derive(Debug, Default)]
pub struct UnitTable {
    units: BTreeMap<u8, Unit>,
    bindings: Vec<FieldBinding>,
    field_base: FieldId,
}

impl UnitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a unit. Field bindings must be re-registered afterwards.
    pub fn insert(&mut self, unit: Unit) {
        self.units.insert(unit.id(), unit);
    }

    pub fn remove(&mut self, id: u8) -> Option<Unit> {
        self.units.remove(&id)
    }

    pub fn get(&self, id: u8) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Unit> {
        self.units.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn ids(&self) -> Vec<u8> {
        self.units.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Enumerate fields for every handler, in unit-id then handler order,
    /// binding ids `base, base+1, ...`. Identical units give identical
    /// output.
    pub fn register_fields(&mut self, base: FieldId) -> Vec<FieldDef> {
        self.field_base = base;
        self.bindings.clear();
        let mut defs = Vec::new();

        for unit in self.units.values_mut() {
            let name = unit.name.clone();
            for (index, handler) in unit.handlers.iter_mut().enumerate() {
                let id = base + defs.len() as FieldId;
                handler.bind(id);
                defs.push(handler.field_def(&name));
                self.bindings.push(FieldBinding {
                    unit: unit.id,
                    handler: index,
                });
            }
        }
        defs
    }

    /// Locate the handler bound to `field`.
    pub fn binding(&self, field: FieldId) -> Option<FieldBinding> {
        let offset = field.checked_sub(self.field_base)?;
        self.bindings.get(offset as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::device_info::DeviceCatalog;

    fn queued(n: u8) -> QueuedCommand {
        QueuedCommand {
            class_id: 0x25,
            instance: 0,
            payload: vec![0x25, 0x01, n],
            value: None,
        }
    }

    #[test]
    fn test_queue_capacity() {
        let mut unit = Unit::new(9, "Door");
        for n in 0..UNIT_QUEUE_CAPACITY as u8 {
            unit.queue_command(queued(n)).unwrap();
        }
        let err = unit.queue_command(queued(99)).unwrap_err();
        assert!(matches!(err, LinkError::QueueFull { unit: 9, capacity: 16 }));
        assert!(err.is_usage());

        let drained = unit.drain_queue();
        assert_eq!(drained.len(), UNIT_QUEUE_CAPACITY);
        assert_eq!(drained[0].payload[2], 0);
        assert_eq!(unit.queue_len(), 0);
    }

    #[test]
    fn test_viability() {
        let unit = Unit::new(1, "A");
        assert!(unit.is_viable());
        assert!(!unit.clone().with_flags(UnitFlags::empty()).is_viable());
        assert!(!unit
            .clone()
            .with_flags(UnitFlags::ENABLED | UnitFlags::MISSING)
            .is_viable());
    }

    #[test]
    fn test_apply_device_info_rebuilds_on_key_change() {
        let catalog = DeviceCatalog::builtin();
        let mut unit = Unit::new(3, "Hall");
        assert!(unit.apply_device_info(catalog.get("dimmer").unwrap()));
        assert!(!unit.apply_device_info(catalog.get("dimmer").unwrap()));
        assert!(unit.apply_device_info(catalog.get("door-sensor").unwrap()));
        assert!(unit.is_wakeup());
        assert_eq!(unit.handlers().len(), 2);
    }

    #[test]
    fn test_register_fields_is_deterministic() {
        let catalog = DeviceCatalog::builtin();
        let build = || {
            let mut table = UnitTable::new();
            let mut b = Unit::new(20, "Relay");
            b.apply_device_info(catalog.get("dual-relay").unwrap());
            let mut a = Unit::new(4, "Lamp");
            a.apply_device_info(catalog.get("dimmer").unwrap());
            table.insert(b);
            table.insert(a);
            table
        };

        let mut first = build();
        let defs = first.register_fields(100);
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Lamp_Dimmer", "Relay_Switch1", "Relay_Switch2"]);
        assert_eq!(build().register_fields(100), defs);

        assert_eq!(
            first.binding(102),
            Some(FieldBinding {
                unit: 20,
                handler: 1
            })
        );
        assert_eq!(first.binding(99), None);
        assert_eq!(first.binding(103), None);
        assert_eq!(first.get(20).unwrap().handlers()[1].field(), Some(102));
    }
}
