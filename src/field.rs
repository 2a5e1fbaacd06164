// MIT License - Copyright (c) 2021 TJForc

//! The boundary between a driver and the external field engine.
//!
//! The field engine asks a driver to enumerate its fields, hands back
//! writes as `(FieldId, FieldValue)` pairs, and receives value updates
//! through a [`FieldStore`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{DriverEvent, EventSender};

/// Dense id assigned at registration time. Runtime-derived; never persisted.
pub type FieldId = u32;

/// Data type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    Card,
    Int,
    Float,
    String,
}

/// Read/write access of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldAccess {
    Read,
    Write,
    ReadWrite,
}

impl FieldAccess {
    pub fn readable(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Description of one field to be created by the field engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub access: FieldAccess,
    /// Limit string in the form `Range: lo, hi` or `Enum: a, b, c`.
    pub limits: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind, access: FieldAccess) -> Self {
        Self {
            name: name.into(),
            kind,
            access,
            limits: None,
        }
    }

    pub fn with_limits(mut self, limits: impl Into<String>) -> Self {
        self.limits = Some(limits.into());
        self
    }
}

/// A field value crossing the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Card(u32),
    Int(i32),
    Float(f64),
    String(String),
}

impl FieldValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Card(c) => Some(*c != 0),
            Self::Int(i) => Some(*i != 0),
            Self::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
            Self::Float(_) => None,
        }
    }

    pub fn as_card(&self) -> Option<u32> {
        match self {
            Self::Card(c) => Some(*c),
            Self::Int(i) => u32::try_from(*i).ok(),
            Self::Bool(b) => Some(u32::from(*b)),
            Self::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Some(*f as u32),
            Self::String(s) => s.trim().parse().ok(),
            Self::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Card(c) => Some(f64::from(*c)),
            Self::Int(i) => Some(f64::from(*i)),
            Self::String(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Card(c) => write!(f, "{}", c),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// Result reported back to the field engine for a poll or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommResult {
    Success,
    /// Nothing needed doing this cycle.
    Idle,
    ValueRejected,
    Failed,
    LostConnection,
}

impl CommResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::Idle)
    }
}

/// Out-of-band callback used by handlers whenever they parse a value.
pub trait FieldStore: Send {
    fn store(&mut self, field: FieldId, value: FieldValue);
    fn set_error(&mut self, field: FieldId);
}

impl FieldStore for EventSender {
    fn store(&mut self, field: FieldId, value: FieldValue) {
        let _ = self.send(DriverEvent::FieldChanged { field, value });
    }

    fn set_error(&mut self, field: FieldId) {
        let _ = self.send(DriverEvent::FieldError { field });
    }
}

/// Capturing store, handy in tests and for one-shot reads.
#[derive(Debug, Default)]
pub struct CapturedFields {
    pub values: Vec<(FieldId, FieldValue)>,
    pub errors: Vec<FieldId>,
}

impl CapturedFields {
    pub fn last(&self, field: FieldId) -> Option<&FieldValue> {
        self.values
            .iter()
            .rev()
            .find(|(id, _)| *id == field)
            .map(|(_, v)| v)
    }
}

impl FieldStore for CapturedFields {
    fn store(&mut self, field: FieldId, value: FieldValue) {
        self.values.push((field, value));
    }

    fn set_error(&mut self, field: FieldId) {
        self.errors.push(field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_coercion() {
        assert_eq!(FieldValue::String("on".into()).as_bool(), Some(true));
        assert_eq!(FieldValue::Int(-1).as_card(), None);
        assert_eq!(FieldValue::Float(42.0).as_card(), Some(42));
        assert_eq!(FieldValue::Float(4.5).as_card(), None);
        assert_eq!(FieldValue::Card(7).as_float(), Some(7.0));
    }

    #[test]
    fn test_untagged_json() {
        let v: FieldValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, FieldValue::Bool(true));
        let v: FieldValue = serde_json::from_str("\"ab\"").unwrap();
        assert_eq!(v, FieldValue::String("ab".into()));
    }

    #[test]
    fn test_captured_last() {
        let mut c = CapturedFields::default();
        c.store(1, FieldValue::Card(1));
        c.store(2, FieldValue::Card(5));
        c.store(1, FieldValue::Card(9));
        assert_eq!(c.last(1), Some(&FieldValue::Card(9)));
        assert_eq!(c.last(3), None);
    }
}
