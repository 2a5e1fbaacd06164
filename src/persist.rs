// MIT License - Copyright (c) 2021 TJForc

//! Versioned binary records for configured units.
//!
//! Each record is `START, type tag, version (u16 BE), fields..., END`. Only
//! configuration is written; handlers, field ids and timestamps are rebuilt
//! from the device-info key after loading.

use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

use crate::constants::{RECORD_END, RECORD_START};
use crate::error::{LinkError, Result};
use crate::units::device_info::DeviceCatalog;
use crate::units::{Unit, UnitFlags};

/// Record type tag for a unit.
pub const RECORD_UNIT: u8 = 0x01;

/// Current unit record layout.
pub const UNIT_RECORD_VERSION: u16 = 1;

fn persist_error(details: impl Into<String>) -> LinkError {
    LinkError::Persist {
        details: details.into(),
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| persist_error("string too long"))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u8(buf: &mut &[u8], what: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(persist_error(format!("truncated before {}", what)));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], what: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(persist_error(format!("truncated before {}", what)));
    }
    Ok(buf.get_u16())
}

fn get_str(buf: &mut &[u8], what: &str) -> Result<String> {
    let len = usize::from(get_u16(buf, what)?);
    if buf.remaining() < len {
        return Err(persist_error(format!("truncated {}", what)));
    }
    let text = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| persist_error(format!("{} is not UTF-8", what)))?;
    buf.advance(len);
    Ok(text)
}

/// Write one record per unit, in table order.
pub fn encode_units<'a>(units: impl IntoIterator<Item = &'a Unit>) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    for unit in units {
        buf.put_u8(RECORD_START);
        buf.put_u8(RECORD_UNIT);
        buf.put_u16(UNIT_RECORD_VERSION);
        buf.put_u8(unit.id());
        buf.put_u8(unit.flags().bits());
        put_str(&mut buf, unit.name())?;
        put_str(&mut buf, unit.info_key())?;
        buf.put_u8(RECORD_END);
    }
    Ok(buf)
}

/// Read unit records. Handlers are rebuilt from `catalog`; a unit whose key
/// is not in the catalog loads without handlers.
///
/// Any framing problem or an unsupported version fails the whole load.
pub fn decode_units(data: &[u8], catalog: &DeviceCatalog) -> Result<Vec<Unit>> {
    let mut buf = data;
    let mut units = Vec::new();

    while buf.has_remaining() {
        let start = get_u8(&mut buf, "start marker")?;
        if start != RECORD_START {
            return Err(persist_error(format!("bad start marker {:#04x}", start)));
        }
        let tag = get_u8(&mut buf, "record type")?;
        if tag != RECORD_UNIT {
            return Err(persist_error(format!("unknown record type {:#04x}", tag)));
        }
        let version = get_u16(&mut buf, "version")?;
        if version == 0 || version > UNIT_RECORD_VERSION {
            return Err(persist_error(format!("unsupported unit record version {}", version)));
        }

        let id = get_u8(&mut buf, "unit id")?;
        let flags = UnitFlags::from_bits_truncate(get_u8(&mut buf, "flags")?);
        let name = get_str(&mut buf, "name")?;
        let key = get_str(&mut buf, "device key")?;

        let end = get_u8(&mut buf, "end marker")?;
        if end != RECORD_END {
            return Err(persist_error(format!("bad end marker {:#04x}", end)));
        }

        let mut unit = Unit::new(id, name).with_flags(flags);
        match catalog.get(&key) {
            Some(info) => {
                unit.apply_device_info(info);
            }
            None => {
                if !key.is_empty() {
                    warn!(unit = id, "Unknown device key {}, no handlers", key);
                }
                unit.set_info_key(key);
            }
        }
        units.push(unit);
    }
    Ok(units)
}
