// MIT License - Copyright (c) 2021 TJForc

use std::time::Duration;

/// VRCOP framing bytes.
pub const VRCOP_HOST_START: u8 = b'>';
pub const VRCOP_DEVICE_START: u8 = b'<';
pub const VRCOP_DIVIDER: u8 = b'|';
pub const VRCOP_CONTINUATION: u8 = b'\\';
pub const CR: u8 = b'\r';
pub const LF: u8 = b'\n';

/// Soft maximum length of one VRCOP line before the device splits it.
pub const VRCOP_MAX_LINE: usize = 128;
/// Hard cap on a single line read; anything longer is garbage.
pub const VRCOP_LINE_LIMIT: usize = 1024;

/// RedRat framing bytes.
pub const REDRAT_OPEN: u8 = b'[';
pub const REDRAT_DIVIDER: u8 = b'#';
pub const REDRAT_CLOSE: u8 = b']';
pub const REDRAT_PROMPT: u8 = b'>';

/// Z-Wave command class identifiers used by the handlers and the dispatcher.
pub mod class {
    pub const BASIC: u8 = 0x20;
    pub const SWITCH_BINARY: u8 = 0x25;
    pub const SWITCH_MULTILEVEL: u8 = 0x26;
    pub const SCENE_ACTIVATION: u8 = 0x2B;
    pub const SENSOR_BINARY: u8 = 0x30;
    pub const SENSOR_MULTILEVEL: u8 = 0x31;
    pub const THERMOSTAT_MODE: u8 = 0x40;
    pub const THERMOSTAT_SETPOINT: u8 = 0x43;
    pub const MULTI_INSTANCE: u8 = 0x60;
    pub const BATTERY: u8 = 0x80;
    pub const WAKE_UP: u8 = 0x84;
}

/// Command identifiers within the command classes above.
pub mod cmd {
    pub const SET: u8 = 0x01;
    pub const GET: u8 = 0x02;
    pub const REPORT: u8 = 0x03;

    pub const SENSOR_MULTILEVEL_GET: u8 = 0x04;
    pub const SENSOR_MULTILEVEL_REPORT: u8 = 0x05;

    pub const SCENE_ACTIVATION_SET: u8 = 0x01;

    pub const MULTI_INSTANCE_ENCAP: u8 = 0x06;
    pub const MULTI_CHANNEL_ENCAP: u8 = 0x0D;

    pub const WAKE_UP_NOTIFICATION: u8 = 0x07;
    pub const WAKE_UP_NO_MORE_INFORMATION: u8 = 0x08;
}

/// Source-channel byte placed ahead of the target channel in channel encapsulation.
pub const CHANNEL_ENCAP_LEAD: u8 = 1;

/// Maximum number of commands held for a sleeping unit.
pub const UNIT_QUEUE_CAPACITY: usize = 16;

/// Default spacing between two consecutive transmissions.
pub const DEFAULT_MIN_SEND_INTERVAL: Duration = Duration::from_millis(50);

/// Persistence record markers.
pub const RECORD_START: u8 = 0xA5;
pub const RECORD_END: u8 = 0x5A;
