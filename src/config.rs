// MIT License - Copyright (c) 2021 TJForc

use std::time::Duration;

use serde::Deserialize;

use crate::constants::{DEFAULT_MIN_SEND_INTERVAL, UNIT_QUEUE_CAPACITY};
use crate::error::{DeviceErrorCode, ProtocolFamily};

/// Which protocol engine a driver instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Leviton VRCOP Z-Wave serial interface (line oriented, unit table)
    Zwave,
    /// RedRat IR blaster (byte oriented, single device)
    Redrat,
}

/// Where the transport connects to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Endpoint {
    Tcp {
        host: String,
        port: u16,
    },
    Serial {
        path: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
}

fn default_baud() -> u32 {
    9600
}

impl Endpoint {
    pub fn describe(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => format!("{}:{}", host, port),
            Endpoint::Serial { path, baud } => format!("{}@{}", path, baud),
        }
    }
}

/// Timing and retry policy for the wait engine.
///
/// All values were tuned empirically against real devices; none of them
/// come from a protocol guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    /// Interface-level ack after a command (default: 500)
    pub ack_timeout_ms: u64,
    /// Data report after a query (default: 1500)
    pub report_timeout_ms: u64,
    /// Mesh transmit acknowledgement (default: 1500)
    pub transmit_ack_timeout_ms: u64,
    /// Keep-alive reply from simple devices (default: 250)
    pub ping_timeout_ms: u64,
    /// Handshake replies during connect (default: 2000)
    pub handshake_timeout_ms: u64,
    /// Total send attempts for send-and-wait-ack (default: 4)
    pub send_attempts: u32,
    /// VRCOP nak codes that trigger a resend instead of failing. Code 0 is
    /// not listed because `<E0` decodes as an ack and never reaches the
    /// retry check.
    pub transient_codes: Vec<u16>,
    /// RedRat error codes that trigger a resend. Empty by default: its
    /// codes describe the request itself, so resending cannot help.
    pub redrat_transient_codes: Vec<u16>,
    /// Whether unit-targeted sends also wait for the transmit ack
    pub require_transmit_ack: bool,
    /// One-time extension of a read deadline once a frame has started (default: 150)
    pub read_extension_ms: u64,
    /// Granularity at which blocked reads check for shutdown (default: 100)
    pub read_tick_ms: u64,
    /// Bound on one write; a write that stalls past it is a lost transport (default: 1000)
    pub write_timeout_ms: u64,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 500,
            report_timeout_ms: 1500,
            transmit_ack_timeout_ms: 1500,
            ping_timeout_ms: 250,
            handshake_timeout_ms: 2000,
            send_attempts: 4,
            transient_codes: vec![3, 4, 6],
            redrat_transient_codes: Vec::new(),
            require_transmit_ack: true,
            read_extension_ms: 150,
            read_tick_ms: 100,
            write_timeout_ms: 1000,
        }
    }
}

impl WaitPolicy {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }

    pub fn transmit_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.transmit_ack_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_extension(&self) -> Duration {
        Duration::from_millis(self.read_extension_ms)
    }

    pub fn read_tick(&self) -> Duration {
        Duration::from_millis(self.read_tick_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Whether `code` is worth a resend, judged against its own family.
    pub fn is_transient(&self, code: DeviceErrorCode) -> bool {
        let codes = match code.family {
            ProtocolFamily::Vrcop => &self.transient_codes,
            ProtocolFamily::RedRat => &self.redrat_transient_codes,
        };
        codes.contains(&code.code)
    }
}

/// Configuration for one driver instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Name used in log spans and MQTT topics
    pub name: String,
    /// Protocol engine
    pub kind: DriverKind,
    /// Transport endpoint
    pub endpoint: Endpoint,
    /// Minimum spacing between two transmissions in milliseconds (default: 50)
    pub min_send_interval_ms: u64,
    /// Wait engine timing
    pub wait: WaitPolicy,
    /// Re-query units whose values are older than this; 0 disables (default: 300000)
    pub active_poll_interval_ms: u64,
    /// Maximum commands held for a sleeping unit (default: 16)
    pub queue_capacity: usize,
    /// Send unit payloads with the secure marker
    pub secure: bool,
    /// Transport open timeout in milliseconds (default: 5000)
    pub connect_timeout_ms: u64,
    /// Base delay between reconnection attempts (default: 5000)
    pub reconnect_delay_ms: u64,
    /// Maximum number of connection retries on transient errors (0 = no retries)
    pub max_connect_retries: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "zwave".to_string(),
            kind: DriverKind::Zwave,
            endpoint: Endpoint::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud: default_baud(),
            },
            min_send_interval_ms: DEFAULT_MIN_SEND_INTERVAL.as_millis() as u64,
            wait: WaitPolicy::default(),
            active_poll_interval_ms: 300_000,
            queue_capacity: UNIT_QUEUE_CAPACITY,
            secure: false,
            connect_timeout_ms: 5000,
            reconnect_delay_ms: 5000,
            max_connect_retries: 3,
        }
    }
}

impl DriverConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }

    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }

    pub fn active_poll_interval(&self) -> Option<Duration> {
        (self.active_poll_interval_ms > 0)
            .then(|| Duration::from_millis(self.active_poll_interval_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Builder for DriverConfig.
#[derive(Debug, Clone, Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn kind(mut self, kind: DriverKind) -> Self {
        self.config.kind = kind;
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    pub fn tcp(self, host: impl Into<String>, port: u16) -> Self {
        self.endpoint(Endpoint::Tcp {
            host: host.into(),
            port,
        })
    }

    pub fn serial(self, path: impl Into<String>, baud: u32) -> Self {
        self.endpoint(Endpoint::Serial {
            path: path.into(),
            baud,
        })
    }

    pub fn min_send_interval_ms(mut self, ms: u64) -> Self {
        self.config.min_send_interval_ms = ms;
        self
    }

    pub fn wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.config.wait = wait;
        self
    }

    pub fn active_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.active_poll_interval_ms = ms;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.config.secure = secure;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_delay_ms = ms;
        self
    }

    pub fn max_connect_retries(mut self, retries: u32) -> Self {
        self.config.max_connect_retries = retries;
        self
    }

    pub fn build(self) -> DriverConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = DriverConfig::builder()
            .name("upstairs")
            .kind(DriverKind::Redrat)
            .tcp("10.0.0.5", 4001)
            .min_send_interval_ms(20)
            .build();

        assert_eq!(config.name, "upstairs");
        assert_eq!(config.kind, DriverKind::Redrat);
        assert_eq!(config.endpoint.describe(), "10.0.0.5:4001");
        assert_eq!(config.min_send_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_wait_policy_defaults() {
        let policy = WaitPolicy::default();
        assert_eq!(policy.send_attempts, 4);
        assert_eq!(policy.read_extension(), Duration::from_millis(150));
        assert!(policy.is_transient(DeviceErrorCode::vrcop(3)));
        assert!(!policy.is_transient(DeviceErrorCode::vrcop(2)));
        // Same numbers, different meaning on a RedRat
        assert!(!policy.is_transient(DeviceErrorCode::redrat(3)));
        assert!(!policy.is_transient(DeviceErrorCode::redrat(6)));
    }

    #[test]
    fn test_active_poll_disabled() {
        let config = DriverConfig::builder().active_poll_interval_ms(0).build();
        assert_eq!(config.active_poll_interval(), None);
    }

    #[test]
    fn test_config_from_toml() {
        let text = r#"
            name = "mesh"
            kind = "zwave"
            queue_capacity = 8

            [endpoint]
            type = "serial"
            path = "/dev/ttyS1"

            [wait]
            ack_timeout_ms = 800
            transient_codes = [3]
        "#;
        let config: DriverConfig = toml::from_str(text).unwrap();
        assert_eq!(config.name, "mesh");
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(
            config.endpoint,
            Endpoint::Serial {
                path: "/dev/ttyS1".into(),
                baud: 9600
            }
        );
        assert_eq!(config.wait.ack_timeout_ms, 800);
        assert_eq!(config.wait.report_timeout_ms, 1500);
        assert_eq!(config.wait.transient_codes, vec![3]);
    }
}
