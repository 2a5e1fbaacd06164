// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use framelink::persist;
use framelink::units::device_info::{DeviceCatalog, DeviceInfo};
use framelink::{
    spawn_driver, CommResult, DriverConfig, DriverEvent, DriverHandle, DriverKind, FieldDef,
    FieldId, FieldValue, Unit, UnitFlags,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "framelink2mqtt")]
#[command(about = "Bridge between a framed serial/TCP device driver and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    driver: DriverConfig,
    mqtt: MqttToml,
    #[serde(default)]
    units: Vec<UnitToml>,
    #[serde(default)]
    device_info: Vec<DeviceInfo>,
    /// Unit records are loaded from here when no `[[units]]` are
    /// configured, and written back on shutdown.
    #[serde(default)]
    state_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
    #[serde(default = "default_poll_interval")]
    poll_interval_ms: u64,
}

fn default_client_id() -> String {
    "framelink-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "framelink/cmd".to_string()
}
fn default_publish_topic() -> String {
    "framelink".to_string()
}
fn default_poll_interval() -> u64 {
    250
}

#[derive(Debug, Deserialize)]
struct UnitToml {
    id: u8,
    name: String,
    /// Device-info key, built-in or from `[[device_info]]`
    device: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

fn build_catalog(extra: &[DeviceInfo]) -> DeviceCatalog {
    let mut catalog = DeviceCatalog::builtin();
    for info in extra {
        catalog.insert(info.clone());
    }
    catalog
}

fn build_units(config: &Config, catalog: &DeviceCatalog) -> Result<Vec<Unit>> {
    if config.units.is_empty() {
        return match &config.state_file {
            Some(path) if path.exists() => {
                let data = std::fs::read(path)
                    .with_context(|| format!("Failed to read state file {}", path.display()))?;
                let units = persist::decode_units(&data, catalog)
                    .with_context(|| format!("Invalid state file {}", path.display()))?;
                info!("Loaded {} units from {}", units.len(), path.display());
                Ok(units)
            }
            _ => Ok(Vec::new()),
        };
    }

    config
        .units
        .iter()
        .map(|u| {
            let info = catalog
                .get(&u.device)
                .with_context(|| format!("Unknown device '{}' for unit {}", u.device, u.id))?;
            let flags = if u.enabled { UnitFlags::ENABLED } else { UnitFlags::empty() };
            let mut unit = Unit::new(u.id, u.name.clone())
                .with_flags(flags)
                .with_queue_capacity(config.driver.queue_capacity);
            unit.apply_device_info(info);
            Ok(unit)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share the {now, op, ...} flat structure

// Field updates: {now, op, field, value}
#[derive(Serialize)]
struct MqttFieldEvent<'a> {
    now: u64,
    op: &'static str,
    field: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a FieldValue>,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

// Simple event with {now, op} and an optional detail
#[derive(Serialize)]
struct MqttSimpleEvent {
    now: u64,
    op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    value: Option<FieldValue>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Field lookup in both directions, built once from `register_fields`.
struct FieldNames {
    defs: Vec<FieldDef>,
    by_name: HashMap<String, FieldId>,
    base: FieldId,
}

impl FieldNames {
    fn new(base: FieldId, defs: Vec<FieldDef>) -> Self {
        let by_name = defs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), base + i as FieldId))
            .collect();
        Self { defs, by_name, base }
    }

    fn name(&self, id: FieldId) -> Option<&str> {
        let index = id.checked_sub(self.base)? as usize;
        self.defs.get(index).map(|d| d.name.as_str())
    }

    fn id(&self, name: &str) -> Option<FieldId> {
        self.by_name.get(name).copied()
    }
}

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_cmd_ack(
    client: &AsyncClient,
    topic: &str,
    success: bool,
    src: Option<serde_json::Value>,
    data: Option<serde_json::Value>,
) {
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK".to_string(),
        success,
        src,
        data,
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_simple_event(client: &AsyncClient, topic: &str, op: &str, detail: Option<String>) {
    let msg = MqttSimpleEvent {
        now: now_epoch_ms(),
        op: op.to_string(),
        detail,
    };
    publish_json(client, topic, &msg, false).await;
}

async fn save_state(driver: &DriverHandle, path: &PathBuf) {
    match driver.save_units().await {
        Ok(data) => match std::fs::write(path, &data) {
            Ok(()) => info!("Saved unit state to {}", path.display()),
            Err(e) => warn!("Failed to write state file {}: {e}", path.display()),
        },
        Err(e) => warn!("Failed to save unit state: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Driver event → MQTT
// ---------------------------------------------------------------------------

async fn handle_driver_event(
    event: DriverEvent,
    client: &AsyncClient,
    topic: &str,
    fields: &FieldNames,
) {
    match event {
        DriverEvent::FieldChanged { field, value } => {
            let Some(name) = fields.name(field) else {
                debug!("Value for unregistered field {field}");
                return;
            };
            debug!("{name} = {value}");
            let msg = MqttFieldEvent {
                now: now_epoch_ms(),
                op: "FIELD",
                field: name,
                value: Some(&value),
            };
            publish_json(client, &format!("{topic}/{name}"), &msg, true).await;
        }
        DriverEvent::FieldError { field } => {
            let Some(name) = fields.name(field) else {
                return;
            };
            let msg = MqttFieldEvent {
                now: now_epoch_ms(),
                op: "FIELD_ERROR",
                field: name,
                value: None,
            };
            publish_json(client, &format!("{topic}/{name}"), &msg, true).await;
        }
        DriverEvent::Connected => {
            info!("Driver connected");
            publish_simple_event(client, topic, "CONNECTED", None).await;
        }
        DriverEvent::ConnectionLost { reason } => {
            warn!("Driver connection lost: {reason}");
            publish_simple_event(client, topic, "CONNECTION_LOST", Some(reason)).await;
        }
        DriverEvent::UnitAwake { unit } => {
            debug!("Unit {unit} awake");
        }
        DriverEvent::BadMessage { details } => {
            debug!("Bad message: {details}");
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

fn comm_result_json(result: CommResult) -> Option<serde_json::Value> {
    serde_json::to_value(result).ok()
}

async fn handle_command(
    payload_str: &str,
    cmd: MqttCommand,
    client: &AsyncClient,
    topic: &str,
    driver: &DriverHandle,
    fields: &FieldNames,
) {
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<serde_json::Value>(payload_str).ok();

    match cmd.op.as_str() {
        "PING" => {
            info!("Command: PING");
            publish_cmd_ack(client, topic, true, src_json, None).await;
        }

        "POLL" => {
            debug!("Command: POLL");
            match driver.poll().await {
                Ok(result) => {
                    publish_cmd_ack(client, topic, result.is_success(), src_json, comm_result_json(result))
                        .await;
                }
                Err(e) => {
                    error!("POLL failed: {e}");
                    publish_cmd_ack(client, topic, false, src_json, None).await;
                }
            }
        }

        "WRITE" => {
            let (Some(name), Some(value)) = (cmd.field, cmd.value) else {
                warn!("WRITE requires field and value");
                publish_cmd_ack(client, topic, false, src_json, None).await;
                return;
            };
            let Some(id) = fields.id(&name) else {
                warn!("WRITE to unknown field {name}");
                publish_cmd_ack(client, topic, false, src_json, None).await;
                return;
            };
            info!("Command: WRITE {name} = {value}");
            match driver.write_field(id, value).await {
                Ok(result) => {
                    if !result.is_success() {
                        warn!("WRITE {name}: {result:?}");
                    }
                    publish_cmd_ack(client, topic, result.is_success(), src_json, comm_result_json(result))
                        .await;
                }
                Err(e) => {
                    error!("WRITE {name} failed: {e}");
                    publish_cmd_ack(client, topic, false, src_json, None).await;
                }
            }
        }

        "FIELDS" => {
            debug!("Command: FIELDS");
            let data = serde_json::to_value(&fields.defs).ok();
            publish_cmd_ack(client, topic, true, src_json, data).await;
        }

        "STATS" => {
            debug!("Command: STATS");
            match driver.stats().await {
                Ok(stats) => {
                    publish_cmd_ack(client, topic, true, src_json, serde_json::to_value(stats).ok())
                        .await;
                }
                Err(e) => {
                    error!("STATS failed: {e}");
                    publish_cmd_ack(client, topic, false, src_json, None).await;
                }
            }
        }

        other => {
            warn!("Unknown command: {other}");
            publish_cmd_ack(client, topic, false, src_json, None).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=framelink=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    let (mut mqtt_host, mut mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let catalog = build_catalog(&config.device_info);
        let units = build_units(&config, &catalog)?;

        info!(
            "Starting {:?} driver '{}' on {}",
            config.driver.kind,
            config.driver.name,
            config.driver.endpoint.describe()
        );
        let (driver, driver_task) = spawn_driver(config.driver.clone());
        let driver = Arc::new(driver);
        // Subscribe before the first request so Connected is not missed
        let event_rx = driver.subscribe();

        if config.driver.kind == DriverKind::Zwave {
            for unit in units {
                let id = unit.id();
                driver
                    .configure_unit(unit)
                    .await
                    .with_context(|| format!("Failed to configure unit {id}"))?;
            }
        } else if !units.is_empty() {
            warn!("Driver kind {:?} has no units, ignoring [[units]]", config.driver.kind);
        }

        let defs = driver
            .register_fields(1)
            .await
            .context("Failed to register fields")?;
        info!("Registered {} fields", defs.len());
        let fields = Arc::new(FieldNames::new(1, defs));

        // Set up MQTT
        let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        let subscribe_topic = config.mqtt.subscribe_topic.clone();
        let publish_topic = config.mqtt.publish_topic.clone();

        client
            .subscribe(&subscribe_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to MQTT topic")?;
        info!("MQTT: subscribed to {subscribe_topic}");

        // Task 1: Driver event listener
        let client_events = client.clone();
        let topic_events = publish_topic.clone();
        let fields_events = Arc::clone(&fields);
        let event_handle = tokio::spawn(async move {
            let mut rx = event_rx;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        handle_driver_event(event, &client_events, &topic_events, &fields_events)
                            .await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event receiver lagged, missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("Event channel closed");
                        break;
                    }
                }
            }
        });

        // Task 2: MQTT event loop (receives messages, handles commands)
        let driver_cmds = Arc::clone(&driver);
        let client_cmds = client.clone();
        let topic_cmds = publish_topic.clone();
        let fields_cmds = Arc::clone(&fields);
        let sub_topic = subscribe_topic.clone();
        let mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker restart
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) =
                            client_cmds.subscribe(&sub_topic, QoS::AtLeastOnce).await
                        {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == sub_topic {
                            let payload = String::from_utf8_lossy(&msg.payload);
                            match serde_json::from_str::<MqttCommand>(&payload) {
                                Ok(cmd) => {
                                    if cmd.op == "POLL" {
                                        debug!("MQTT command received: {payload}");
                                    } else {
                                        info!("MQTT command received: {payload}");
                                    }
                                    handle_command(
                                        &payload,
                                        cmd,
                                        &client_cmds,
                                        &topic_cmds,
                                        &driver_cmds,
                                        &fields_cmds,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    warn!("Failed to parse MQTT command: {e}");
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Task 3: Poll ticker. The driver connects lazily on the first poll.
        let driver_poll = Arc::clone(&driver);
        let poll_interval_ms = config.mqtt.poll_interval_ms.max(1);
        let poll_handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(poll_interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match driver_poll.poll().await {
                    Ok(CommResult::Success | CommResult::Idle) => {}
                    Ok(other) => debug!("Poll: {other:?}"),
                    Err(e) => {
                        error!("Poll failed: {e}");
                        break;
                    }
                }
            }
        });

        // Wait for a signal
        info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        // Abort tasks
        mqtt_handle.abort();
        poll_handle.abort();

        if let Some(path) = &config.state_file {
            save_state(&driver, path).await;
        }

        driver.shutdown();
        if let Err(e) = driver_task.await {
            warn!("Driver task ended abnormally: {e}");
        }
        event_handle.abort();

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config) {
            Ok(new_config) => match parse_mqtt_url(&new_config.mqtt.url) {
                Ok((new_host, new_port)) => {
                    mqtt_host = new_host;
                    mqtt_port = new_port;
                    config = new_config;
                    info!("Config reloaded successfully");
                }
                Err(e) => warn!("Invalid MQTT URL in new config, keeping previous: {e}"),
            },
            Err(e) => warn!("Failed to reload config, keeping previous: {e}"),
        }

        info!("Restarting...");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str
        .parse()
        .context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink::field::{FieldAccess, FieldKind};

    #[test]
    fn test_parse_mqtt_url() {
        assert_eq!(parse_mqtt_url("mqtt://broker:1883").unwrap(), ("broker".to_string(), 1883));
        assert_eq!(parse_mqtt_url("tcp://10.0.0.2:1884").unwrap(), ("10.0.0.2".to_string(), 1884));
        assert_eq!(parse_mqtt_url("localhost:1883").unwrap(), ("localhost".to_string(), 1883));
        assert!(parse_mqtt_url("mqtt://broker").is_err());
        assert!(parse_mqtt_url("mqtt://broker:port").is_err());
    }

    #[test]
    fn test_config_parse() {
        let config: Config = toml::from_str(
            r#"
            state_file = "/var/lib/framelink/units.bin"

            [driver]
            name = "downstairs"
            kind = "zwave"
            endpoint = { type = "tcp", host = "10.0.0.5", port = 4001 }

            [mqtt]
            url = "mqtt://broker:1883"

            [[units]]
            id = 4
            name = "Lamp"
            device = "dimmer"

            [[units]]
            id = 9
            name = "Garage"
            device = "garage-relay"
            enabled = false

            [[device_info]]
            key = "garage-relay"
            base_class = 37
            classes = [{ class_id = 37 }]
            "#,
        )
        .unwrap();

        assert_eq!(config.driver.name, "downstairs");
        assert_eq!(config.mqtt.subscribe_topic, "framelink/cmd");
        assert_eq!(config.mqtt.poll_interval_ms, 250);
        assert_eq!(config.units.len(), 2);

        let catalog = build_catalog(&config.device_info);
        let units = build_units(&config, &catalog).unwrap();
        assert_eq!(units[0].info_key(), "dimmer");
        assert!(units[0].flags().contains(UnitFlags::ENABLED));
        assert_eq!(units[1].info_key(), "garage-relay");
        assert!(!units[1].flags().contains(UnitFlags::ENABLED));
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            url = "mqtt://broker:1883"

            [[units]]
            id = 4
            name = "Lamp"
            device = "lava-lamp"
            "#,
        )
        .unwrap();
        let catalog = build_catalog(&config.device_info);
        assert!(build_units(&config, &catalog).is_err());
    }

    #[test]
    fn test_field_names() {
        let defs = vec![
            FieldDef::new("Lamp_Dimmer", FieldKind::Card, FieldAccess::ReadWrite),
            FieldDef::new("Lamp_Battery", FieldKind::Card, FieldAccess::Read),
        ];
        let fields = FieldNames::new(1, defs);
        assert_eq!(fields.name(1), Some("Lamp_Dimmer"));
        assert_eq!(fields.name(2), Some("Lamp_Battery"));
        assert_eq!(fields.name(0), None);
        assert_eq!(fields.name(3), None);
        assert_eq!(fields.id("Lamp_Battery"), Some(2));
        assert_eq!(fields.id("Porch"), None);
    }

    #[test]
    fn test_command_parse() {
        let cmd: MqttCommand =
            serde_json::from_str(r#"{"op":"WRITE","field":"Lamp_Dimmer","value":40}"#).unwrap();
        assert_eq!(cmd.op, "WRITE");
        assert_eq!(cmd.field.as_deref(), Some("Lamp_Dimmer"));
        assert_eq!(cmd.value, Some(FieldValue::Card(40)));

        let cmd: MqttCommand = serde_json::from_str(r#"{"op":"POLL"}"#).unwrap();
        assert!(cmd.field.is_none() && cmd.value.is_none());
    }
}
