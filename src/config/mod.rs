use crate::functions::{self, Flags};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
}

fn bridge_id_default() -> String { return "knx-bridge".to_string() }
fn health_interval_default() -> u64 { return 30 }
fn topic_prefix_default() -> String { return "graylogic".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct BridgeSection {
    #[serde(default = "bridge_id_default")]
    pub id: String,
    /// Seconds between health publications
    #[serde(default = "health_interval_default")]
    pub health_interval: u64,
    #[serde(default = "topic_prefix_default")]
    pub topic_prefix: String,
}

fn knxd_url_default() -> String { return "tcp://localhost:6720".to_string() }
fn knxd_connect_timeout_default() -> u64 { return 10 }
fn knxd_read_timeout_default() -> u64 { return 30 }
fn knxd_write_timeout_default() -> u64 { return 5 }
fn knxd_reconnect_interval_default() -> u64 { return 1 }

#[derive(Deserialize, Serialize, Clone)]
pub struct KnxdSection {
    /// unix:///run/knxd or tcp://host:6720
    #[serde(default = "knxd_url_default")]
    pub url: String,
    #[serde(default = "knxd_connect_timeout_default")]
    pub connect_timeout: u64,
    #[serde(default = "knxd_read_timeout_default")]
    pub read_timeout: u64,
    #[serde(default = "knxd_write_timeout_default")]
    pub write_timeout: u64,
    /// Initial reconnect backoff in seconds, grows 1.5x per failure
    #[serde(default = "knxd_reconnect_interval_default")]
    pub reconnect_interval: u64,
}

fn mqtt_broker_url_default() -> String { return "mqtt://localhost:1883".to_string() }
fn mqtt_qos_default() -> u8 { return 1 }
fn mqtt_keepalive_default() -> u64 { return 30 }

#[derive(Deserialize, Serialize, Clone)]
pub struct MqttSection {
    #[serde(default = "mqtt_broker_url_default")]
    pub broker_url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "mqtt_qos_default")]
    pub qos: u8,
    #[serde(default = "mqtt_keepalive_default")]
    pub keepalive: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl MqttSection {
    pub fn client_id_or_default(&self, bridge_id: &str) -> String {
        return match &self.client_id {
            Some(id) => id.clone(),
            None => format!("{}-mqtt", bridge_id),
        };
    }

    /// Split the broker URL into host and port, tolerating a missing
    /// scheme and defaulting the port to 1883.
    pub fn host_port(&self) -> (String, u16) {
        let stripped = self
            .broker_url
            .strip_prefix("mqtt://")
            .or_else(|| self.broker_url.strip_prefix("tcp://"))
            .unwrap_or(&self.broker_url);

        match stripped.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().unwrap_or(1883);
                return (host.to_string(), port);
            }
            None => return (stripped.to_string(), 1883),
        }
    }
}

fn logging_level_default() -> String { return "info".to_string() }
fn logging_format_default() -> String { return "text".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct LoggingSection {
    #[serde(default = "logging_level_default")]
    pub level: String,
    #[serde(default = "logging_format_default")]
    pub format: String,
}

/// One group-address binding of a device function.
#[derive(Deserialize, Serialize, Clone)]
pub struct FunctionConfig {
    pub ga: String,
    #[serde(default)]
    pub dpt: Option<String>,
    #[serde(default)]
    pub flags: Option<Vec<String>>,
}

impl FunctionConfig {
    /// Explicit flags win; otherwise the catalogue default for the
    /// function name; unknown functions default to observe-only.
    pub fn resolved_flags(&self, function_name: &str) -> Flags {
        if let Some(list) = &self.flags {
            let mut flags = Flags::default();
            for flag in list {
                match flag.as_str() {
                    "read" => flags.read = true,
                    "write" => flags.write = true,
                    "transmit" => flags.transmit = true,
                    other => warn!("Unknown flag {:?} on function {}", other, function_name),
                }
            }
            return flags;
        }

        return functions::default_flags(function_name).unwrap_or(Flags::transmit());
    }

    pub fn resolved_dpt(&self, function_name: &str) -> String {
        if let Some(dpt) = &self.dpt {
            return dpt.clone();
        }
        return functions::default_dpt(function_name).unwrap_or("1.001").to_string();
    }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub functions: HashMap<String, FunctionConfig>,
}

fn bridge_default() -> BridgeSection {
    return BridgeSection { id: bridge_id_default(), health_interval: health_interval_default(), topic_prefix: topic_prefix_default() };
}
fn knxd_default() -> KnxdSection {
    return KnxdSection {
        url: knxd_url_default(),
        connect_timeout: knxd_connect_timeout_default(),
        read_timeout: knxd_read_timeout_default(),
        write_timeout: knxd_write_timeout_default(),
        reconnect_interval: knxd_reconnect_interval_default(),
    };
}
fn mqtt_default() -> MqttSection {
    return MqttSection {
        broker_url: mqtt_broker_url_default(),
        client_id: None,
        qos: mqtt_qos_default(),
        keepalive: mqtt_keepalive_default(),
        username: None,
        password: None,
    };
}
fn logging_default() -> LoggingSection {
    return LoggingSection { level: logging_level_default(), format: logging_format_default() };
}
fn devices_default() -> Vec<DeviceConfig> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "bridge_default")]
    pub bridge: BridgeSection,
    #[serde(default = "knxd_default")]
    pub knxd: KnxdSection,
    #[serde(default = "mqtt_default")]
    pub mqtt: MqttSection,
    #[serde(default = "logging_default")]
    pub logging: LoggingSection,
    #[serde(default = "devices_default")]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Check the two usual locations for the config file, then layer the
    /// KNX_BRIDGE_* environment on top.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match File::open("config/knx2mqtt.yaml") {
            Ok(f) => f,
            Err(_) => File::open("knx2mqtt.yaml")?,
        };
        return Self::from_reader(file);
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        return Self::from_reader(File::open(path)?);
    }

    fn from_reader(mut file: File) -> Result<Self, ConfigError> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        return Self::parse(&contents);
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yml::from_str(contents)?;
        config.apply_env_overrides();
        return Ok(config);
    }

    /// Environment overrides follow KNX_BRIDGE_<SECTION>_<KEY>, e.g.
    /// KNX_BRIDGE_MQTT_BROKER_URL or KNX_BRIDGE_KNXD_URL.
    pub fn apply_env_overrides(&mut self) {
        for (name, value) in env::vars() {
            let Some(rest) = name.strip_prefix("KNX_BRIDGE_") else { continue };
            let Some((section, key)) = rest.split_once('_') else { continue };

            let applied = match (section, key) {
                ("BRIDGE", "ID") => { self.bridge.id = value.clone(); true }
                ("BRIDGE", "HEALTH_INTERVAL") => parse_into(&value, &mut self.bridge.health_interval),
                ("BRIDGE", "TOPIC_PREFIX") => { self.bridge.topic_prefix = value.clone(); true }
                ("KNXD", "URL") => { self.knxd.url = value.clone(); true }
                ("KNXD", "CONNECT_TIMEOUT") => parse_into(&value, &mut self.knxd.connect_timeout),
                ("KNXD", "READ_TIMEOUT") => parse_into(&value, &mut self.knxd.read_timeout),
                ("KNXD", "WRITE_TIMEOUT") => parse_into(&value, &mut self.knxd.write_timeout),
                ("KNXD", "RECONNECT_INTERVAL") => parse_into(&value, &mut self.knxd.reconnect_interval),
                ("MQTT", "BROKER_URL") => { self.mqtt.broker_url = value.clone(); true }
                ("MQTT", "CLIENT_ID") => { self.mqtt.client_id = Some(value.clone()); true }
                ("MQTT", "QOS") => parse_into(&value, &mut self.mqtt.qos),
                ("MQTT", "KEEPALIVE") => parse_into(&value, &mut self.mqtt.keepalive),
                ("MQTT", "USERNAME") => { self.mqtt.username = Some(value.clone()); true }
                ("MQTT", "PASSWORD") => { self.mqtt.password = Some(value.clone()); true }
                ("LOGGING", "LEVEL") => { self.logging.level = value.clone(); true }
                ("LOGGING", "FORMAT") => { self.logging.format = value.clone(); true }
                _ => false,
            };

            if applied {
                info!("Config override from environment: {}", name);
            }
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, target: &mut T) -> bool {
    match value.parse() {
        Ok(parsed) => {
            *target = parsed;
            return true;
        }
        Err(_) => {
            warn!("Ignoring unparsable environment override value {:?}", value);
            return false;
        }
    }
}
