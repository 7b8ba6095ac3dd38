use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::tuya::DpsKey;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Base topic every device topic lives under.
    pub topic_prefix: String,
    pub discovery_prefix: String,
    /// Hub birth topic; an `online` message here triggers a republish.
    pub status_topic: String,
    pub client_id: String,
}

/// Device variant selected by the `type` field of the devices file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    Switch,
    Cover,
    Dimmer,
    ColorLight,
    #[default]
    Generic,
}

impl DeviceType {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("SimpleSwitch") => Self::Switch,
            Some("SimpleCover") => Self::Cover,
            Some("SimpleDimmer") => Self::Dimmer,
            Some("RGBTWLight") => Self::ColorLight,
            _ => Self::Generic,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub key: String,
    pub ip: IpAddr,
    pub version: String,
    pub name: String,
    /// Sanitized name (or the id) used as the device's topic segment.
    pub topic_name: String,
    pub device_type: DeviceType,
    pub dps: DpsSettings,
    pub template: BTreeMap<String, TopicTemplate>,
}

/// Optional per-device DPS layout overrides. Unset fields fall back to
/// the defaults of the device variant (or to auto-detection for lights).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DpsSettings {
    pub dps_power: Option<DpsKey>,
    pub dps_brightness: Option<DpsKey>,
    pub brightness_scale: Option<f64>,
    pub dps_mode: Option<DpsKey>,
    pub dps_white_value: Option<DpsKey>,
    pub white_value_scale: Option<f64>,
    pub dps_color_temp: Option<DpsKey>,
    pub min_color_temp: Option<f64>,
    pub max_color_temp: Option<f64>,
    pub color_temp_scale: Option<f64>,
    pub dps_color: Option<DpsKey>,
    pub color_type: Option<String>,
}

/// One entry of a generic device's `template` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicTemplate {
    pub key: DpsKey,
    #[serde(rename = "type")]
    pub value_type: String,
    pub topic_min: Option<f64>,
    pub topic_max: Option<f64>,
    pub state_math: Option<String>,
    pub command_math: Option<String>,
    pub components: Option<String>,
}

#[derive(Deserialize)]
struct RawDevice {
    id: String,
    key: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default, rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    template: Option<BTreeMap<String, TopicTemplate>>,
    #[serde(flatten)]
    dps: DpsSettings,
}

fn env_required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::Config(format!("{key} environment variable is required")))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let content = std::fs::read_to_string(&devices_file)
            .map_err(|e| Error::Config(format!("Failed to read {devices_file}: {e}")))?;
        let devices = parse_devices(&content)?;

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required("MQTT_BROKER_HOST")?,
                broker_port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", "tuya".to_string()),
                discovery_prefix: env_or_default(
                    "MQTT_DISCOVERY_PREFIX",
                    "homeassistant".to_string(),
                ),
                status_topic: env_or_default(
                    "MQTT_STATUS_TOPIC",
                    "homeassistant/status".to_string(),
                ),
                client_id: env_or_default("MQTT_CLIENT_ID", "tuya-mqtt".to_string()),
            },
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.broker_host.is_empty() {
            return Err(Error::Config("MQTT_BROKER_HOST must not be empty".into()));
        }
        if self.mqtt.topic_prefix.is_empty() {
            return Err(Error::Config("MQTT_TOPIC_PREFIX must not be empty".into()));
        }
        if self.devices.is_empty() {
            return Err(Error::Config("No devices found in devices file".into()));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(Error::Config(format!("Duplicate device id {}", device.id)));
            }
        }
        Ok(())
    }

    pub fn bridge_status_topic(&self) -> String {
        format!("{}/bridge_status", self.mqtt.topic_prefix)
    }
}

impl DeviceConfig {
    /// Base topic for this device, without a trailing slash.
    pub fn base_topic(&self, prefix: &str) -> String {
        format!("{}/{}", prefix, self.topic_name)
    }
}

pub fn parse_devices(content: &str) -> Result<Vec<DeviceConfig>> {
    let raw_devices: Vec<RawDevice> = serde_json::from_str(content)
        .map_err(|e| Error::Config(format!("Failed to parse devices file: {e}")))?;

    raw_devices
        .into_iter()
        .map(|raw| {
            let ip: IpAddr = raw
                .ip
                .as_deref()
                .ok_or_else(|| Error::Config(format!("Device {} missing 'ip' field", raw.id)))?
                .parse()
                .map_err(|e| Error::Config(format!("Device {} invalid IP: {e}", raw.id)))?;

            let topic_name = raw
                .name
                .as_deref()
                .map(sanitize_topic_name)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| raw.id.clone());
            let name = raw.name.unwrap_or_else(|| raw.id.clone());

            Ok(DeviceConfig {
                name,
                topic_name,
                id: raw.id,
                key: raw.key,
                ip,
                version: raw.version.unwrap_or_else(|| "3.1".to_string()),
                device_type: DeviceType::parse(raw.device_type.as_deref()),
                dps: raw.dps,
                template: raw.template.unwrap_or_default(),
            })
        })
        .collect()
}

/// Convert a device name into a safe MQTT topic segment.
/// "Porch Light/Left" → "porch_light_left"
fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_whitespace() || matches!(c, '+' | '#' | '/') {
                '_'
            } else {
                c
            }
        })
        .collect::<String>()
        .to_lowercase()
}
