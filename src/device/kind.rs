//! Behaviour that differs between device variants.
//!
//! Each variant contributes its topic schema, an optional initialization
//! step run on every connection, command rerouting, and extra topics
//! derived at publish time.

use serde_json::Value;
use tracing::{debug, info};

use crate::config::{DeviceConfig, DeviceType, DpsSettings};
use crate::error::{Error, Result};
use crate::tuya::{DpsKey, ProtocolClient};

use super::cache::StateCache;
use super::color::{ColorComponent, ColorFormat, Hsb};
use super::schema::{self, TopicDescriptor, TopicSchema, ValueKind};

/// Resolved DPS layout of a color/white light.
#[derive(Debug, Clone, PartialEq)]
pub struct LightLayout {
    pub power: DpsKey,
    pub mode: DpsKey,
    pub white_value: DpsKey,
    pub white_value_scale: f64,
    pub color_temp: Option<DpsKey>,
    pub min_color_temp: f64,
    pub max_color_temp: f64,
    pub color_temp_scale: f64,
    pub color: DpsKey,
    pub color_format: ColorFormat,
}

impl LightLayout {
    /// Consecutive keys from `power`, as found on both known bulb families:
    /// 1-5 with 0-255 scales, or 20-24 with 0-1000 scales.
    fn from_base(power: DpsKey) -> Self {
        let legacy = power == DpsKey(1);
        let scale = if legacy { 255.0 } else { 1000.0 };
        let p = power.0;
        Self {
            power,
            mode: DpsKey(p + 1),
            white_value: DpsKey(p + 2),
            white_value_scale: scale,
            color_temp: Some(DpsKey(p + 3)),
            min_color_temp: 154.0,
            max_color_temp: 400.0,
            color_temp_scale: scale,
            color: DpsKey(p + 4),
            color_format: if legacy {
                ColorFormat::HsbHex
            } else {
                ColorFormat::Hsb
            },
        }
    }

    fn overlay(mut self, dps: &DpsSettings) -> Self {
        if let Some(k) = dps.dps_mode {
            self.mode = k;
        }
        if let Some(k) = dps.dps_white_value {
            self.white_value = k;
        }
        if let Some(s) = dps.white_value_scale {
            self.white_value_scale = s;
        }
        if let Some(k) = dps.dps_color_temp {
            self.color_temp = Some(k);
        }
        if let Some(v) = dps.min_color_temp {
            self.min_color_temp = v;
        }
        if let Some(v) = dps.max_color_temp {
            self.max_color_temp = v;
        }
        if let Some(s) = dps.color_temp_scale {
            self.color_temp_scale = s;
        }
        if let Some(k) = dps.dps_color {
            self.color = k;
        }
        self
    }

    fn is_legacy(&self) -> bool {
        self.power == DpsKey(1)
    }
}

#[derive(Debug, Clone)]
pub struct ColorLight {
    settings: DpsSettings,
    layout: Option<LightLayout>,
}

impl ColorLight {
    pub fn layout(&self) -> Option<&LightLayout> {
        self.layout.as_ref()
    }

    /// Resolve the layout from configuration alone, if it is complete
    /// enough not to need probing.
    fn configured_layout(settings: &DpsSettings) -> Option<LightLayout> {
        let power = settings.dps_power?;
        let format = ColorFormat::parse(settings.color_type.as_deref()?)?;
        let mut layout = LightLayout::from_base(power).overlay(settings);
        if settings.dps_color_temp.is_none() {
            layout.color_temp = None;
        }
        layout.color_format = format;
        Some(layout)
    }

    async fn detect(&self, client: &mut dyn ProtocolClient) -> Result<LightLayout> {
        let mut layout = match self.settings.dps_power {
            Some(power) => {
                let mut layout = LightLayout::from_base(power).overlay(&self.settings);
                if self.settings.dps_color_temp.is_none() {
                    layout.color_temp = None;
                }
                layout
            }
            None => {
                debug!("Attempting to detect light capabilities and DPS values...");
                let base = if looks_like_mode(client.get(DpsKey(2)).await.ok()) {
                    debug!("Detected likely Tuya color bulb at DPS 1-5");
                    DpsKey(1)
                } else if looks_like_mode(client.get(DpsKey(21)).await.ok()) {
                    debug!("Detected likely Tuya color bulb at DPS 20-24");
                    DpsKey(20)
                } else {
                    return Err(Error::Protocol(
                        "automatic detection of light settings failed and no manual configuration"
                            .into(),
                    ));
                };
                let mut layout = LightLayout::from_base(base).overlay(&self.settings);

                if self.settings.dps_color_temp.is_none() {
                    if let Some(key) = layout.color_temp {
                        let scale = layout.color_temp_scale;
                        let supported = client
                            .get(key)
                            .await
                            .ok()
                            .and_then(|v| v.as_f64())
                            .is_some_and(|v| (0.0..=scale).contains(&v));
                        if !supported {
                            debug!("No color temperature support detected");
                            layout.color_temp = None;
                        }
                    }
                }
                layout
            }
        };

        layout.color_format = match self.settings.color_type.as_deref().and_then(ColorFormat::parse) {
            Some(format) => format,
            None => {
                let sample = client.get(layout.color).await.ok();
                let format =
                    ColorFormat::probe(sample.as_ref().and_then(Value::as_str), layout.is_legacy());
                debug!("Detected Tuya color format {:?}", format);
                format
            }
        };
        Ok(layout)
    }
}

fn looks_like_mode(value: Option<Value>) -> bool {
    match value {
        Some(Value::String(s)) => s == "white" || s == "colour" || s.contains("scene"),
        _ => false,
    }
}

/// What to do with a command for a topic the schema does not know.
#[derive(Debug, PartialEq)]
pub enum CommandRoute {
    /// Handle as a command on another topic.
    Reroute { message: String, topic: String },
    /// Recognised but carries nothing to send.
    Ignore,
    /// Not a synthetic topic of this variant.
    Unhandled,
}

#[derive(Debug, Clone)]
pub enum DeviceKind {
    Switch,
    Cover,
    Dimmer,
    ColorLight(ColorLight),
    Generic { mode: Option<DpsKey> },
}

impl DeviceKind {
    /// Build the variant and the part of its schema known from configuration.
    /// A color light without full manual configuration starts with an empty
    /// schema that is filled in on first initialization.
    pub fn from_config(config: &DeviceConfig) -> Result<(Self, TopicSchema)> {
        let dps = &config.dps;
        Ok(match config.device_type {
            DeviceType::Switch => (Self::Switch, schema::switch(dps)),
            DeviceType::Cover => (Self::Cover, schema::cover(dps)),
            DeviceType::Dimmer => (Self::Dimmer, schema::dimmer(dps)?),
            DeviceType::ColorLight => {
                let layout = ColorLight::configured_layout(dps);
                let topics = match &layout {
                    Some(layout) => schema::color_light(layout)?,
                    None => TopicSchema::new(),
                };
                let light = ColorLight {
                    settings: dps.clone(),
                    layout,
                };
                (Self::ColorLight(light), topics)
            }
            DeviceType::Generic => (
                Self::Generic { mode: dps.dps_mode },
                schema::from_template(&config.template)?,
            ),
        })
    }

    pub fn model(&self) -> &'static str {
        match self {
            Self::Switch => "Switch/Socket",
            Self::Cover => "Cover",
            Self::Dimmer => "Dimmer Switch",
            Self::ColorLight(_) => "RGBTW Light",
            Self::Generic { .. } => "Generic Device",
        }
    }

    /// Per-connection setup. Returns a schema when one had to be derived
    /// from the device itself.
    pub async fn initialize(
        &mut self,
        client: &mut dyn ProtocolClient,
    ) -> Result<Option<TopicSchema>> {
        let Self::ColorLight(light) = self else {
            return Ok(None);
        };
        if light.layout.is_some() {
            return Ok(None);
        }
        let layout = light.detect(client).await?;
        info!(
            "Detected light layout: power {}, color {} ({:?})",
            layout.power, layout.color, layout.color_format
        );
        let topics = schema::color_light(&layout)?;
        light.layout = Some(layout);
        Ok(Some(topics))
    }

    /// Data point holding the light's `white`/`colour` mode.
    pub fn mode_key(&self) -> Option<DpsKey> {
        match self {
            Self::ColorLight(light) => light.layout.as_ref().map(|l| l.mode),
            Self::Generic { mode } => *mode,
            _ => None,
        }
    }

    pub fn string_state(&self, value: &Value) -> String {
        let raw = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        match self {
            Self::Cover => match raw.as_str() {
                "open" => "opening".to_string(),
                "close" => "closing".to_string(),
                "stop" => "stopped".to_string(),
                _ => raw,
            },
            _ => raw,
        }
    }

    pub fn route_command(&self, command_topic: &str, message: &str) -> CommandRoute {
        match (self, command_topic) {
            (Self::Cover, "set_position") => {
                let action = match message.trim() {
                    "100" => "close",
                    "0" => "open",
                    _ => return CommandRoute::Ignore,
                };
                CommandRoute::Reroute {
                    message: action.to_string(),
                    topic: "command".to_string(),
                }
            }
            _ => CommandRoute::Unhandled,
        }
    }

    /// Keys that must be republished because `changed` keys were updated.
    pub fn dependent_keys(&self, changed: &[DpsKey]) -> Vec<DpsKey> {
        match self {
            // A mode switch changes how saturation is reported.
            Self::ColorLight(ColorLight {
                layout: Some(layout),
                ..
            }) if changed.contains(&layout.mode) => vec![layout.color],
            _ => Vec::new(),
        }
    }

    /// Extra `(topic, payload)` pairs derived from the cache on publish.
    /// `dirty` holds the keys being published in this pass.
    pub fn publish_overrides(
        &self,
        topics: &TopicSchema,
        cache: &StateCache,
        dirty: &[DpsKey],
    ) -> Vec<(String, String)> {
        match self {
            Self::Cover => {
                let Some(state) = topics.get("state") else {
                    return Vec::new();
                };
                if !dirty.contains(&state.key) {
                    return Vec::new();
                }
                let value = cache.get(state.key).cloned().unwrap_or(Value::Null);
                let position = match self.string_state(&value).as_str() {
                    "opening" => 0,
                    "closing" => 100,
                    _ => 50,
                };
                vec![("position".to_string(), position.to_string())]
            }
            _ => Vec::new(),
        }
    }

    /// Mode a light must be in after a command on `descriptor`, if any.
    pub fn target_mode(
        &self,
        descriptor: &TopicDescriptor,
        command_color: Hsb,
        cache: &StateCache,
    ) -> Option<Value> {
        let Self::ColorLight(ColorLight {
            layout: Some(layout),
            ..
        }) = self
        else {
            return None;
        };
        if descriptor.key == layout.white_value || Some(descriptor.key) == layout.color_temp {
            return Some(Value::from("white"));
        }
        if descriptor.key != layout.color {
            return None;
        }
        match &descriptor.kind {
            ValueKind::Color { components, .. } if components.contains(&ColorComponent::S) => {
                Some(Value::from(if command_color.s < 10 { "white" } else { "colour" }))
            }
            _ => cache.get(layout.mode).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::collections::HashMap;

    struct Probe(HashMap<u32, Value>);

    #[async_trait]
    impl ProtocolClient for Probe {
        async fn find(&mut self) -> Result<()> {
            Ok(())
        }
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn get(&mut self, key: DpsKey) -> Result<Value> {
            self.0.get(&key.0).cloned().ok_or(Error::Timeout("probe"))
        }
        async fn set(&mut self, _dps: Map<String, Value>) -> Result<()> {
            Ok(())
        }
    }

    fn light(settings: DpsSettings) -> DeviceKind {
        DeviceKind::ColorLight(ColorLight {
            layout: ColorLight::configured_layout(&settings),
            settings,
        })
    }

    #[tokio::test]
    async fn detects_20_series_bulb() {
        let mut kind = light(DpsSettings::default());
        let mut client = Probe(HashMap::from([
            (21, json!("colour")),
            (23, json!(500)),
            (24, json!("000003e803e8")),
        ]));
        let topics = kind.initialize(&mut client).await.unwrap().unwrap();
        assert!(topics.get("color_temp_state").is_some());
        assert_eq!(topics.color_format(DpsKey(24)), Some(ColorFormat::Hsb));
        assert_eq!(kind.mode_key(), Some(DpsKey(21)));
        // Second episode reuses the layout.
        assert!(kind.initialize(&mut client).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn detects_legacy_bulb_without_color_temp() {
        let mut kind = light(DpsSettings::default());
        let mut client = Probe(HashMap::from([
            (2, json!("scene_1")),
            (4, json!("")),
            (5, json!("ff00000000ffff")),
        ]));
        let topics = kind.initialize(&mut client).await.unwrap().unwrap();
        assert!(topics.get("color_temp_state").is_none());
        assert_eq!(topics.color_format(DpsKey(5)), Some(ColorFormat::HsbHex));
    }

    #[tokio::test]
    async fn detection_failure_is_an_error() {
        let mut kind = light(DpsSettings::default());
        let mut client = Probe(HashMap::new());
        assert!(kind.initialize(&mut client).await.is_err());
    }

    #[test]
    fn full_manual_configuration_needs_no_probe() {
        let kind = light(DpsSettings {
            dps_power: Some(DpsKey(20)),
            color_type: Some("hsb".into()),
            ..DpsSettings::default()
        });
        let DeviceKind::ColorLight(l) = &kind else {
            unreachable!()
        };
        let layout = l.layout().unwrap();
        assert_eq!(layout.color, DpsKey(24));
        assert_eq!(layout.color_temp, None);
    }

    #[test]
    fn cover_position_commands() {
        let kind = DeviceKind::Cover;
        assert_eq!(
            kind.route_command("set_position", "100"),
            CommandRoute::Reroute {
                message: "close".into(),
                topic: "command".into()
            }
        );
        assert_eq!(
            kind.route_command("set_position", "0"),
            CommandRoute::Reroute {
                message: "open".into(),
                topic: "command".into()
            }
        );
        assert_eq!(kind.route_command("set_position", "40"), CommandRoute::Ignore);
        assert_eq!(kind.route_command("brightness_command", "40"), CommandRoute::Unhandled);
        assert_eq!(kind.string_state(&json!("close")), "closing");
    }

    #[test]
    fn light_mode_arbitration() {
        let kind = light(DpsSettings {
            dps_power: Some(DpsKey(20)),
            dps_color_temp: Some(DpsKey(23)),
            color_type: Some("hsb".into()),
            ..DpsSettings::default()
        });
        let DeviceKind::ColorLight(l) = &kind else {
            unreachable!()
        };
        let topics = schema::color_light(l.layout().unwrap()).unwrap();
        let mut cache = StateCache::new();
        cache.store(DpsKey(21), json!("colour"));
        let pale = Hsb { h: 10, s: 5, b: 80 };
        let vivid = Hsb { h: 10, s: 60, b: 80 };

        let hs = topics.get("hs_state").unwrap();
        let b = topics.get("color_brightness_state").unwrap();
        let ct = topics.get("color_temp_state").unwrap();
        let white = topics.get("white_brightness_state").unwrap();
        let power = topics.get("state").unwrap();

        assert_eq!(kind.target_mode(hs, pale, &cache), Some(json!("white")));
        assert_eq!(kind.target_mode(hs, vivid, &cache), Some(json!("colour")));
        assert_eq!(kind.target_mode(b, pale, &cache), Some(json!("colour")));
        assert_eq!(kind.target_mode(ct, vivid, &cache), Some(json!("white")));
        assert_eq!(kind.target_mode(white, vivid, &cache), Some(json!("white")));
        assert_eq!(kind.target_mode(power, vivid, &cache), None);
        assert_eq!(kind.dependent_keys(&[DpsKey(21)]), vec![DpsKey(24)]);
    }
}
