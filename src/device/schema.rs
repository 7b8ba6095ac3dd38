use std::collections::BTreeMap;

use tracing::warn;

use crate::config::{DpsSettings, TopicTemplate};
use crate::error::{Error, Result};
use crate::tuya::DpsKey;

use super::color::{ColorComponent, ColorFormat};
use super::formula::Formula;
use super::kind::LightLayout;
use super::transform::NumericTransform;

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    /// Published as `ON`/`OFF`.
    Bool,
    Number(NumericTransform),
    Str,
    /// A subset of the HSB components of a packed color value.
    Color {
        format: ColorFormat,
        components: Vec<ColorComponent>,
    },
}

/// Wiring of one named topic to one data point.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicDescriptor {
    pub key: DpsKey,
    pub kind: ValueKind,
}

impl TopicDescriptor {
    pub fn new(key: DpsKey, kind: ValueKind) -> Self {
        Self { key, kind }
    }
}

/// Named state topics of a device, e.g. `state` or `brightness_state`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicSchema {
    topics: BTreeMap<String, TopicDescriptor>,
}

impl TopicSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, descriptor: TopicDescriptor) -> Self {
        self.topics.insert(name.to_string(), descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TopicDescriptor> {
        self.topics.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TopicDescriptor)> {
        self.topics.iter().map(|(n, d)| (n.as_str(), d))
    }

    /// Every data point referenced by the schema, each listed once.
    pub fn keys(&self) -> Vec<DpsKey> {
        let mut keys: Vec<DpsKey> = self.topics.values().map(|d| d.key).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// The color encoding used by `key`, if any topic decodes it as color.
    pub fn color_format(&self, key: DpsKey) -> Option<ColorFormat> {
        self.topics.values().find_map(|d| match &d.kind {
            ValueKind::Color { format, .. } if d.key == key => Some(*format),
            _ => None,
        })
    }
}

/// State/command formulas for a brightness-like value on `scale`.
///
/// Devices on a 255 scale time out on values below ~10%, so commands are
/// offset into 25..=255 and states are mapped back.
pub fn brightness_formulas(scale: f64) -> Result<(Formula, Formula)> {
    let (state, command) = if scale == 255.0 {
        ("/2.3-10.86".to_string(), "*2.3+25".to_string())
    } else {
        (format!("/({scale}/100)"), format!("*({scale}/100)"))
    };
    Ok((Formula::parse(&state)?, Formula::parse(&command)?))
}

fn power_key(dps: &DpsSettings) -> DpsKey {
    dps.dps_power.unwrap_or(DpsKey(1))
}

pub fn switch(dps: &DpsSettings) -> TopicSchema {
    TopicSchema::new().with("state", TopicDescriptor::new(power_key(dps), ValueKind::Bool))
}

pub fn cover(dps: &DpsSettings) -> TopicSchema {
    TopicSchema::new().with("state", TopicDescriptor::new(power_key(dps), ValueKind::Str))
}

pub fn dimmer(dps: &DpsSettings) -> Result<TopicSchema> {
    let (state, command) = brightness_formulas(dps.brightness_scale.unwrap_or(255.0))?;
    let brightness = NumericTransform::new(true)
        .with_range(None, Some(100.0))
        .with_formulas(Some(state), Some(command));
    Ok(TopicSchema::new()
        .with("state", TopicDescriptor::new(power_key(dps), ValueKind::Bool))
        .with(
            "brightness_state",
            TopicDescriptor::new(
                dps.dps_brightness.unwrap_or(DpsKey(2)),
                ValueKind::Number(brightness),
            ),
        ))
}

pub fn color_light(layout: &LightLayout) -> Result<TopicSchema> {
    let color = |components: &[ColorComponent]| ValueKind::Color {
        format: layout.color_format,
        components: components.to_vec(),
    };
    let (state, command) = brightness_formulas(layout.white_value_scale)?;
    let white = NumericTransform::new(true)
        .with_range(None, Some(100.0))
        .with_formulas(Some(state), Some(command));

    use ColorComponent::{B, H, S};
    let mut schema = TopicSchema::new()
        .with("state", TopicDescriptor::new(layout.power, ValueKind::Bool))
        .with(
            "white_brightness_state",
            TopicDescriptor::new(layout.white_value, ValueKind::Number(white)),
        )
        .with("hs_state", TopicDescriptor::new(layout.color, color(&[H, S])))
        .with("color_brightness_state", TopicDescriptor::new(layout.color, color(&[B])))
        .with("hsb_state", TopicDescriptor::new(layout.color, color(&[H, S, B])))
        .with("mode_state", TopicDescriptor::new(layout.mode, ValueKind::Str));

    if let Some(key) = layout.color_temp {
        let (min, max) = (layout.min_color_temp, layout.max_color_temp);
        let range_factor = (max - min) / 100.0;
        let scale_factor = layout.color_temp_scale / 100.0;
        let tuya_max = (max / range_factor) * scale_factor;
        let temp = NumericTransform::new(true)
            .with_range(Some(min), Some(max))
            .with_formulas(
                Some(Formula::parse(&format!("/{scale_factor}*-{range_factor}+{max}"))?),
                Some(Formula::parse(&format!("/{range_factor}*-{scale_factor}+{tuya_max}"))?),
            );
        schema = schema.with("color_temp_state", TopicDescriptor::new(key, ValueKind::Number(temp)));
    }
    Ok(schema)
}

/// Build a schema from a generic device's `template` block, validating
/// every entry up front.
pub fn from_template(template: &BTreeMap<String, TopicTemplate>) -> Result<TopicSchema> {
    let mut schema = TopicSchema::new();
    for (name, entry) in template {
        let invalid = |reason: String| Error::Config(format!("template topic `{name}`: {reason}"));

        let kind = match entry.value_type.as_str() {
            "bool" => ValueKind::Bool,
            "str" => ValueKind::Str,
            "int" | "float" => {
                if let (Some(min), Some(max)) = (entry.topic_min, entry.topic_max) {
                    if min != 0.0 && max != 0.0 && min > max {
                        return Err(invalid(format!("topicMin {min} exceeds topicMax {max}")));
                    }
                }
                for (label, bound) in [("topicMin", entry.topic_min), ("topicMax", entry.topic_max)] {
                    if bound == Some(0.0) {
                        warn!("Template topic {}: {} of 0 is treated as unbounded", name, label);
                    }
                }
                let state = entry.state_math.as_deref().map(Formula::parse).transpose()?;
                let command = entry.command_math.as_deref().map(Formula::parse).transpose()?;
                ValueKind::Number(
                    NumericTransform::new(entry.value_type == "int")
                        .with_range(entry.topic_min, entry.topic_max)
                        .with_formulas(state, command),
                )
            }
            other => match ColorFormat::parse(other) {
                Some(format) => {
                    let list = entry.components.as_deref().unwrap_or("h,s,b");
                    let components = ColorComponent::parse_list(list)
                        .ok_or_else(|| invalid(format!("bad components `{list}`")))?;
                    ValueKind::Color { format, components }
                }
                None => return Err(invalid(format!("unknown type `{other}`"))),
            },
        };
        schema = schema.with(name, TopicDescriptor::new(entry.key, kind));
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(v: serde_json::Value) -> BTreeMap<String, TopicTemplate> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn dimmer_defaults() {
        let schema = dimmer(&DpsSettings::default()).unwrap();
        assert_eq!(schema.keys(), vec![DpsKey(1), DpsKey(2)]);
        let ValueKind::Number(t) = &schema.get("brightness_state").unwrap().kind else {
            panic!("brightness should be numeric");
        };
        assert_eq!(t.to_wire("100").unwrap().value, json!(255));
        assert_eq!(t.to_wire("150").unwrap().value, json!(255));
    }

    #[test]
    fn color_light_with_color_temp() {
        let layout = LightLayout {
            power: DpsKey(20),
            mode: DpsKey(21),
            white_value: DpsKey(22),
            white_value_scale: 1000.0,
            color_temp: Some(DpsKey(23)),
            min_color_temp: 154.0,
            max_color_temp: 400.0,
            color_temp_scale: 1000.0,
            color: DpsKey(24),
            color_format: ColorFormat::Hsb,
        };
        let schema = color_light(&layout).unwrap();
        assert_eq!(schema.keys(), (20..=24).map(DpsKey).collect::<Vec<_>>());
        assert_eq!(schema.color_format(DpsKey(24)), Some(ColorFormat::Hsb));

        let ValueKind::Number(ct) = &schema.get("color_temp_state").unwrap().kind else {
            panic!("color temp should be numeric");
        };
        // Warmest mired maps to the bottom of the device scale and back.
        assert_eq!(ct.to_wire("400").unwrap().value, json!(0));
        assert_eq!(ct.to_wire("154").unwrap().value, json!(1000));
        assert_eq!(ct.to_topic(&json!(0)), "400");
        assert_eq!(ct.to_topic(&json!(1000)), "154");
    }

    #[test]
    fn template_schema() {
        let schema = from_template(&template(json!({
            "state": {"key": 1, "type": "bool"},
            "temperature_state": {"key": 3, "type": "float", "stateMath": "/10", "commandMath": "*10"},
            "hs_state": {"key": 5, "type": "hsbhex", "components": "h,s"},
        })))
        .unwrap();
        assert_eq!(schema.keys(), vec![DpsKey(1), DpsKey(3), DpsKey(5)]);
        assert_eq!(schema.color_format(DpsKey(5)), Some(ColorFormat::HsbHex));
    }

    #[test]
    fn template_rejects_bad_entries() {
        for bad in [
            json!({"x_state": {"key": 1, "type": "int", "stateMath": "/(10"}}),
            json!({"x_state": {"key": 1, "type": "int", "topicMin": 50, "topicMax": 10}}),
            json!({"x_state": {"key": 1, "type": "percent"}}),
            json!({"x_state": {"key": 1, "type": "hsb", "components": "r,g"}}),
        ] {
            assert!(from_template(&template(bad.clone())).is_err(), "accepted {bad}");
        }
    }
}
