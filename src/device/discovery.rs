//! Home Assistant MQTT discovery payloads.

use serde::Serialize;
use serde_json::{json, Value};

use super::kind::DeviceKind;

/// Device registry block shared by every entity of one physical device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDescriptor {
    pub ids: Vec<String>,
    pub name: String,
    pub mf: String,
    pub mdl: String,
}

pub struct DiscoveryContext<'a> {
    pub discovery_prefix: &'a str,
    /// Device base topic without a trailing slash.
    pub base_topic: &'a str,
    pub id: &'a str,
    pub name: &'a str,
    pub device: &'a DeviceDescriptor,
}

/// Config topic and payload announcing `kind`, or `None` for variants the
/// hub cannot model.
pub fn payload(kind: &DeviceKind, ctx: &DiscoveryContext<'_>) -> Option<(String, Value)> {
    let base = ctx.base_topic;
    let component = match kind {
        DeviceKind::Switch => "switch",
        DeviceKind::Cover => "cover",
        DeviceKind::Dimmer | DeviceKind::ColorLight(_) => "light",
        DeviceKind::Generic { .. } => return None,
    };

    let mut data = json!({
        "name": ctx.name,
        "state_topic": format!("{base}/state"),
        "command_topic": format!("{base}/command"),
        "availability_topic": format!("{base}/status"),
        "payload_available": "online",
        "payload_not_available": "offline",
        "unique_id": ctx.id,
        "device": ctx.device,
    });
    let Some(fields) = data.as_object_mut() else {
        return None;
    };

    match kind {
        DeviceKind::Cover => {
            fields.insert("position_topic".into(), json!(format!("{base}/position")));
            fields.insert("set_position_topic".into(), json!(format!("{base}/set_position")));
            fields.insert("optimistic".into(), json!(true));
        }
        DeviceKind::Dimmer => {
            fields.insert("brightness_state_topic".into(), json!(format!("{base}/brightness_state")));
            fields.insert(
                "brightness_command_topic".into(),
                json!(format!("{base}/brightness_command")),
            );
            fields.insert("brightness_scale".into(), json!(100));
        }
        DeviceKind::ColorLight(light) => {
            fields.insert(
                "brightness_state_topic".into(),
                json!(format!("{base}/color_brightness_state")),
            );
            fields.insert(
                "brightness_command_topic".into(),
                json!(format!("{base}/color_brightness_command")),
            );
            fields.insert("brightness_scale".into(), json!(100));
            fields.insert("hs_state_topic".into(), json!(format!("{base}/hs_state")));
            fields.insert("hs_command_topic".into(), json!(format!("{base}/hs_command")));
            fields.insert(
                "white_value_state_topic".into(),
                json!(format!("{base}/white_brightness_state")),
            );
            fields.insert(
                "white_value_command_topic".into(),
                json!(format!("{base}/white_brightness_command")),
            );
            fields.insert("white_value_scale".into(), json!(100));
            if let Some(layout) = light.layout().filter(|l| l.color_temp.is_some()) {
                fields.insert(
                    "color_temp_state_topic".into(),
                    json!(format!("{base}/color_temp_state")),
                );
                fields.insert(
                    "color_temp_command_topic".into(),
                    json!(format!("{base}/color_temp_command")),
                );
                fields.insert("min_mireds".into(), json!(layout.min_color_temp));
                fields.insert("max_mireds".into(), json!(layout.max_color_temp));
            }
        }
        DeviceKind::Switch | DeviceKind::Generic { .. } => {}
    }

    let topic = format!("{}/{}/{}/config", ctx.discovery_prefix, component, ctx.id);
    Some((topic, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            ids: vec!["abc123".into()],
            name: "Garage Door".into(),
            mf: "Tuya".into(),
            mdl: "Cover".into(),
        }
    }

    #[test]
    fn cover_payload() {
        let device = descriptor();
        let ctx = DiscoveryContext {
            discovery_prefix: "homeassistant",
            base_topic: "tuya/garage_door",
            id: "abc123",
            name: "Garage Door",
            device: &device,
        };
        let (topic, data) = payload(&DeviceKind::Cover, &ctx).unwrap();
        assert_eq!(topic, "homeassistant/cover/abc123/config");
        assert_eq!(data["state_topic"], "tuya/garage_door/state");
        assert_eq!(data["availability_topic"], "tuya/garage_door/status");
        assert_eq!(data["set_position_topic"], "tuya/garage_door/set_position");
        assert_eq!(data["device"]["ids"][0], "abc123");
        assert_eq!(data["device"]["mf"], "Tuya");
        assert_eq!(data["optimistic"], true);
    }

    #[test]
    fn generic_devices_are_not_announced() {
        let device = descriptor();
        let ctx = DiscoveryContext {
            discovery_prefix: "homeassistant",
            base_topic: "tuya/x",
            id: "x",
            name: "x",
            device: &device,
        };
        assert!(payload(&DeviceKind::Generic { mode: None }, &ctx).is_none());
    }
}
