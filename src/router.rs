//! Classification of inbound MQTT topics.

use crate::device::DeviceCommand;
use crate::tuya::DpsKey;

/// Hub status topics recognised regardless of configuration.
const BUILTIN_STATUS_TOPICS: [&str; 2] = ["homeassistant/status", "hass/status"];

#[derive(Debug, PartialEq)]
pub enum Route<'a> {
    /// The home automation hub announced itself.
    HubStatus { online: bool },
    /// A command for the device with this topic name (or id).
    Command {
        device: &'a str,
        command: DeviceCommand,
    },
    /// Not addressed to us, or one of our own state topics.
    Ignored,
    /// Looked like a command but could not be parsed.
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct TopicRouter {
    base: String,
    status_topics: Vec<String>,
}

impl TopicRouter {
    pub fn new(base: &str, status_topic: &str) -> Self {
        let mut status_topics = vec![status_topic.to_string()];
        for topic in BUILTIN_STATUS_TOPICS {
            if topic != status_topic {
                status_topics.push(topic.to_string());
            }
        }
        Self {
            base: base.trim_end_matches('/').to_string(),
            status_topics,
        }
    }

    pub fn route<'a>(&self, topic: &'a str, payload: &str) -> Route<'a> {
        if self.status_topics.iter().any(|t| t == topic) {
            return Route::HubStatus {
                online: payload.trim() == "online",
            };
        }

        let Some(rest) = topic
            .strip_prefix(self.base.as_str())
            .and_then(|r| r.strip_prefix('/'))
        else {
            return Route::Ignored;
        };

        let segments: Vec<&str> = rest.split('/').collect();
        let Some(last) = segments.last() else {
            return Route::Ignored;
        };
        if !(last.contains("command") || last.starts_with("set")) {
            return Route::Ignored;
        }

        let message = payload.to_string();
        let command = match segments.as_slice() {
            [_, command_topic] => DeviceCommand::Topic {
                topic: command_topic.to_string(),
                message,
            },
            [_, _, _] => DeviceCommand::Dps { message },
            [_, _, key, _] => match key.parse::<DpsKey>() {
                Ok(key) => DeviceCommand::DpsKey { key, message },
                Err(e) => return Route::Invalid(e.to_string()),
            },
            _ => return Route::Invalid(format!("Invalid command topic {topic}")),
        };
        Route::Command {
            device: segments[0],
            command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TopicRouter {
        TopicRouter::new("tuya", "homeassistant/status")
    }

    #[test]
    fn hub_status_topics() {
        let r = router();
        assert_eq!(
            r.route("homeassistant/status", "online"),
            Route::HubStatus { online: true }
        );
        assert_eq!(
            r.route("hass/status", "offline"),
            Route::HubStatus { online: false }
        );
        let custom = TopicRouter::new("tuya", "hub/birth");
        assert_eq!(
            custom.route("hub/birth", "online"),
            Route::HubStatus { online: true }
        );
        assert_eq!(
            custom.route("hass/status", "online"),
            Route::HubStatus { online: true }
        );
    }

    #[test]
    fn topic_commands() {
        assert_eq!(
            router().route("tuya/lamp/hs_command", "120,50"),
            Route::Command {
                device: "lamp",
                command: DeviceCommand::Topic {
                    topic: "hs_command".into(),
                    message: "120,50".into(),
                },
            }
        );
        assert_eq!(
            router().route("tuya/garage/set_position", "100"),
            Route::Command {
                device: "garage",
                command: DeviceCommand::Topic {
                    topic: "set_position".into(),
                    message: "100".into(),
                },
            }
        );
    }

    #[test]
    fn dps_commands() {
        assert_eq!(
            router().route("tuya/plug/dps/command", r#"{"1":true}"#),
            Route::Command {
                device: "plug",
                command: DeviceCommand::Dps {
                    message: r#"{"1":true}"#.into()
                },
            }
        );
        assert_eq!(
            router().route("tuya/plug/dps/7/command", "42"),
            Route::Command {
                device: "plug",
                command: DeviceCommand::DpsKey {
                    key: DpsKey(7),
                    message: "42".into()
                },
            }
        );
        assert!(matches!(
            router().route("tuya/plug/dps/abc/command", "42"),
            Route::Invalid(_)
        ));
    }

    #[test]
    fn state_and_foreign_topics_are_ignored() {
        let r = router();
        assert_eq!(r.route("tuya/plug/state", "ON"), Route::Ignored);
        assert_eq!(r.route("tuya/plug/dps/1/state", "true"), Route::Ignored);
        assert_eq!(r.route("zigbee/plug/command", "ON"), Route::Ignored);
        assert_eq!(r.route("tuyaplug/command", "ON"), Route::Ignored);
    }

    #[test]
    fn unexpected_depth_is_invalid() {
        assert!(matches!(
            router().route("tuya/plug/extra/deep/nested/command", "ON"),
            Route::Invalid(_)
        ));
    }

    #[test]
    fn depth_alone_selects_the_dps_paths() {
        assert_eq!(
            router().route("tuya/plug/raw/command", r#"{"1":true}"#),
            Route::Command {
                device: "plug",
                command: DeviceCommand::Dps {
                    message: r#"{"1":true}"#.into()
                },
            }
        );
        assert_eq!(
            router().route("tuya/plug/raw/3/command", "on"),
            Route::Command {
                device: "plug",
                command: DeviceCommand::DpsKey {
                    key: DpsKey(3),
                    message: "on".into()
                },
            }
        );
    }

    #[test]
    fn multi_level_base() {
        let r = TopicRouter::new("home/tuya", "homeassistant/status");
        assert_eq!(
            r.route("home/tuya/plug/command", "ON"),
            Route::Command {
                device: "plug",
                command: DeviceCommand::Topic {
                    topic: "command".into(),
                    message: "ON".into(),
                },
            }
        );
    }
}
