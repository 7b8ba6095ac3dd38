//! Fan-out of inbound MQTT traffic to the device tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::device::DeviceEvent;
use crate::mqtt::MqttMessage;
use crate::router::{Route, TopicRouter};

/// Quiet period before re-announcing devices to a restarted hub.
const HUB_SETTLE_DELAY: Duration = Duration::from_secs(30);
const REPUBLISH_PASSES: usize = 2;
const REPUBLISH_GAP: Duration = Duration::from_secs(2);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub id: String,
    pub topic_name: String,
    pub events: mpsc::Sender<DeviceEvent>,
}

/// Running devices, addressable by topic name or id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceHandle>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: DeviceHandle) {
        let slot = self.devices.len();
        // Topic names win over ids on collision.
        self.index.entry(handle.id.clone()).or_insert(slot);
        self.index.insert(handle.topic_name.clone(), slot);
        self.devices.push(handle);
    }

    pub fn get(&self, name: &str) -> Option<&DeviceHandle> {
        self.index.get(name).map(|&i| &self.devices[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

pub struct Bridge {
    router: TopicRouter,
    registry: Arc<DeviceRegistry>,
}

impl Bridge {
    pub fn new(router: TopicRouter, registry: DeviceRegistry) -> Self {
        Self {
            router,
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn dispatch(&self, msg: MqttMessage) {
        match self.router.route(&msg.topic, &msg.payload) {
            Route::HubStatus { online: true } => {
                info!("Home Assistant online, republishing devices");
                tokio::spawn(republish_devices(self.registry()));
            }
            Route::HubStatus { online: false } => {
                debug!("Home Assistant status {}", msg.payload);
            }
            Route::Command { device, command } => match self.registry.get(device) {
                Some(handle) => {
                    if handle.events.send(DeviceEvent::Command(command)).await.is_err() {
                        warn!("Event channel closed for device {}", handle.topic_name);
                    }
                }
                None => warn!("Unknown device in command topic: {}", msg.topic),
            },
            Route::Invalid(reason) => warn!("{}", reason),
            Route::Ignored => {}
        }
    }

    /// Ask every device to disconnect and publish its offline status,
    /// waiting a bounded time for each to finish.
    pub async fn shutdown(&self) {
        let mut acks = Vec::with_capacity(self.registry.len());
        for handle in self.registry.iter() {
            let (tx, rx) = oneshot::channel();
            if handle.events.send(DeviceEvent::Shutdown(tx)).await.is_ok() {
                acks.push((handle.topic_name.as_str(), rx));
            }
        }
        let all = async {
            for (name, rx) in acks {
                if rx.await.is_err() {
                    debug!("Device {} stopped before acknowledging shutdown", name);
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, all).await.is_err() {
            warn!("Timed out waiting for devices to shut down");
        }
    }
}

/// Re-announce every device in two passes. A hub that has just restarted
/// may miss the first one.
pub async fn republish_devices(registry: Arc<DeviceRegistry>) {
    for _ in 0..REPUBLISH_PASSES {
        tokio::time::sleep(HUB_SETTLE_DELAY).await;
        for handle in registry.iter() {
            let _ = handle.events.send(DeviceEvent::Republish).await;
        }
        tokio::time::sleep(REPUBLISH_GAP).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCommand;

    fn registry() -> (DeviceRegistry, mpsc::Receiver<DeviceEvent>, mpsc::Receiver<DeviceEvent>) {
        let (lamp_tx, lamp_rx) = mpsc::channel(8);
        let (plug_tx, plug_rx) = mpsc::channel(8);
        let mut registry = DeviceRegistry::new();
        registry.register(DeviceHandle {
            id: "lampid".into(),
            topic_name: "lamp".into(),
            events: lamp_tx,
        });
        registry.register(DeviceHandle {
            id: "plugid".into(),
            topic_name: "plug".into(),
            events: plug_tx,
        });
        (registry, lamp_rx, plug_rx)
    }

    fn msg(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    #[test]
    fn lookup_by_topic_name_or_id() {
        let (registry, _lamp, _plug) = registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("lamp").map(|h| h.id.as_str()), Some("lampid"));
        assert_eq!(registry.get("plugid").map(|h| h.topic_name.as_str()), Some("plug"));
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn commands_reach_their_device() {
        let (registry, mut lamp, mut plug) = registry();
        let bridge = Bridge::new(TopicRouter::new("tuya", "homeassistant/status"), registry);

        bridge.dispatch(msg("tuya/plugid/command", "ON")).await;
        bridge.dispatch(msg("tuya/unknown/command", "ON")).await;
        bridge.dispatch(msg("tuya/lamp/state", "ON")).await;

        match plug.try_recv() {
            Ok(DeviceEvent::Command(DeviceCommand::Topic { topic, message })) => {
                assert_eq!(topic, "command");
                assert_eq!(message, "ON");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(plug.try_recv().is_err());
        assert!(lamp.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn hub_birth_republishes_twice() {
        let (registry, mut lamp, _plug) = registry();
        let bridge = Bridge::new(TopicRouter::new("tuya", "homeassistant/status"), registry);

        bridge.dispatch(msg("homeassistant/status", "online")).await;
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(lamp.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(matches!(lamp.try_recv(), Ok(DeviceEvent::Republish)));
        assert!(matches!(lamp.try_recv(), Ok(DeviceEvent::Republish)));
        assert!(lamp.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_acknowledgement() {
        let (registry, mut lamp, plug) = registry();
        drop(plug);
        let bridge = Bridge::new(TopicRouter::new("tuya", "homeassistant/status"), registry);

        let device = tokio::spawn(async move {
            if let Some(DeviceEvent::Shutdown(ack)) = lamp.recv().await {
                let _ = ack.send(());
                true
            } else {
                false
            }
        });
        bridge.shutdown().await;
        assert!(device.await.unwrap());
    }
}
