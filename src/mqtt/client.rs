use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;

use super::MqttMessage;

/// Room for a full resync of every device without blocking publishers.
const REQUEST_CAPACITY: usize = 1000;

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    subscriptions: Vec<String>,
    bridge_status_topic: String,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        let bridge_status_topic = config.bridge_status_topic();
        mqttopts.set_last_will(rumqttc::LastWill::new(
            &bridge_status_topic,
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(mqttopts, REQUEST_CAPACITY);

        let mut subscriptions = vec![
            format!("{}/#", config.mqtt.topic_prefix),
            config.mqtt.status_topic.clone(),
        ];
        if config.mqtt.status_topic != "hass/status" {
            subscriptions.push("hass/status".to_string());
        }

        Self {
            client,
            eventloop,
            subscriptions,
            bridge_status_topic,
        }
    }

    /// A cloneable handle for publishing.
    pub fn handle(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Drive the connection. Subscribes on every (re)connect and forwards
    /// incoming publishes through `message_tx`.
    pub async fn run(mut self, message_tx: mpsc::Sender<MqttMessage>) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("Connection established to MQTT server");

                    if let Err(e) = self
                        .client
                        .publish(&self.bridge_status_topic, QoS::AtLeastOnce, true, "online")
                        .await
                    {
                        error!("Failed to publish bridge status: {}", e);
                    }

                    for topic in &self.subscriptions {
                        if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
                            error!("Failed to subscribe to {}: {}", topic, e);
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let msg = MqttMessage {
                        topic: publish.topic.clone(),
                        payload: String::from_utf8_lossy(&publish.payload).to_string(),
                    };
                    if message_tx.send(msg).await.is_err() {
                        warn!("Message channel closed");
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {}. Reconnecting...", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}
