pub mod client;

use rumqttc::{AsyncClient, QoS};

use crate::error::Result;

/// An inbound message from the broker.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// Outbound side of the transport. Publishing is fire-and-forget: `Ok`
/// means the message was queued, not that the broker received it.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()>;
}

impl Publisher for AsyncClient {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.try_publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())?;
        Ok(())
    }
}
