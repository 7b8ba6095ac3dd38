pub mod client;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Numeric identifier of a single device data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DpsKey(pub u32);

impl fmt::Display for DpsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DpsKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse()
            .map(DpsKey)
            .map_err(|_| Error::InvalidDpsKey(s.to_string()))
    }
}

// Devices files in the wild carry DPS keys both as numbers and as strings.
impl<'de> Deserialize<'de> for DpsKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct KeyVisitor;

        impl Visitor<'_> for KeyVisitor {
            type Value = DpsKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a DPS key as integer or numeric string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<DpsKey, E> {
                u32::try_from(v)
                    .map(DpsKey)
                    .map_err(|_| E::custom(format!("DPS key {v} out of range")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<DpsKey, E> {
                u32::try_from(v)
                    .map(DpsKey)
                    .map_err(|_| E::custom(format!("DPS key {v} out of range")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<DpsKey, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

/// A push notification from the protocol client.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// DPS values reported by the device, keyed by the wire's string keys.
    Data(Map<String, Value>),
    Connected,
    Disconnected,
    Error(String),
    Heartbeat,
}

/// The narrow view a device has of its protocol connection.
///
/// Implementations deliver [`ProtocolEvent`]s out of band, through the
/// channel they were constructed with.
#[async_trait]
pub trait ProtocolClient: Send {
    /// Locate the device on the network.
    async fn find(&mut self) -> Result<()>;

    /// Open the session. Success is reported later by a `Connected` event.
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Query the current value of one data point.
    async fn get(&mut self, key: DpsKey) -> Result<Value>;

    /// Write one or more data points.
    async fn set(&mut self, dps: Map<String, Value>) -> Result<()>;
}
