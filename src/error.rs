use thiserror::Error;

/// Errors raised by the bridge.
///
/// Only `Config` and `Formula` are fatal, and only at startup. Everything
/// else is logged and recovered by the device that hit it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid formula `{formula}`: {reason}")]
    Formula { formula: String, reason: String },

    #[error("invalid DPS key: {0}")]
    InvalidDpsKey(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device is not connected")]
    NotConnected,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

pub type Result<T> = std::result::Result<T, Error>;
