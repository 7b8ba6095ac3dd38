use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_async_tuyapi::mesparse::{CommandType, Message};
use rust_async_tuyapi::tuyadevice::TuyaDevice;
use rust_async_tuyapi::{Payload, PayloadStruct};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::device::DeviceEvent;
use crate::error::{Error, Result};

use super::{DpsKey, ProtocolClient, ProtocolEvent};

const TUYA_PORT: u16 = 6668;
const PING_INTERVAL: Duration = Duration::from_secs(10);
const FIND_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

type PendingQuery = Arc<Mutex<Option<oneshot::Sender<Map<String, Value>>>>>;

/// [`ProtocolClient`] backed by `rust-async-tuyapi`.
///
/// A pump task owns the session's receive channel, sends pings, and turns
/// everything the device says into [`ProtocolEvent`]s on the device's
/// event channel.
pub struct TuyaClient {
    config: DeviceConfig,
    events: mpsc::Sender<DeviceEvent>,
    device: Option<Arc<Mutex<TuyaDevice>>>,
    connected: Arc<AtomicBool>,
    pending: PendingQuery,
    pump: Option<JoinHandle<()>>,
}

impl TuyaClient {
    pub fn new(config: DeviceConfig, events: mpsc::Sender<DeviceEvent>) -> Self {
        Self {
            config,
            events,
            device: None,
            connected: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(None)),
            pump: None,
        }
    }

    fn session(&self) -> Result<Arc<Mutex<TuyaDevice>>> {
        self.device.clone().ok_or(Error::NotConnected)
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[async_trait]
impl ProtocolClient for TuyaClient {
    async fn find(&mut self) -> Result<()> {
        // Discovery broadcasts are not handled here; a configured address is
        // "found" once its protocol port accepts connections.
        let addr = SocketAddr::new(self.config.ip, TUYA_PORT);
        debug!("Probing {} for device {}", addr, self.config.id);
        match tokio::time::timeout(FIND_TIMEOUT, tokio::net::TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::Protocol(format!("device not found at {addr}: {e}"))),
            Err(_) => Err(Error::Timeout("device discovery")),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        self.stop_pump();
        info!(
            "Connecting to device {} ({}) at {}",
            self.config.name, self.config.id, self.config.ip
        );

        let mut device = TuyaDevice::new(
            &self.config.version,
            &self.config.id,
            Some(&self.config.key),
            self.config.ip,
        )
        .map_err(|e| Error::Protocol(format!("Failed to create device: {e:?}")))?;

        let receiver = device
            .connect()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to connect: {e:?}")))?;

        let device = Arc::new(Mutex::new(device));
        self.device = Some(device.clone());
        self.connected.store(true, Ordering::SeqCst);

        self.pump = Some(tokio::spawn(pump(
            device,
            receiver,
            self.events.clone(),
            self.connected.clone(),
            self.pending.clone(),
        )));

        let _ = self
            .events
            .try_send(DeviceEvent::Protocol(ProtocolEvent::Connected));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_pump();
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        // Dropping the session closes its socket.
        self.device = None;
        if was_connected {
            let _ = self
                .events
                .try_send(DeviceEvent::Protocol(ProtocolEvent::Disconnected));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get(&mut self, key: DpsKey) -> Result<Value> {
        let device = self.session()?;
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().await = Some(tx);

        let payload = Payload::Struct(PayloadStruct {
            dev_id: self.config.id.clone(),
            gw_id: Some(self.config.id.clone()),
            uid: None,
            t: None,
            dp_id: None,
            dps: Some(json!({})),
        });
        device
            .lock()
            .await
            .get(payload)
            .await
            .map_err(|e| Error::Protocol(format!("DP query failed: {e:?}")))?;

        let dps = tokio::time::timeout(QUERY_TIMEOUT, rx)
            .await
            .map_err(|_| Error::Timeout("DP query response"))?
            .map_err(|_| Error::NotConnected)?;

        dps.get(&key.to_string())
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("DPS {key} missing from query response")))
    }

    async fn set(&mut self, dps: Map<String, Value>) -> Result<()> {
        let device = self.session()?;
        debug!("Set device {} -> {}", self.config.id, serde_json::Value::Object(dps.clone()));
        device
            .lock()
            .await
            .set_values(Value::Object(dps))
            .await
            .map_err(|e| Error::Protocol(format!("Failed to send command: {e:?}")))
    }
}

impl Drop for TuyaClient {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

async fn pump<E: std::fmt::Debug>(
    device: Arc<Mutex<TuyaDevice>>,
    mut receiver: mpsc::Receiver<std::result::Result<Vec<Message>, E>>,
    events: mpsc::Sender<DeviceEvent>,
    connected: Arc<AtomicBool>,
    pending: PendingQuery,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    let ended = loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = device.lock().await.heartbeat().await {
                    break ProtocolEvent::Error(format!("Heartbeat failed: {e:?}"));
                }
            }
            msg = receiver.recv() => {
                match msg {
                    Some(Ok(messages)) => {
                        for m in messages {
                            if m.command == Some(CommandType::HeartBeat) {
                                let _ = events.send(DeviceEvent::Protocol(ProtocolEvent::Heartbeat)).await;
                                continue;
                            }
                            let Some(dps) = extract_dps(&m) else {
                                continue;
                            };
                            // Answer an outstanding query before queueing the
                            // event; the querying device is not draining its
                            // channel while it waits.
                            if answers_query(m.command.as_ref()) {
                                if let Some(waiter) = pending.lock().await.take() {
                                    let _ = waiter.send(dps.clone());
                                }
                            }
                            if events.send(DeviceEvent::Protocol(ProtocolEvent::Data(dps))).await.is_err() {
                                warn!("Device event channel closed");
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => break ProtocolEvent::Error(format!("Device error: {e:?}")),
                    None => break ProtocolEvent::Disconnected,
                }
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    let _ = events.send(DeviceEvent::Protocol(ended)).await;
}

/// Only query responses carry the full DPS set; status pushes are partial.
fn answers_query(command: Option<&CommandType>) -> bool {
    matches!(command, Some(CommandType::DpQuery))
}

/// Pull the `dps` object out of whichever payload variant the library
/// produced. Query responses sometimes arrive as `Payload::String`
/// holding JSON like `{"dps":{"1":true,"2":21}}`.
fn extract_dps(msg: &Message) -> Option<Map<String, Value>> {
    let dps = match &msg.payload {
        Payload::Struct(ps) => ps.dps.clone(),
        Payload::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .and_then(|v| v.get("dps").cloned()),
        Payload::Raw(b) => {
            debug!("Payload::Raw ({} bytes), skipping", b.len());
            None
        }
        _ => None,
    }?;

    match dps {
        Value::Object(map) => Some(map),
        other => {
            debug!("dps is not a JSON object: {}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_query_responses_answer_a_pending_get() {
        assert!(answers_query(Some(&CommandType::DpQuery)));
        assert!(!answers_query(Some(&CommandType::Status)));
        assert!(!answers_query(Some(&CommandType::HeartBeat)));
        assert!(!answers_query(None));
    }
}
