//! One bridged device: its topic schema, DPS cache, connection supervisor
//! and variant hooks, driven by a single event loop.

pub mod cache;
pub mod color;
pub mod discovery;
pub mod formula;
pub mod kind;
pub mod schema;
pub mod supervisor;
pub mod transform;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceConfig, MqttConfig};
use crate::error::Result;
use crate::mqtt::Publisher;
use crate::tuya::{DpsKey, ProtocolClient, ProtocolEvent};

use cache::StateCache;
use color::{ColorComponent, Hsb};
use discovery::{DeviceDescriptor, DiscoveryContext};
use kind::{CommandRoute, DeviceKind};
use schema::{TopicDescriptor, TopicSchema, ValueKind};
use supervisor::{Action, ConnectionSupervisor, HEARTBEAT_INTERVAL, Timer};
use transform::Bound;

/// Pause between announcing a device and publishing its state.
const DISCOVERY_SETTLE: Duration = Duration::from_secs(1);
const REPUBLISH_DELAY: Duration = Duration::from_secs(1);

/// A command addressed to a device, classified by topic depth.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// `<base>/<device>/<command-topic>`
    Topic { topic: String, message: String },
    /// `<base>/<device>/dps/command`
    Dps { message: String },
    /// `<base>/<device>/dps/<key>/command`
    DpsKey { key: DpsKey, message: String },
}

/// Everything a device's event loop reacts to.
#[derive(Debug)]
pub enum DeviceEvent {
    Protocol(ProtocolEvent),
    Command(DeviceCommand),
    Timer(Timer),
    /// Full resync, scheduled after initialization.
    Resync,
    /// Re-announce status, discovery and state.
    Republish,
    Reinitialize,
    Shutdown(oneshot::Sender<()>),
}

/// A command payload: a JSON object/array, or lowercased text.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Json(Value),
    Text(String),
}

impl Command {
    fn parse(message: &str) -> Self {
        match serde_json::from_str::<Value>(message) {
            Ok(v @ (Value::Object(_) | Value::Array(_))) => Self::Json(v),
            _ => Self::Text(message.trim().to_lowercase()),
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Json(_) => None,
        }
    }
}

pub struct Device {
    id: String,
    name: String,
    base_topic: String,
    discovery_prefix: String,
    descriptor: DeviceDescriptor,
    kind: DeviceKind,
    topics: TopicSchema,
    cache: StateCache,
    supervisor: ConnectionSupervisor,
    client: Box<dyn ProtocolClient>,
    publisher: Arc<dyn Publisher>,
    events: mpsc::Sender<DeviceEvent>,
    /// Last color reported by the device.
    color: Option<Hsb>,
    /// Color being commanded, assembled from per-component commands.
    command_color: Option<Hsb>,
    /// Held while a full resync is reading values.
    suppress_publish: bool,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.descriptor.mdl, self.name, self.id)
    }
}

impl Device {
    /// Fails only on invalid configuration, e.g. a malformed template.
    pub fn new(
        config: &DeviceConfig,
        mqtt: &MqttConfig,
        client: Box<dyn ProtocolClient>,
        publisher: Arc<dyn Publisher>,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Result<Self> {
        let (kind, topics) = DeviceKind::from_config(config)?;
        let descriptor = DeviceDescriptor {
            ids: vec![config.id.clone()],
            name: config.name.clone(),
            mf: "Tuya".to_string(),
            mdl: kind.model().to_string(),
        };
        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            base_topic: config.base_topic(&mqtt.topic_prefix),
            discovery_prefix: mqtt.discovery_prefix.clone(),
            descriptor,
            kind,
            topics,
            cache: StateCache::new(),
            supervisor: ConnectionSupervisor::new(),
            client,
            publisher,
            events,
            color: None,
            command_color: None,
            suppress_publish: false,
        })
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<DeviceEvent>) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        // Ticks missed while a resync blocks the loop must not pile up.
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        debug!("Search for device {}", self);
        let actions = self.supervisor.start();
        self.apply(actions).await;

        loop {
            let was_connected = self.supervisor.is_connected();
            tokio::select! {
                // Queued heartbeats are counted before any overdue tick.
                biased;
                event = events.recv() => match event {
                    Some(DeviceEvent::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    Some(event) => self.handle(event).await,
                    None => return,
                },
                _ = heartbeat.tick() => {
                    let actions = self.supervisor.heartbeat_tick();
                    self.apply(actions).await;
                }
            }
            if !was_connected && self.supervisor.is_connected() {
                heartbeat.reset();
            }
        }
    }

    async fn handle(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Protocol(ProtocolEvent::Data(dps)) => {
                debug!("Received JSON data from device {} -> {}", self, serde_json::Value::Object(dps.clone()));
                self.update_state(&dps);
                self.publish_topics();
            }
            DeviceEvent::Protocol(ProtocolEvent::Heartbeat) => self.supervisor.heartbeat(),
            DeviceEvent::Protocol(ProtocolEvent::Connected) => {
                let actions = self.supervisor.connected_reported();
                self.apply(actions).await;
            }
            DeviceEvent::Protocol(ProtocolEvent::Disconnected) => {
                debug!("Disconnected from device {}", self);
                let actions = self.supervisor.disconnected();
                self.apply(actions).await;
            }
            DeviceEvent::Protocol(ProtocolEvent::Error(e)) => {
                let actions = self.supervisor.error(e);
                self.apply(actions).await;
            }
            DeviceEvent::Timer(Timer::ConfirmLiveness) => {
                let alive = self.client.is_connected();
                let actions = self.supervisor.liveness_checked(alive);
                self.apply(actions).await;
            }
            DeviceEvent::Timer(timer) => {
                let actions = self.supervisor.timer_fired(timer);
                self.apply(actions).await;
            }
            DeviceEvent::Command(command) => self.process(command).await,
            DeviceEvent::Resync => self.get_states().await,
            DeviceEvent::Republish => self.republish(),
            DeviceEvent::Reinitialize => self.initialize().await,
            // Handled by the run loop.
            DeviceEvent::Shutdown(_) => {}
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Find => {
                    let result = self.client.find().await.map_err(|e| e.to_string());
                    if result.is_ok() {
                        debug!("Found device {}", self);
                    }
                    queue.extend(self.supervisor.discovery_result(result));
                }
                Action::Connect => {
                    if let Err(e) = self.client.connect().await {
                        queue.extend(self.supervisor.connect_failed(e.to_string()));
                    }
                }
                Action::Disconnect => {
                    if let Err(e) = self.client.disconnect().await {
                        warn!("Disconnect from {} failed: {}", self, e);
                    }
                }
                Action::Schedule(delay, timer) => self.schedule(delay, DeviceEvent::Timer(timer)),
                Action::PublishStatus { online, reason } => {
                    if online {
                        info!("Connected to device {}", self);
                    }
                    self.publish_status(online, &reason);
                }
                Action::Initialize => self.initialize().await,
                Action::LogError(message) => self.log_error(&message),
            }
        }
    }

    fn schedule(&self, delay: Duration, event: DeviceEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event).await;
        });
    }

    /// Variant setup, discovery announcement, then a full resync once the
    /// hub has had a moment to register the device.
    async fn initialize(&mut self) {
        match self.kind.initialize(self.client.as_mut()).await {
            Ok(Some(topics)) => self.topics = topics,
            Ok(None) => {}
            Err(e) => {
                self.log_error(&format!("device init failed: {e}"));
                return;
            }
        }
        debug!("Initiated device {}", self);
        self.publish_discovery();
        self.schedule(DISCOVERY_SETTLE, DeviceEvent::Resync);
    }

    fn publish_discovery(&self) {
        let ctx = DiscoveryContext {
            discovery_prefix: &self.discovery_prefix,
            base_topic: &self.base_topic,
            id: &self.id,
            name: &self.name,
            device: &self.descriptor,
        };
        let Some((topic, data)) = discovery::payload(&self.kind, &ctx) else {
            return;
        };
        debug!("Home Assistant config topic: {}", topic);
        if let Err(e) = self.publisher.publish(&topic, &data.to_string(), true) {
            warn!("Failed to publish discovery for {}: {}", self, e);
        }
    }

    /// Re-read every data point the schema uses and publish the result in
    /// one pass.
    pub async fn get_states(&mut self) {
        let previous = self.suppress_publish;
        self.suppress_publish = true;
        for key in self.topics.keys() {
            match self.client.get(key).await {
                Ok(value) => {
                    self.cache.store(key, value);
                    self.refresh_color(key);
                }
                Err(e) => self.log_error(&format!("Could not get value for device DPS key {key}: {e}")),
            }
        }
        self.suppress_publish = previous;
        self.publish_topics();
    }

    /// Merge pushed data into the cache.
    pub fn update_state(&mut self, dps: &Map<String, Value>) {
        let changed = self.cache.update(dps);
        for key in &changed {
            self.refresh_color(*key);
        }
        for key in self.kind.dependent_keys(&changed) {
            self.cache.mark_dirty(key);
        }
    }

    fn refresh_color(&mut self, key: DpsKey) {
        let Some(format) = self.topics.color_format(key) else {
            return;
        };
        let color = format.decode(self.cache.get(key).and_then(Value::as_str));
        self.color = Some(color);
        if self.command_color.is_none() {
            self.command_color = Some(color);
        }
    }

    /// Publish every topic backed by a dirty data point, then the raw DPS
    /// topics. No-op while disconnected or during a resync.
    pub fn publish_topics(&mut self) {
        if self.suppress_publish || !self.supervisor.is_connected() {
            return;
        }
        let dirty = self.cache.dirty_keys();

        for (name, descriptor) in self.topics.iter() {
            if dirty.contains(&descriptor.key) {
                let state = self.friendly_state(descriptor);
                self.publish(name, &state);
            }
        }
        for (topic, payload) in self.kind.publish_overrides(&self.topics, &self.cache, &dirty) {
            self.publish(&topic, &payload);
        }

        self.publish_dps_topics(&dirty);
    }

    fn publish_dps_topics(&mut self, dirty: &[DpsKey]) {
        if self.cache.is_empty() {
            return;
        }
        let aggregate = self.cache.to_json().to_string();
        debug!("MQTT DPS JSON: {}/dps/state -> {}", self.base_topic, aggregate);
        self.publish("dps/state", &aggregate);

        for key in dirty {
            let data = dps_text(self.cache.get(*key));
            if self.publish(&format!("dps/{key}/state"), &data) {
                self.cache.clear_dirty(*key);
            }
        }
    }

    fn friendly_state(&self, descriptor: &TopicDescriptor) -> String {
        let null = Value::Null;
        let value = self.cache.get(descriptor.key).unwrap_or(&null);
        match &descriptor.kind {
            ValueKind::Bool => if truthy(value) { "ON" } else { "OFF" }.to_string(),
            ValueKind::Number(transform) => transform.to_topic(value),
            ValueKind::Str => self.kind.string_state(value),
            ValueKind::Color { components, .. } => {
                let color = self.color.unwrap_or(Hsb::DEFAULT);
                // Saturation is meaningless in white mode.
                let white = self
                    .kind
                    .mode_key()
                    .and_then(|key| self.cache.get(key))
                    .is_some_and(|mode| mode == "white");
                components
                    .iter()
                    .map(|c| match c {
                        ColorComponent::S if white => 0,
                        c => color.component(*c),
                    })
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            }
        }
    }

    async fn process(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Topic { topic, message } => self.process_command(&message, &topic).await,
            DeviceCommand::Dps { message } => self.process_dps_command(&message).await,
            DeviceCommand::DpsKey { key, message } => self.process_dps_key_command(&message, key).await,
        }
    }

    /// Command on a named topic, e.g. `brightness_command`.
    pub async fn process_command(&mut self, message: &str, command_topic: &str) {
        let command = Command::parse(message);
        if command_topic == "command" && command.text() == Some("get-states") {
            debug!("Received command: get-states");
            self.get_states().await;
            return;
        }

        let Some((descriptor, command)) = self.resolve_command(command, command_topic) else {
            return;
        };
        debug!(
            "Device {} received command topic: {}, message: {}",
            self, command_topic, message
        );
        if !self.send_tuya_command(&command, &descriptor).await {
            debug!(
                "Command topic {}/{} received invalid value: {}",
                self.base_topic, command_topic, message
            );
        }
    }

    fn resolve_command(
        &self,
        command: Command,
        command_topic: &str,
    ) -> Option<(TopicDescriptor, Command)> {
        let state_topic = command_topic.replacen("command", "state", 1);
        if let Some(descriptor) = self.topics.get(&state_topic) {
            return Some((descriptor.clone(), command));
        }

        match self.kind.route_command(command_topic, command.text().unwrap_or_default()) {
            CommandRoute::Reroute { message, topic } => {
                let state_topic = topic.replacen("command", "state", 1);
                let descriptor = self.topics.get(&state_topic)?.clone();
                Some((descriptor, Command::Text(message)))
            }
            CommandRoute::Ignore => {
                debug!("Ignoring {} on {} for device {}", command_topic, self.base_topic, self);
                None
            }
            CommandRoute::Unhandled => {
                warn!(
                    "Invalid command topic {}/{} for device {}",
                    self.base_topic, command_topic, self
                );
                None
            }
        }
    }

    /// Translate a topic command into a DPS write. Returns `false` when the
    /// value is invalid for the topic and nothing was sent.
    async fn send_tuya_command(&mut self, command: &Command, descriptor: &TopicDescriptor) -> bool {
        let text = command.text();
        let value = match &descriptor.kind {
            ValueKind::Bool => match text {
                Some("toggle") => Value::Bool(!self.cache.get(descriptor.key).is_some_and(truthy)),
                Some(t) => match parse_bool(t) {
                    Some(b) => Value::Bool(b),
                    None => return false,
                },
                None => return false,
            },
            ValueKind::Number(transform) => {
                let Some(wire) = text.and_then(|t| transform.to_wire(t)) else {
                    return false;
                };
                if let Some(clamped) = wire.clamped {
                    let (side, label) = match clamped.bound {
                        Bound::Min => ("less", "minimum"),
                        Bound::Max => ("greater", "maximum"),
                    };
                    self.log_error(&format!(
                        "Received command value \"{}\" that is {side} than the configured {label} value",
                        clamped.requested
                    ));
                    self.log_error(&format!("Overriding command with {label} value {}", clamped.value));
                }
                wire.value
            }
            ValueKind::Color { format, components } => {
                let mut target = self
                    .command_color
                    .or(self.color)
                    .unwrap_or(Hsb::DEFAULT);
                if !text.is_some_and(|t| target.apply_components(components, t)) {
                    return false;
                }
                self.command_color = Some(target);
                Value::String(format.encode(target))
            }
            ValueKind::Str => match command {
                Command::Json(v) => v.clone(),
                Command::Text(t) => Value::String(t.clone()),
            },
        };

        self.set(descriptor.key, value).await;

        let target_color = self.command_color.unwrap_or(Hsb::DEFAULT);
        if let (Some(mode), Some(mode_key)) = (
            self.kind.target_mode(descriptor, target_color, &self.cache),
            self.kind.mode_key(),
        ) {
            self.set(mode_key, mode).await;
        }
        true
    }

    /// Raw write on `dps/command`. Accepts `{"<key>": value, ...}` as well
    /// as the protocol's `{"dps": key, "set": value}` and
    /// `{"multiple": true, "data": {...}}` shapes.
    pub async fn process_dps_command(&mut self, message: &str) {
        let Ok(Value::Object(command)) = serde_json::from_str::<Value>(message) else {
            warn!("DPS command topic requires Tuya style JSON value");
            return;
        };
        debug!("Parsed Tuya JSON command: {}", message);

        let dps = match (command.get("dps"), command.get("set"), command.get("data")) {
            (Some(key), Some(value), _) => {
                let key = match key {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Map::from_iter([(key, value.clone())])
            }
            (_, _, Some(Value::Object(data))) => data.clone(),
            _ => command,
        };

        if let Some(bad) = dps.keys().find(|k| k.parse::<DpsKey>().is_err()) {
            self.log_error(&format!("Invalid DPS key \"{bad}\" in JSON command"));
            return;
        }
        self.write(dps).await;
    }

    /// Single-key write on `dps/<key>/command`.
    pub async fn process_dps_key_command(&mut self, message: &str, key: DpsKey) {
        if matches!(Command::parse(message), Command::Json(_)) {
            warn!("Individual DPS command topics do not accept JSON values");
            return;
        }
        debug!("Received command for DPS{}: {}", key, message);
        self.set(key, parse_dps_message(message)).await;
    }

    async fn set(&mut self, key: DpsKey, value: Value) {
        self.write(Map::from_iter([(key.to_string(), value)])).await;
    }

    async fn write(&mut self, dps: Map<String, Value>) {
        debug!("Set device {} -> {}", self.id, serde_json::Value::Object(dps.clone()));
        if let Err(e) = self.client.set(dps).await {
            self.log_error(&format!("Failed to send command: {e}"));
        }
    }

    /// Re-announce after a hub restart.
    pub fn republish(&mut self) {
        let online = self.client.is_connected();
        let status = if online { "online" } else { "offline" };
        self.publish_status(online, &format!("device isConnected={status}"));
        if self.supervisor.is_connected() {
            self.schedule(REPUBLISH_DELAY, DeviceEvent::Reinitialize);
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect from {} during shutdown failed: {}", self, e);
        }
        self.publish_status(false, "bridge shutting down");
    }

    fn publish_status(&self, online: bool, reason: &str) {
        self.publish("status", if online { "online" } else { "offline" });
        self.publish("reason", reason);
    }

    fn log_error(&self, message: &str) {
        error!("{}: {}", self, message);
        self.publish("log", message);
    }

    /// Publish under this device's base topic. Returns whether the message
    /// was handed to the transport.
    fn publish(&self, subtopic: &str, payload: &str) -> bool {
        let topic = format!("{}/{}", self.base_topic, subtopic);
        debug!("{} -> {}", topic, payload);
        match self.publisher.publish(&topic, payload, false) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to publish {}: {}", topic, e);
                false
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn parse_bool(command: &str) -> Option<bool> {
    match command {
        "on" | "1" | "true" => Some(true),
        "off" | "0" | "false" => Some(false),
        _ => None,
    }
}

/// Booleans and numbers are sent typed, anything else as text.
fn parse_dps_message(message: &str) -> Value {
    match message {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(n) = message.trim().parse::<i64>() {
                Value::from(n)
            } else if let Some(n) = message
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .and_then(serde_json::Number::from_f64)
            {
                Value::Number(n)
            } else {
                Value::String(message.to_string())
            }
        }
    }
}

fn dps_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "None".to_string(),
        Some(Value::String(s)) if s.is_empty() => "None".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
