mod bridge;
mod config;
mod device;
mod error;
mod mqtt;
mod router;
mod tuya;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use bridge::{Bridge, DeviceHandle, DeviceRegistry, republish_devices};
use device::Device;
use mqtt::Publisher;
use router::TopicRouter;

/// Announce everything once more after startup, in case the hub missed
/// the first pass.
const STARTUP_REPUBLISH_DELAY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting tuya-mqtt bridge (mqtt={}:{}, devices={})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.devices.len(),
    );

    let (mqtt_msg_tx, mut mqtt_msg_rx) = mpsc::channel::<mqtt::MqttMessage>(100);

    let mqtt_client = mqtt::client::MqttClient::new(&config);
    let publisher: Arc<dyn Publisher> = Arc::new(mqtt_client.handle());
    let mqtt_handle = tokio::spawn(mqtt_client.run(mqtt_msg_tx));

    let mut registry = DeviceRegistry::new();
    let mut device_handles = Vec::new();

    for device_config in &config.devices {
        let (events_tx, events_rx) = mpsc::channel(200);
        let client = tuya::client::TuyaClient::new(device_config.clone(), events_tx.clone());
        let device = match Device::new(
            device_config,
            &config.mqtt,
            Box::new(client),
            Arc::clone(&publisher),
            events_tx.clone(),
        ) {
            Ok(d) => d,
            Err(e) => {
                error!("Device {} ({}): {}", device_config.name, device_config.id, e);
                std::process::exit(1);
            }
        };
        info!(
            "  Device: {} ({}) at {} -> {}",
            device,
            device_config.version,
            device_config.ip,
            device_config.base_topic(&config.mqtt.topic_prefix),
        );

        device_handles.push(tokio::spawn(device.run(events_rx)));
        registry.register(DeviceHandle {
            id: device_config.id.clone(),
            topic_name: device_config.topic_name.clone(),
            events: events_tx,
        });
    }

    let bridge = Bridge::new(
        TopicRouter::new(&config.mqtt.topic_prefix, &config.mqtt.status_topic),
        registry,
    );
    let registry = bridge.registry();
    let startup_republish = tokio::spawn(async move {
        tokio::time::sleep(STARTUP_REPUBLISH_DELAY).await;
        republish_devices(registry).await;
    });

    loop {
        tokio::select! {
            Some(msg) = mqtt_msg_rx.recv() => bridge.dispatch(msg).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    bridge.shutdown().await;
    startup_republish.abort();
    for handle in device_handles {
        handle.abort();
    }
    mqtt_handle.abort();
    info!("tuya-mqtt bridge stopped");
}

async fn sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
