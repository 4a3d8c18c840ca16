use knx2mqtt::{
    messages, registry::DeviceRegistry, Config, DiscoveryRecorder, HealthReporter, KnxBridge,
    KnxdClient, KnxdOptions, MemoryDiscoveryStore, MemoryRegistry, MqttManager,
};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn knxd_options(config: &Config) -> KnxdOptions {
    let mut opts = KnxdOptions::new(&config.knxd.url);
    opts.connect_timeout = Duration::from_secs(config.knxd.connect_timeout);
    opts.read_timeout = Duration::from_secs(config.knxd.read_timeout);
    opts.write_timeout = Duration::from_secs(config.knxd.write_timeout);
    opts.initial_backoff = Duration::from_secs(config.knxd.reconnect_interval);
    return opts;
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = Config::load().expect("Unable to read the config on config/knx2mqtt.yaml or knx2mqtt.yaml");

    // Initialize logging, environment wins over the config file
    let default_filter = std::env::var("KNX2MQTT_LOG_LEVEL").unwrap_or(config.logging.level.clone());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    /* MQTT first, the LWT has to be registered before anything connects */
    let lwt = messages::LwtMessage::new(&config.bridge.id);
    let (mut mqtt, mqtt_tx) = MqttManager::new(
        &config.mqtt,
        &config.bridge.id,
        messages::health_topic(&config.bridge.topic_prefix),
        serde_json::to_string(&lwt).unwrap(),
    );
    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    let knxd = match KnxdClient::connect(knxd_options(&config)).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Unable to connect to knxd at {}: {}", config.knxd.url, e);
            return Err(std::io::Error::other(e.to_string()));
        }
    };

    let registry: Arc<dyn DeviceRegistry> = Arc::new(MemoryRegistry::new());
    let discovery = Arc::new(DiscoveryRecorder::new(Arc::new(MemoryDiscoveryStore::new())));

    let bridge = Arc::new(KnxBridge::new(
        &config.bridge,
        config.mqtt.qos,
        &config.devices,
        knxd.clone(),
        mqtt_tx.clone(),
        registry,
        discovery,
    ));

    let health = Arc::new(HealthReporter::new(
        &config.bridge,
        config.mqtt.qos,
        knxd.clone(),
        mqtt_tx.clone(),
        bridge.clone(),
    ));

    health.publish_starting().await;
    bridge.start().await;

    let health_thread = health.clone();
    threads.push(tokio::spawn(async move {
        health_thread.start_thread().await;
    }));

    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                let died = threads.iter().any(|task| task.is_finished());
                if died {
                    error!("A module exited unexpectedly, shutting down");
                    break;
                }
            }
        }
    }

    health.stop().await;
    bridge.stop().await;

    for task in threads.iter_mut() {
        task.abort();
    }
    Ok(())
}
