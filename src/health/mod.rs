use crate::bridge::KnxBridge;
use crate::config::BridgeSection;
use crate::knxd::KnxdClient;
use crate::messages::{self, ConnectionHealth, HealthMessage, HealthStatistics};
use crate::mqtt::{self, MqttSender};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Composite status rule, evaluated at every publication: a broken MQTT
/// path wins over a broken knxd path, otherwise all is well.
fn derive_status(mqtt_connected: bool, knxd_connected: bool) -> (&'static str, Option<&'static str>) {
    if !mqtt_connected {
        return ("degraded", Some("MQTT disconnected"));
    }
    if !knxd_connected {
        return ("degraded", Some("knxd disconnected"));
    }
    return ("healthy", None);
}

/// Publishes the retained health envelope on a fixed interval, plus the
/// starting/stopping one-shots around the bridge lifecycle. The offline
/// case is covered by the LWT the MQTT client registers at connect time.
pub struct HealthReporter {
    bridge_id: String,
    topic_prefix: String,
    qos: u8,
    interval: Duration,
    start_time: Instant,
    knxd: Arc<KnxdClient>,
    mqtt: MqttSender,
    bridge: Arc<KnxBridge>,
    connected_since: Mutex<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl HealthReporter {
    pub fn new(
        bridge_section: &BridgeSection,
        qos: u8,
        knxd: Arc<KnxdClient>,
        mqtt: MqttSender,
        bridge: Arc<KnxBridge>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        return HealthReporter {
            bridge_id: bridge_section.id.clone(),
            topic_prefix: bridge_section.topic_prefix.clone(),
            qos,
            interval: Duration::from_secs(bridge_section.health_interval),
            start_time: Instant::now(),
            knxd,
            mqtt,
            bridge,
            connected_since: Mutex::new(None),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        };
    }

    pub fn compose(&self, status_override: Option<&str>) -> HealthMessage {
        let stats = self.knxd.stats();

        {
            /* remember when the knxd link last came up */
            let mut connected_since = self.connected_since.lock().unwrap();
            if !stats.connected {
                *connected_since = None;
            } else if connected_since.is_none() {
                *connected_since = Some(messages::now_rfc3339());
            }
        }

        let (status, reason) = match status_override {
            Some(status) => (status, None),
            None => derive_status(mqtt::is_connected(), stats.connected),
        };

        return HealthMessage {
            bridge: self.bridge_id.clone(),
            timestamp: messages::now_rfc3339(),
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connection: ConnectionHealth {
                status: if stats.connected { "connected".to_string() } else { "disconnected".to_string() },
                address: self.knxd.url().to_string(),
                connected_since: self.connected_since.lock().unwrap().clone(),
            },
            statistics: HealthStatistics {
                received: stats.rx,
                sent: stats.tx,
                errors: stats.errors,
            },
            devices_managed: self.bridge.devices_managed(),
            reason: reason.map(|r| r.to_string()),
        };
    }

    pub async fn publish_now(&self, status_override: Option<&str>) {
        let message = self.compose(status_override);
        let topic = messages::health_topic(&self.topic_prefix);
        match serde_json::to_string(&message) {
            Ok(payload) => mqtt::publish(&self.mqtt, topic, payload, self.qos, true).await,
            Err(e) => warn!("Health serialization failed: {}", e),
        }
    }

    /// One-shot "starting" publication, sent before the bridge
    /// subscribes to anything.
    pub async fn publish_starting(&self) {
        self.publish_now(Some("starting")).await;
    }

    pub async fn start_thread(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.publish_now(None).await,
            }
        }
        debug!("Health reporter finished");
    }

    /// Best-effort final "stopping" publication, exactly once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.publish_now(Some("stopping")).await;
        let _ = self.shutdown_tx.send(true);
    }
}
