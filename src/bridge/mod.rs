use crate::config::{BridgeSection, DeviceConfig};
use crate::discovery::DiscoveryRecorder;
use crate::dpt;
use crate::functions;
use crate::knxd::proto::{Apci, Telegram};
use crate::knxd::KnxdClient;
use crate::messages::{self, StateMessage};
use crate::mqtt::{self, MqttSender, SubscribeData, Transmission};
use crate::registry::DeviceRegistry;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub mod bindings;
pub mod commands;
pub mod requests;

use bindings::BindingIndexes;

pub(crate) struct BridgeInner {
    pub(crate) bridge_id: String,
    pub(crate) topic_prefix: String,
    pub(crate) qos: u8,
    pub(crate) knxd: Arc<KnxdClient>,
    pub(crate) mqtt: MqttSender,
    pub(crate) indexes: RwLock<BindingIndexes>,
    pub(crate) state_cache: Mutex<HashMap<(String, String), serde_json::Value>>,
    pub(crate) registry: Arc<dyn DeviceRegistry>,
    pub(crate) discovery: Arc<DiscoveryRecorder>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

/// The translation engine: commands and requests come down from MQTT and
/// leave as knxd telegrams, telegrams come up from the bus and leave as
/// retained state publications.
pub struct KnxBridge {
    inner: Arc<BridgeInner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl KnxBridge {
    pub fn new(
        bridge: &BridgeSection,
        qos: u8,
        devices: &[DeviceConfig],
        knxd: Arc<KnxdClient>,
        mqtt: MqttSender,
        registry: Arc<dyn DeviceRegistry>,
        discovery: Arc<DiscoveryRecorder>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(BridgeInner {
            bridge_id: bridge.id.clone(),
            topic_prefix: bridge.topic_prefix.clone(),
            qos,
            knxd,
            mqtt,
            indexes: RwLock::new(BindingIndexes::build(devices)),
            state_cache: Mutex::new(HashMap::new()),
            registry,
            discovery,
            shutdown: shutdown_rx,
        });

        return KnxBridge {
            inner,
            shutdown_tx,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        };
    }

    pub fn devices_managed(&self) -> usize {
        return self.inner.indexes.read().unwrap().devices.len();
    }

    /// Seed the registry, start the discovery recorder, take over the
    /// knxd callback and subscribe to the command and request topics.
    pub async fn start(&self) {
        self.inner.seed_registry();
        self.inner.discovery.start();

        let callback_inner = self.inner.clone();
        self.inner.knxd.set_on_telegram(move |telegram| {
            let inner = callback_inner.clone();
            async move {
                inner.handle_telegram(telegram).await;
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.subscribe_loop(messages::command_topic_filter(&self.inner.topic_prefix), Dispatch::Command).await);
        tasks.push(self.subscribe_loop(messages::request_topic_filter(&self.inner.topic_prefix), Dispatch::Request).await);

        info!("Bridge {} started with {} devices", self.inner.bridge_id, self.devices_managed());
    }

    async fn subscribe_loop(&self, filter: String, dispatch: Dispatch) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<String>(32);
        let _ = self
            .inner
            .mqtt
            .send(Transmission::Subscribe(SubscribeData { topic: filter, sender: tx }))
            .await;

        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown.clone();
        return tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    payload = rx.recv() => {
                        let Some(payload) = payload else { break };
                        match dispatch {
                            Dispatch::Command => inner.handle_command(payload).await,
                            Dispatch::Request => inner.handle_request(payload).await,
                        }
                    }
                }
            }
        });
    }

    /// Stop the engine: cancel every derived context, drain the handler
    /// tasks and close the knxd client. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.inner.discovery.stop();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        self.inner.knxd.close().await;
        info!("Bridge {} stopped", self.inner.bridge_id);
    }

    /// Swap in freshly built indices and drop cache entries for devices
    /// that no longer exist. Telegrams and commands observe either the
    /// old or the new bindings, never a mix.
    pub fn reload_devices(&self, devices: &[DeviceConfig]) {
        let rebuilt = BindingIndexes::build(devices);
        {
            let mut indexes = self.inner.indexes.write().unwrap();
            *indexes = rebuilt;
        }
        self.prune_state_cache();
        self.inner.seed_registry();
        info!("Bridge devices reloaded, now managing {}", self.devices_managed());
    }

    /// Drop cached values for device ids that are no longer configured,
    /// keeping change detection warm for the devices that survived.
    pub fn prune_state_cache(&self) {
        let indexes = self.inner.indexes.read().unwrap();
        let mut cache = self.inner.state_cache.lock().unwrap();
        cache.retain(|(device_id, _), _| indexes.devices.contains_key(device_id));
    }

    /// The aggressive variant: forget everything and republish on the
    /// next telegram of each binding.
    pub fn clear_state_cache(&self) {
        self.inner.state_cache.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> Arc<BridgeInner> {
        return self.inner.clone();
    }
}

#[derive(Clone, Copy)]
enum Dispatch {
    Command,
    Request,
}

fn is_truthy(value: &serde_json::Value) -> bool {
    return match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Null => false,
        _ => true,
    };
}

impl BridgeInner {
    fn seed_registry(&self) {
        let indexes = self.indexes.read().unwrap();
        for device in indexes.devices.values() {
            let seed = bindings::build_seed(device);
            if let Err(e) = self.registry.create_device_if_not_exists(&seed) {
                debug!("Registry seeding for {} failed: {}", device.id, e);
            }
        }
    }

    /// Invoked by the knxd callback workers for every bus telegram.
    pub(crate) async fn handle_telegram(&self, telegram: Telegram) {
        self.discovery.record(&telegram);

        if telegram.apci == Apci::Read {
            /* read requests carry no value */
            return;
        }

        let ga = telegram.dest.to_string();
        let route = { self.indexes.read().unwrap().routes.get(&ga).cloned() };
        let Some(route) = route else {
            /* bus traffic for devices this bridge does not manage */
            return;
        };

        let value = match dpt::decode_value(&route.dpt, &telegram.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping telegram for {} ({}): {}", ga, route.dpt, e);
                return;
            }
        };

        let resolution = functions::resolve(&route.function);
        let mut state = serde_json::Map::new();
        state.insert(resolution.state_key.clone(), value.clone());
        if resolution.state_key == "motion" && is_truthy(&value) {
            state.insert("last_motion".to_string(), serde_json::Value::from(messages::now_rfc3339()));
        }

        /* publish at most once per distinct value */
        {
            let mut cache = self.state_cache.lock().unwrap();
            let key = (route.device_id.clone(), route.function.clone());
            if cache.get(&key) == Some(&value) {
                debug!("Unchanged value for {}/{}, not publishing", route.device_id, route.function);
                return;
            }
            cache.insert(key, value);
        }

        let message = StateMessage::new(&route.device_id, &ga, state.clone());
        let topic = messages::state_topic(&self.topic_prefix, &ga);
        match serde_json::to_string(&message) {
            Ok(payload) => mqtt::publish(&self.mqtt, topic, payload, 1, true).await,
            Err(e) => warn!("State serialization failed: {}", e),
        }

        /* best effort, the registry never blocks state publication */
        match self.registry.set_device_state(&route.device_id, &state) {
            Ok(()) => {
                if let Err(e) = self.registry.set_device_health(&route.device_id, "online") {
                    debug!("Registry health update for {} failed: {}", route.device_id, e);
                }
            }
            Err(e) => debug!("Registry state update for {} failed: {}", route.device_id, e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::discovery::DiscoveryStore;

    #[tokio::test]
    async fn test_telegram_publishes_state() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;

        t.bridge.inner().handle_telegram(write_telegram("1.1.20", "1/2/4", &[0x01])).await;

        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        assert_eq!(publish.topic, "graylogic/state/knx/1%2F2%2F4");
        assert_eq!(publish.qos, 1);
        assert!(publish.retain);

        let body: serde_json::Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["device_id"], "light-living-main");
        assert_eq!(body["state"]["on"], true);
        assert_eq!(body["protocol"], "knx");
        assert_eq!(body["address"], "1/2/4");
        assert!(body["timestamp"].is_string());

        /* the registry saw the state and the device went online */
        let entry = t.registry.get("light-living-main").unwrap();
        assert_eq!(entry.state["on"], serde_json::json!(true));
        assert_eq!(entry.health, "online");

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_change_detection_coalesces() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;
        let inner = t.bridge.inner();

        inner.handle_telegram(write_telegram("1.1.20", "1/2/4", &[0x01])).await;
        inner.handle_telegram(write_telegram("1.1.20", "1/2/4", &[0x01])).await;

        assert!(next_publish(&mut t.mqtt_rx).await.is_some());
        assert!(try_next_publish(&mut t.mqtt_rx).is_none());

        inner.handle_telegram(write_telegram("1.1.20", "1/2/4", &[0x00])).await;
        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["state"]["on"], false);

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_ga_is_ignored() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;

        t.bridge.inner().handle_telegram(write_telegram("1.1.20", "7/7/7", &[0x01])).await;
        assert!(try_next_publish(&mut t.mqtt_rx).is_none());

        /* but discovery still saw it */
        let gas = t.store.health_check_group_addresses(10).unwrap();
        assert_eq!(gas.len(), 1);
        assert_eq!(gas[0].address, "7/7/7");

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;

        /* temperature is DPT 9, the sentinel must not become state */
        t.bridge.inner().handle_telegram(write_telegram("1.1.20", "3/1/2", &[0x7F, 0xFF])).await;
        assert!(try_next_publish(&mut t.mqtt_rx).is_none());

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_motion_sets_last_motion() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;

        t.bridge.inner().handle_telegram(write_telegram("1.1.30", "3/1/1", &[0x01])).await;
        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["state"]["motion"], true);
        assert!(body["state"]["last_motion"].is_string());

        /* motion clearing does not stamp a new last_motion */
        t.bridge.inner().handle_telegram(write_telegram("1.1.30", "3/1/1", &[0x00])).await;
        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["state"]["motion"], false);
        assert!(body["state"].get("last_motion").is_none());

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_reload_prunes_cache() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;
        let inner = t.bridge.inner();

        inner.handle_telegram(write_telegram("1.1.20", "1/2/4", &[0x01])).await;
        assert!(next_publish(&mut t.mqtt_rx).await.is_some());

        /* reload without the light: its cache entry goes away */
        let config = crate::config::Config::parse(
            r#"
devices:
  - id: sensor-hall
    type: sensor
    functions:
      motion:
        ga: 3/1/1
"#,
        )
        .unwrap();
        t.bridge.reload_devices(&config.devices);
        assert_eq!(t.bridge.devices_managed(), 1);
        assert!(inner.state_cache.lock().unwrap().is_empty());

        /* the old route is gone too */
        inner.handle_telegram(write_telegram("1.1.20", "1/2/4", &[0x00])).await;
        assert!(try_next_publish(&mut t.mqtt_rx).is_none());

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let t = build_test_bridge(SAMPLE_DEVICES).await;
        t.bridge.start().await;
        t.bridge.stop().await;
        t.bridge.stop().await;
        assert!(!t.bridge.inner().knxd.is_connected());
    }
}
