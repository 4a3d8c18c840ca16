use crate::config::MqttSection;
use lazy_static::lazy_static;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::RwLock;

/// A retained/QoS-tagged publication handed to the MQTT task.
pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

impl PublishData {
    pub fn new(topic: String, payload: String, qos: u8, retain: bool) -> Self {
        return PublishData { topic, payload, qos, retain };
    }
}

/// Register interest in a topic filter; matching payloads arrive on the
/// sender. Filters may contain MQTT wildcards (+ and #).
pub struct SubscribeData {
    pub topic: String,
    pub sender: Sender<String>,
}

pub enum Transmission {
    Publish(PublishData),
    Subscribe(SubscribeData),
}

/// Does an MQTT topic filter match a concrete topic?
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub struct Callbacks {
    calls: Vec<(String, Vec<Sender<String>>)>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: Vec::new() };
    }

    pub fn insert(&mut self, filter: String, callback: Sender<String>) {
        for (existing, senders) in self.calls.iter_mut() {
            if *existing == filter {
                debug!("Adding another callback to filter {filter}");
                senders.push(callback);
                return;
            }
        }
        debug!("Registering new callback filter {filter}");
        self.calls.push((filter, vec![callback]));
    }

    pub async fn send(&self, topic: &str, payload: String) {
        for (filter, senders) in self.calls.iter() {
            if !topic_matches(filter, topic) {
                continue;
            }
            for sender in senders {
                let _ = sender.send(payload.clone()).await;
            }
        }
    }

    pub fn get_filters(&self) -> Vec<String> {
        return self.calls.iter().map(|(filter, _)| filter.clone()).collect();
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
    static ref CONNECTED: AtomicBool = AtomicBool::new(false);
}

/// Broker connectivity as last observed by the event loop, feeds the
/// health status derivation.
pub fn is_connected() -> bool {
    return CONNECTED.load(Ordering::Relaxed);
}

fn qos_from_u8(qos: u8) -> QoS {
    return match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    };
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    client: AsyncClient,
    default_qos: u8,
}

impl MqttManager {
    /// Connect to the broker, register the last-will message and start
    /// the event loop. Returns the manager plus the sender the rest of
    /// the bridge publishes and subscribes through.
    pub fn new(config: &MqttSection, bridge_id: &str, lwt_topic: String, lwt_payload: String) -> (Self, Sender<Transmission>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection starting up");
        let (host, port) = config.host_port();
        let mut mqttoptions = MqttOptions::new(config.client_id_or_default(bridge_id), host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(config.keepalive));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(user.clone(), pass.clone());
        }
        /* the broker publishes this for us if we vanish without closing */
        mqttoptions.set_last_will(LastWill::new(lwt_topic, lwt_payload, qos_from_u8(config.qos), true));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        let reconnect_client = client.clone();
        let default_qos = config.qos;
        tokio::spawn(async move {
            info!("MQTT event loop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic;
                        let payload = match String::from_utf8(p.payload.to_vec()) {
                            Ok(s) => s,
                            Err(_) => {
                                debug!("Dropping non-UTF8 payload on {topic}");
                                continue;
                            }
                        };
                        debug!("Received MQTT message on {topic}");
                        CALLBACKS.read().await.send(&topic, payload).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected, resubscribing everything");
                        CONNECTED.store(true, Ordering::Relaxed);

                        let filters = CALLBACKS.read().await.get_filters();
                        for filter in filters {
                            let client_clone = reconnect_client.clone();
                            let qos = qos_from_u8(default_qos);
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(filter.clone(), qos).await {
                                    error!("Resubscribe to {filter} failed: {e:?}");
                                }
                            });
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        CONNECTED.store(false, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        CONNECTED.store(false, Ordering::Relaxed);
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        return (
            MqttManager {
                client,
                rx: mrx,
                default_qos,
            },
            mtx,
        );
    }

    pub async fn start_thread(&mut self) {
        while let Some(transmission) = self.rx.recv().await {
            match transmission {
                Transmission::Publish(publish) => {
                    match self
                        .client
                        .publish(publish.topic, qos_from_u8(publish.qos), publish.retain, publish.payload)
                        .await
                    {
                        Err(e) => error!("Error publishing: {}", e),
                        Ok(_) => debug!("Published successfully"),
                    }
                }
                Transmission::Subscribe(subscribe) => {
                    let topic = subscribe.topic.clone();
                    if self.client.subscribe(topic.clone(), qos_from_u8(self.default_qos)).await.is_ok() {
                        CALLBACKS.write().await.insert(topic.clone(), subscribe.sender);
                        info!("Registered callback {topic}");
                    }
                }
            }
        }

        info!("MQTT manager channel closed, exiting");
    }
}

/// Shorthand used all over the bridge for one-shot publications.
pub async fn publish(sender: &Sender<Transmission>, topic: String, payload: String, qos: u8, retain: bool) {
    let _ = sender
        .send(Transmission::Publish(PublishData::new(topic, payload, qos, retain)))
        .await;
}

/// Shared handle the bridge and health reporter use to reach the broker.
pub type MqttSender = Sender<Transmission>;
