//! knx2mqtt bridges a KNX installation to an MQTT message bus.
//!
//! The bridge talks to the KNX bus through a local knxd daemon, encodes
//! commands into datapoint-typed telegrams, decodes bus telegrams back
//! into JSON state updates, and reports its own health.

pub mod addressing;
pub mod bridge;
pub mod config;
pub mod discovery;
pub mod dpt;
pub mod functions;
pub mod health;
pub mod knxd;
pub mod messages;
pub mod mqtt;
pub mod registry;

// Re-export common types for easier access
pub use bridge::KnxBridge;
pub use config::Config;
pub use discovery::{DiscoveryRecorder, MemoryDiscoveryStore};
pub use health::HealthReporter;
pub use knxd::{KnxdClient, KnxdOptions};
pub use mqtt::MqttManager;
pub use registry::MemoryRegistry;

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now().duration_since(std::time::SystemTime::UNIX_EPOCH).unwrap().as_secs();
}
