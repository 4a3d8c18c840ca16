use serde::{Deserialize, Serialize};
use serde_json;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry store error: {0}")]
    Store(String),
}

/// The record the bridge seeds an external device registry with,
/// derived mechanically from the configured bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSeed {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub domain: String,
    pub capabilities: Vec<String>,
    pub address: serde_json::Map<String, serde_json::Value>,
}

/// Seam to the external device registry. Seeding is idempotent, state
/// and health updates are best-effort (the bridge logs failures at debug
/// and moves on).
pub trait DeviceRegistry: Send + Sync {
    fn create_device_if_not_exists(&self, seed: &DeviceSeed) -> Result<(), RegistryError>;
    fn set_device_state(&self, device_id: &str, state: &serde_json::Map<String, serde_json::Value>) -> Result<(), RegistryError>;
    fn set_device_health(&self, device_id: &str, status: &str) -> Result<(), RegistryError>;
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub seed: DeviceSeed,
    pub state: serde_json::Map<String, serde_json::Value>,
    pub health: String,
}

#[derive(Default)]
pub struct MemoryRegistry {
    devices: Mutex<HashMap<String, RegistryEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        return MemoryRegistry::default();
    }

    pub fn get(&self, device_id: &str) -> Option<RegistryEntry> {
        return self.devices.lock().unwrap().get(device_id).cloned();
    }

    pub fn len(&self) -> usize {
        return self.devices.lock().unwrap().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn create_device_if_not_exists(&self, seed: &DeviceSeed) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock().unwrap();
        devices.entry(seed.id.clone()).or_insert(RegistryEntry {
            seed: seed.clone(),
            state: serde_json::Map::new(),
            health: "unknown".to_string(),
        });
        return Ok(());
    }

    fn set_device_state(&self, device_id: &str, state: &serde_json::Map<String, serde_json::Value>) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock().unwrap();
        let entry = devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::Store(format!("unknown device {}", device_id)))?;
        for (key, value) in state {
            entry.state.insert(key.clone(), value.clone());
        }
        return Ok(());
    }

    fn set_device_health(&self, device_id: &str, status: &str) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock().unwrap();
        let entry = devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::Store(format!("unknown device {}", device_id)))?;
        entry.health = status.to_string();
        return Ok(());
    }
}
