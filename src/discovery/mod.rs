use crate::get_unix_ts;
use crate::knxd::proto::{Apci, Telegram};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discovery store error: {0}")]
    Store(String),
}

/// A physical device observed as a telegram source.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub address: String,
    pub last_seen: u64,
    pub message_count: u64,
}

/// A group address observed as a telegram destination.
#[derive(Debug, Clone)]
pub struct GroupAddressRecord {
    pub address: String,
    pub last_seen: u64,
    pub message_count: u64,
    /// Sticky: once a response has been seen on this address it stays true.
    pub has_read_response: bool,
    pub last_health_check: u64,
}

/// Persistence seam for the observation database. Implementations back
/// this with whatever store they like; the bridge ships an in-memory one.
pub trait DiscoveryStore: Send + Sync {
    fn upsert_device(&self, address: &str, seen_at: u64) -> Result<(), DiscoveryError>;
    fn upsert_group_address(&self, address: &str, seen_at: u64, is_response: bool) -> Result<(), DiscoveryError>;
    /// Most recently active devices first.
    fn health_check_devices(&self, limit: usize) -> Result<Vec<DeviceRecord>, DiscoveryError>;
    /// Verified responders first, then least recently probed, then most
    /// recently active.
    fn health_check_group_addresses(&self, limit: usize) -> Result<Vec<GroupAddressRecord>, DiscoveryError>;
    fn mark_health_check_used(&self, address: &str, at: u64) -> Result<(), DiscoveryError>;
}

#[derive(Default)]
pub struct MemoryDiscoveryStore {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    group_addresses: Mutex<HashMap<String, GroupAddressRecord>>,
}

impl MemoryDiscoveryStore {
    pub fn new() -> Self {
        return MemoryDiscoveryStore::default();
    }
}

impl DiscoveryStore for MemoryDiscoveryStore {
    fn upsert_device(&self, address: &str, seen_at: u64) -> Result<(), DiscoveryError> {
        let mut devices = self.devices.lock().unwrap();
        let record = devices.entry(address.to_string()).or_insert(DeviceRecord {
            address: address.to_string(),
            last_seen: 0,
            message_count: 0,
        });
        record.last_seen = seen_at;
        record.message_count += 1;
        return Ok(());
    }

    fn upsert_group_address(&self, address: &str, seen_at: u64, is_response: bool) -> Result<(), DiscoveryError> {
        let mut group_addresses = self.group_addresses.lock().unwrap();
        let record = group_addresses.entry(address.to_string()).or_insert(GroupAddressRecord {
            address: address.to_string(),
            last_seen: 0,
            message_count: 0,
            has_read_response: false,
            last_health_check: 0,
        });
        record.last_seen = seen_at;
        record.message_count += 1;
        record.has_read_response = record.has_read_response || is_response;
        return Ok(());
    }

    fn health_check_devices(&self, limit: usize) -> Result<Vec<DeviceRecord>, DiscoveryError> {
        let devices = self.devices.lock().unwrap();
        let mut records: Vec<DeviceRecord> = devices.values().cloned().collect();
        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        records.truncate(limit);
        return Ok(records);
    }

    fn health_check_group_addresses(&self, limit: usize) -> Result<Vec<GroupAddressRecord>, DiscoveryError> {
        let group_addresses = self.group_addresses.lock().unwrap();
        let mut records: Vec<GroupAddressRecord> = group_addresses.values().cloned().collect();
        records.sort_by(|a, b| {
            b.has_read_response
                .cmp(&a.has_read_response)
                .then(a.last_health_check.cmp(&b.last_health_check))
                .then(b.last_seen.cmp(&a.last_seen))
        });
        records.truncate(limit);
        return Ok(records);
    }

    fn mark_health_check_used(&self, address: &str, at: u64) -> Result<(), DiscoveryError> {
        let mut group_addresses = self.group_addresses.lock().unwrap();
        if let Some(record) = group_addresses.get_mut(address) {
            record.last_health_check = at;
        }
        return Ok(());
    }
}

/// Passively mines every observed telegram for source devices and
/// destination group addresses. Calls before start or after stop are
/// silent no-ops so the wiring order does not matter.
pub struct DiscoveryRecorder {
    store: Arc<dyn DiscoveryStore>,
    started: AtomicBool,
}

impl DiscoveryRecorder {
    pub fn new(store: Arc<dyn DiscoveryStore>) -> Self {
        return DiscoveryRecorder {
            store,
            started: AtomicBool::new(false),
        };
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Relaxed);
    }

    pub fn record(&self, telegram: &Telegram) {
        if !self.started.load(Ordering::Relaxed) {
            return;
        }

        let now = get_unix_ts();

        if let Some(source) = &telegram.source {
            if !source.is_unspecified() {
                if let Err(e) = self.store.upsert_device(&source.to_string(), now) {
                    debug!("Discovery device upsert failed: {}", e);
                }
            }
        }

        let is_response = telegram.apci == Apci::Response;
        if let Err(e) = self.store.upsert_group_address(&telegram.dest.to_string(), now, is_response) {
            debug!("Discovery group address upsert failed: {}", e);
        }
    }

    pub fn store(&self) -> Arc<dyn DiscoveryStore> {
        return self.store.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn telegram(src: &str, dest: &str, apci: Apci) -> Telegram {
        return Telegram {
            source: Some(src.parse().unwrap()),
            dest: dest.parse().unwrap(),
            apci,
            payload: vec![0x01],
            timestamp: Utc::now(),
        };
    }

    #[test]
    fn test_upsert_counts_and_sticky_response() {
        let store = MemoryDiscoveryStore::new();
        store.upsert_group_address("1/2/4", 100, false).unwrap();
        store.upsert_group_address("1/2/4", 110, true).unwrap();
        /* a later write must not clear the response marker */
        store.upsert_group_address("1/2/4", 120, false).unwrap();

        let records = store.health_check_group_addresses(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_count, 3);
        assert_eq!(records[0].last_seen, 120);
        assert!(records[0].has_read_response);
    }

    #[test]
    fn test_device_ordering_most_recent_first() {
        let store = MemoryDiscoveryStore::new();
        store.upsert_device("1.1.1", 100).unwrap();
        store.upsert_device("1.1.2", 300).unwrap();
        store.upsert_device("1.1.3", 200).unwrap();

        let records = store.health_check_devices(2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address, "1.1.2");
        assert_eq!(records[1].address, "1.1.3");
    }

    #[test]
    fn test_group_address_health_check_ordering() {
        let store = MemoryDiscoveryStore::new();
        store.upsert_group_address("0/0/1", 100, false).unwrap();
        store.upsert_group_address("0/0/2", 50, true).unwrap();
        store.upsert_group_address("0/0/3", 200, true).unwrap();
        store.mark_health_check_used("0/0/3", 500).unwrap();

        let records = store.health_check_group_addresses(10).unwrap();
        /* responders first; among them the never-probed one leads */
        assert_eq!(records[0].address, "0/0/2");
        assert_eq!(records[1].address, "0/0/3");
        assert_eq!(records[2].address, "0/0/1");
    }

    #[test]
    fn test_recorder_lifecycle_tolerance() {
        let store = Arc::new(MemoryDiscoveryStore::new());
        let recorder = DiscoveryRecorder::new(store.clone());

        /* before start: nothing happens */
        recorder.record(&telegram("1.1.20", "1/2/4", Apci::Write));
        assert!(store.health_check_devices(10).unwrap().is_empty());

        recorder.start();
        recorder.record(&telegram("1.1.20", "1/2/4", Apci::Write));
        assert_eq!(store.health_check_devices(10).unwrap().len(), 1);
        assert_eq!(store.health_check_group_addresses(10).unwrap().len(), 1);

        recorder.stop();
        recorder.record(&telegram("1.1.21", "1/2/5", Apci::Write));
        assert_eq!(store.health_check_devices(10).unwrap().len(), 1);
    }

    #[test]
    fn test_broadcast_source_is_skipped() {
        let store = Arc::new(MemoryDiscoveryStore::new());
        let recorder = DiscoveryRecorder::new(store.clone());
        recorder.start();

        let mut t = telegram("1.1.20", "1/2/4", Apci::Write);
        t.source = Some(crate::addressing::IndividualAddress::from_raw(0));
        recorder.record(&t);

        assert!(store.health_check_devices(10).unwrap().is_empty());
        /* the group address is still recorded */
        assert_eq!(store.health_check_group_addresses(10).unwrap().len(), 1);
    }

    #[test]
    fn test_response_marks_has_read_response() {
        let store = Arc::new(MemoryDiscoveryStore::new());
        let recorder = DiscoveryRecorder::new(store.clone());
        recorder.start();

        recorder.record(&telegram("1.1.20", "1/2/4", Apci::Response));
        let records = store.health_check_group_addresses(10).unwrap();
        assert!(records[0].has_read_response);
    }
}
