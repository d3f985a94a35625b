//! Observable per-gateway caches: connected-sensor inventory and bounded
//! per-kind reading ring buffers.
//!
//! Writes happen only from a [`crate::connection::Connection`]'s single
//! inbound-message path, so the data structures here need no locking of
//! their own; the `Connection` wraps a [`GatewayCache`] in a `std::sync::Mutex`
//! purely so synchronous, consistent snapshot reads can happen from any task
//! holding a cloned [`crate::connection::Connection`] handle.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::codec::{BatteryReading, Reading, ReadingKind, TemperatureReading, VibrationReading};

/// One tracked sensor's connectivity and identity within a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorInventoryEntry {
    pub serial: u64,
    pub part_number: String,
    pub connected: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// A bounded, id-keyed ring buffer for one reading kind. `BTreeMap` gives us
/// "ordered by id descending on read" and "evict lowest id on overflow" for
/// free, at the cost of being slightly more than a literal ring buffer —
/// a reasonable trade since `cache_per_kind_capacity` is small (default 100).
#[derive(Debug, Clone)]
struct RingBuffer<T> {
    capacity: usize,
    entries: BTreeMap<u64, T>,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self { capacity, entries: BTreeMap::new() }
    }

    /// Insert or overwrite the entry for `id`. If this grows the buffer past
    /// capacity, evict the lowest id — unless the server has explicitly
    /// renumbered, readings only increase in id, so "lowest" and "oldest"
    /// coincide here.
    fn insert(&mut self, id: u64, value: T) {
        self.entries.insert(id, value);
        while self.entries.len() > self.capacity {
            if let Some(&lowest) = self.entries.keys().next() {
                self.entries.remove(&lowest);
            } else {
                break;
            }
        }
    }

    fn snapshot_desc_owned(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.entries.values().rev().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// All observable state for one gateway: the connected-sensor inventory plus
/// the three per-kind reading ring buffers.
#[derive(Debug, Clone)]
pub struct GatewayCache {
    capacity: usize,
    inventory: HashMap<u64, SensorInventoryEntry>,
    vibration: RingBuffer<VibrationReading>,
    temperature: RingBuffer<TemperatureReading>,
    battery: RingBuffer<BatteryReading>,
}

impl GatewayCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inventory: HashMap::new(),
            vibration: RingBuffer::new(capacity),
            temperature: RingBuffer::new(capacity),
            battery: RingBuffer::new(capacity),
        }
    }

    /// Replace the whole inventory from a `GET_DYN_CONNECTED` response.
    pub fn replace_inventory(&mut self, entries: impl IntoIterator<Item = (u64, String, bool)>) {
        let now = Utc::now();
        self.inventory.clear();
        for (serial, part_number, connected) in entries {
            self.inventory.insert(
                serial,
                SensorInventoryEntry { serial, part_number, connected, last_seen_at: now },
            );
        }
    }

    /// Apply a `NOT_DYN_CONN` transition, creating the entry if unseen.
    pub fn set_sensor_connected(&mut self, serial: u64, connected: bool) {
        let now = Utc::now();
        self.inventory
            .entry(serial)
            .and_modify(|e| {
                e.connected = connected;
                e.last_seen_at = now;
            })
            .or_insert(SensorInventoryEntry {
                serial,
                part_number: String::new(),
                connected,
                last_seen_at: now,
            });
    }

    pub fn connected_sensors(&self) -> Vec<SensorInventoryEntry> {
        let mut v: Vec<_> = self.inventory.values().cloned().collect();
        v.sort_by_key(|e| e.serial);
        v
    }

    pub fn is_sensor_connected(&self, serial: u64) -> Option<bool> {
        self.inventory.get(&serial).map(|e| e.connected)
    }

    pub fn insert_reading(&mut self, reading: Reading) {
        match reading {
            Reading::Vibration(r) => self.vibration.insert(r.id, r),
            Reading::Temperature(r) => self.temperature.insert(r.id, r),
            Reading::Battery(r) => self.battery.insert(r.id, r),
        }
    }

    pub fn vibration_readings(&self) -> Vec<VibrationReading> {
        self.vibration.snapshot_desc_owned()
    }

    pub fn temperature_readings(&self) -> Vec<TemperatureReading> {
        self.temperature.snapshot_desc_owned()
    }

    pub fn battery_readings(&self) -> Vec<BatteryReading> {
        self.battery.snapshot_desc_owned()
    }

    pub fn reading_count(&self, kind: ReadingKind) -> usize {
        match kind {
            ReadingKind::Vibration => self.vibration.len(),
            ReadingKind::Temperature => self.temperature.len(),
            ReadingKind::Battery => self.battery.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp(id: u64) -> TemperatureReading {
        TemperatureReading { id, serial: 1, time: "2025-01-01T00:00:00Z".into(), temp_c: 20.0 }
    }

    #[test]
    fn evicts_lowest_id_over_capacity() {
        let mut cache = GatewayCache::new(3);
        for id in 1..=4 {
            cache.insert_reading(Reading::Temperature(temp(id)));
        }
        let snapshot = cache.temperature_readings();
        assert_eq!(snapshot.len(), 3);
        let ids: Vec<_> = snapshot.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 3, 2]);
    }

    #[test]
    fn inventory_tracks_connect_disconnect() {
        let mut cache = GatewayCache::new(10);
        cache.set_sensor_connected(1234, true);
        assert_eq!(cache.is_sensor_connected(1234), Some(true));
        cache.set_sensor_connected(1234, false);
        assert_eq!(cache.is_sensor_connected(1234), Some(false));
        assert_eq!(cache.is_sensor_connected(9999), None);
    }

    #[test]
    fn reading_accepted_out_of_order_still_indexed_by_id() {
        let mut cache = GatewayCache::new(10);
        cache.insert_reading(Reading::Temperature(temp(5)));
        cache.insert_reading(Reading::Temperature(temp(2)));
        let ids: Vec<_> = cache.temperature_readings().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 2]);
    }
}
