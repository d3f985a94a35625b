//! The `gatewayId → Connection` registry and the debounced, aggregated view
//! of it (`spec.md` §4.3).
//!
//! Grounded in `trailsd-trails/server/src/state.rs`'s `AppState`: a single
//! `Arc`-wrapped struct holding a `DashMap` registry plus a `broadcast`
//! event bus, constructed once by the host and handed out as a shared
//! handle. The registry itself (`connections`, `sensor_connected`) uses
//! `DashMap` for the same reason the teacher does — concurrent callers add
//! and remove gateways and read sensor state without a shared lock — while
//! the debounce bookkeeping that reacts to `ConnectionEvent::StateChanged`
//! is, per `spec.md` §5, only ever touched from the aggregator task started
//! in [`Manager::new`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::SensorInventoryEntry;
use crate::codec::{BatteryReading, ReadingKind, TemperatureReading, VibrationReading};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, GatewayRecord};
use crate::error::GatewayError;
use crate::events::{ConnectionEvent, ManagerEvent, EVENT_CHANNEL_CAPACITY};

/// One tracked gateway: its handle plus the task forwarding its raw events
/// into the Manager's aggregator.
struct GatewayEntry {
    connection: Connection,
    forwarder: JoinHandle<()>,
}

/// A pending, not-yet-superseded debounce window for one gateway's
/// transition into [`ConnectionState::Connected`]. `generation` lets the
/// scheduled publish task notice a newer event cancelled it without needing
/// a second channel.
struct DebounceSlot {
    generation: u64,
}

/// Aggregates every managed [`Connection`] into one registry and one
/// debounced, gateway-tagged event stream (`spec.md` §4.3).
///
/// Constructed once by the host application via [`Manager::new`] and shared
/// as an `Arc<Manager>` — not a process-wide singleton, matching
/// `trailsd-trails/server`'s `Arc<AppState>` rather than a `once_cell`
/// global (`SPEC_FULL.md` §3.3).
pub struct Manager {
    config: ClientConfig,
    connections: DashMap<String, GatewayEntry>,
    sensor_connected: DashMap<u64, bool>,
    debounce: DashMap<String, DebounceSlot>,
    debounce_generation: AtomicU64,
    events: broadcast::Sender<ManagerEvent>,
    internal_tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl Manager {
    pub fn new(config: ClientConfig) -> std::sync::Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let manager = std::sync::Arc::new(Self {
            config,
            connections: DashMap::new(),
            sensor_connected: DashMap::new(),
            debounce: DashMap::new(),
            debounce_generation: AtomicU64::new(0),
            events,
            internal_tx,
        });

        tokio::spawn(Self::run_aggregator(manager.clone(), internal_rx));
        manager
    }

    /// Connect (or reuse an already-tracked connection) to `gateway_id`.
    /// Spawns the per-gateway actor and a forwarder task that relays its raw
    /// events into this Manager's aggregator, then drives the handshake.
    pub async fn connect_to_gateway(
        &self,
        gateway_id: impl Into<String>,
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<(), GatewayError> {
        let gateway_id = gateway_id.into();
        if let Some(entry) = self.connections.get(&gateway_id) {
            return entry.connection.connect().await;
        }

        let record = GatewayRecord {
            id: gateway_id.clone(),
            url: url.into(),
            username: username.into(),
            password: password.into(),
            name: None,
        };
        let connection = Connection::spawn(record, self.config.clone());
        self.track(gateway_id, connection.clone());
        connection.connect().await
    }

    /// Register an already-constructed [`Connection`] under `gateway_id` and
    /// start forwarding its events, without driving its handshake. Normal
    /// callers go through [`Manager::connect_to_gateway`]; this is the seam
    /// tests use to adopt a [`Connection`] built with
    /// [`Connection::spawn_with_transport`] against a
    /// [`crate::transport::MockTransport`] (`SPEC_FULL.md` §2.4).
    pub fn adopt_connection(&self, gateway_id: impl Into<String>, connection: Connection) {
        self.track(gateway_id.into(), connection);
    }

    fn track(&self, gateway_id: String, connection: Connection) {
        let forwarder = {
            let mut rx = connection.subscribe();
            let tx = self.internal_tx.clone();
            let gateway_id = gateway_id.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if tx.send(ManagerEvent { gateway_id: gateway_id.clone(), event }).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        self.connections.insert(gateway_id, GatewayEntry { connection, forwarder });
    }

    /// Tear down one gateway's connection and stop forwarding its events.
    pub async fn disconnect_from_gateway(&self, gateway_id: &str) {
        if let Some((_, entry)) = self.connections.remove(gateway_id) {
            entry.connection.close().await;
            entry.forwarder.abort();
        }
        self.debounce.remove(gateway_id);
    }

    /// Tear down every tracked gateway (`spec.md` §4.3 `disconnectAll`).
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect_from_gateway(&id).await;
        }
    }

    pub fn get_gateway_state(&self, gateway_id: &str) -> Option<ConnectionState> {
        self.connections.get(gateway_id).map(|e| e.connection.state())
    }

    pub fn connected_sensors(&self, gateway_id: &str) -> Option<Vec<SensorInventoryEntry>> {
        self.connections.get(gateway_id).map(|e| e.connection.connected_sensors())
    }

    /// Cross-gateway aggregation: whether the given sensor serial has been
    /// observed connected on *any* managed gateway (`spec.md` §4.3).
    pub fn is_sensor_connected(&self, serial: u64) -> bool {
        self.sensor_connected.get(&serial).map(|v| *v).unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn connection(&self, gateway_id: &str) -> Result<Connection, GatewayError> {
        self.connections
            .get(gateway_id)
            .map(|e| e.connection.clone())
            .ok_or_else(|| GatewayError::InvalidFrame(format!("unknown gateway id: {gateway_id}")))
    }

    pub async fn take_vibration_reading(
        &self,
        gateway_id: &str,
        serial: u64,
    ) -> Result<VibrationReading, GatewayError> {
        match self.connection(gateway_id)?.take_vibration_reading(serial).await? {
            crate::codec::Reading::Vibration(r) => Ok(r),
            other => Err(unexpected_reading_kind(ReadingKind::Vibration, &other)),
        }
    }

    pub async fn take_temperature_reading(
        &self,
        gateway_id: &str,
        serial: u64,
    ) -> Result<TemperatureReading, GatewayError> {
        match self.connection(gateway_id)?.take_temperature_reading(serial).await? {
            crate::codec::Reading::Temperature(r) => Ok(r),
            other => Err(unexpected_reading_kind(ReadingKind::Temperature, &other)),
        }
    }

    pub async fn take_battery_reading(
        &self,
        gateway_id: &str,
        serial: u64,
    ) -> Result<BatteryReading, GatewayError> {
        match self.connection(gateway_id)?.take_battery_reading(serial).await? {
            crate::codec::Reading::Battery(r) => Ok(r),
            other => Err(unexpected_reading_kind(ReadingKind::Battery, &other)),
        }
    }

    pub async fn fetch_connected_sensors(
        &self,
        gateway_id: &str,
    ) -> Result<Vec<SensorInventoryEntry>, GatewayError> {
        self.connection(gateway_id)?.get_connected_sensors().await
    }

    pub async fn fetch_vibration_readings(
        &self,
        gateway_id: &str,
        serial: u64,
        count: u32,
    ) -> Result<Vec<VibrationReading>, GatewayError> {
        self.connection(gateway_id)?.get_readings(serial, count).await
    }

    pub async fn fetch_temperature_readings(
        &self,
        gateway_id: &str,
        serial: u64,
        count: u32,
    ) -> Result<Vec<TemperatureReading>, GatewayError> {
        self.connection(gateway_id)?.get_temperatures(serial, count).await
    }

    pub async fn fetch_battery_readings(
        &self,
        gateway_id: &str,
        serial: u64,
        count: u32,
    ) -> Result<Vec<BatteryReading>, GatewayError> {
        self.connection(gateway_id)?.get_batteries(serial, count).await
    }

    async fn run_aggregator(
        self: std::sync::Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ManagerEvent>,
    ) {
        while let Some(ManagerEvent { gateway_id, event }) = rx.recv().await {
            self.handle_event(gateway_id, event).await;
        }
    }

    /// The single writer of `sensor_connected` and `debounce` (`spec.md`
    /// §5): everything here runs sequentially on the aggregator task, so
    /// plain reads of those maps from other tasks never race a concurrent
    /// mutation of the *same* key, only ever see a consistent prior value.
    async fn handle_event(self: &std::sync::Arc<Self>, gateway_id: String, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { state } => match state {
                ConnectionState::Connected => self.schedule_connected_debounce(gateway_id),
                ConnectionState::Authenticated => {
                    self.debounce.remove(&gateway_id);
                    self.forward(gateway_id, ConnectionEvent::Authenticated);
                }
                ConnectionState::Disconnected => {
                    self.debounce.remove(&gateway_id);
                    self.forward(gateway_id, ConnectionEvent::Disconnected);
                }
                // Connecting/Authenticating/Reconnecting/Failed have no
                // dedicated consumer-facing event (spec.md §6); the façade
                // reads them synchronously off `Connection::state()` instead.
                _ => {}
            },
            // The dedicated variants are emitted by `Connection` alongside
            // `StateChanged` for the benefit of direct per-Connection
            // subscribers, who see them immediately, undebounced. At the
            // Manager level `StateChanged` above is the single source of
            // truth, so these are dropped here to avoid double-publishing.
            ConnectionEvent::Connected | ConnectionEvent::Authenticated | ConnectionEvent::Disconnected => {}
            ConnectionEvent::SensorConnected { serial } => {
                self.sensor_connected.insert(serial, true);
                self.forward(gateway_id, ConnectionEvent::SensorConnected { serial });
            }
            ConnectionEvent::SensorDisconnected { serial } => {
                self.sensor_connected.insert(serial, false);
                self.forward(gateway_id, ConnectionEvent::SensorDisconnected { serial });
            }
            other => self.forward(gateway_id, other),
        }
    }

    /// Open (or extend) a `stateDebounceMs`-wide window for a transition
    /// into CONNECTED. The window is anchored at the *first* pending
    /// transition and is not reset by further ones that arrive while it's
    /// open — so a flap back to CONNECTED shortly after the first one still
    /// publishes once, at the original deadline (`spec.md` §4.3, §8 S6).
    /// A transition into AUTHENTICATED or DISCONNECTED cancels the window
    /// outright by bumping past its generation, since both are always
    /// published immediately and supersede a still-pending CONNECTED.
    fn schedule_connected_debounce(self: &std::sync::Arc<Self>, gateway_id: String) {
        if self.debounce.contains_key(&gateway_id) {
            return;
        }
        let generation = self.debounce_generation.fetch_add(1, Ordering::Relaxed);
        self.debounce.insert(gateway_id.clone(), DebounceSlot { generation });

        let manager = self.clone();
        let delay: Duration = self.config.state_debounce();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_pending = manager
                .debounce
                .remove_if(&gateway_id, |_, slot| slot.generation == generation)
                .is_some();
            if still_pending {
                debug!(gateway_id = %gateway_id, "debounced CONNECTED transition published");
                manager.forward(gateway_id, ConnectionEvent::Connected);
            }
        });
    }

    fn forward(&self, gateway_id: String, event: ConnectionEvent) {
        let _ = self.events.send(ManagerEvent { gateway_id, event });
    }
}

fn unexpected_reading_kind(expected: ReadingKind, got: &crate::codec::Reading) -> GatewayError {
    GatewayError::InvalidFrame(format!(
        "expected a {expected:?} reading, connection returned {got:?}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[tokio::test]
    async fn unknown_gateway_operations_fail_fast() {
        let manager = Manager::new(ClientConfig::default());
        let err = manager.fetch_connected_sensors("no-such-gateway").await;
        assert!(matches!(err, Err(GatewayError::InvalidFrame(_))));
    }

    #[tokio::test]
    async fn sensor_aggregation_defaults_to_not_connected() {
        let manager = Manager::new(ClientConfig::default());
        assert!(!manager.is_sensor_connected(1234));
    }

    #[tokio::test]
    async fn disconnect_all_on_empty_manager_is_a_no_op() {
        let manager = Manager::new(ClientConfig::default());
        manager.disconnect_all().await;
        assert!(manager.get_gateway_state("anything").is_none());
    }
}
