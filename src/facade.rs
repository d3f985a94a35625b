//! The per-gateway-id observable surface an application binds its UI to
//! (`spec.md` §4.5).
//!
//! A [`GatewayFacade`] is a thin, cheaply-cloneable view over one gateway
//! id within a shared [`crate::Manager`] — it owns no state of its own.
//! [`GatewaySubscription`] realizes "scope teardown releases the
//! subscription" as a `Drop` guard rather than an `unsubscribe()` the
//! caller has to remember to call, the same RAII shape
//! `trailsd-trails/client-rust`'s `WsConnection` uses for its background
//! task handle.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::SensorInventoryEntry;
use crate::codec::{BatteryReading, TemperatureReading, VibrationReading};
use crate::connection::ConnectionState;
use crate::error::GatewayError;
use crate::events::ConnectionEvent;
use crate::manager::Manager;

/// A scoped subscription to one gateway's events. Dropping it stops the
/// background forwarder and releases the underlying `Manager` broadcast
/// receiver — no explicit teardown call required.
pub struct GatewaySubscription {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    forwarder: JoinHandle<()>,
}

impl GatewaySubscription {
    /// Wait for the next event belonging to this gateway. `None` once the
    /// Manager itself has shut down.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

impl Drop for GatewaySubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// The observable, commandable surface for a single gateway id, backed by
/// a shared [`Manager`] (`spec.md` §4.5). Cheap to clone — it's just an
/// `Arc` and a `String`.
#[derive(Clone)]
pub struct GatewayFacade {
    manager: Arc<Manager>,
    gateway_id: String,
}

impl GatewayFacade {
    pub fn new(manager: Arc<Manager>, gateway_id: impl Into<String>) -> Self {
        Self { manager, gateway_id: gateway_id.into() }
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Current state machine position, `DISCONNECTED` if this gateway has
    /// never been connected through the Manager.
    pub fn status(&self) -> ConnectionState {
        self.manager.get_gateway_state(&self.gateway_id).unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == ConnectionState::Authenticated
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.status(), ConnectionState::Connected | ConnectionState::Authenticated)
    }

    /// Synchronous snapshot of the connected-sensor inventory, empty if
    /// this gateway isn't tracked yet.
    pub fn connected_sensors(&self) -> Vec<SensorInventoryEntry> {
        self.manager.connected_sensors(&self.gateway_id).unwrap_or_default()
    }

    pub async fn connect(
        &self,
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<(), GatewayError> {
        self.manager.connect_to_gateway(self.gateway_id.clone(), url, username, password).await
    }

    pub async fn disconnect(&self) {
        self.manager.disconnect_from_gateway(&self.gateway_id).await;
    }

    pub async fn fetch_connected_sensors(&self) -> Result<Vec<SensorInventoryEntry>, GatewayError> {
        self.manager.fetch_connected_sensors(&self.gateway_id).await
    }

    pub async fn take_vibration_reading(&self, serial: u64) -> Result<VibrationReading, GatewayError> {
        self.manager.take_vibration_reading(&self.gateway_id, serial).await
    }

    pub async fn take_temperature_reading(&self, serial: u64) -> Result<TemperatureReading, GatewayError> {
        self.manager.take_temperature_reading(&self.gateway_id, serial).await
    }

    pub async fn take_battery_reading(&self, serial: u64) -> Result<BatteryReading, GatewayError> {
        self.manager.take_battery_reading(&self.gateway_id, serial).await
    }

    pub async fn fetch_vibration_readings(
        &self,
        serial: u64,
        count: u32,
    ) -> Result<Vec<VibrationReading>, GatewayError> {
        self.manager.fetch_vibration_readings(&self.gateway_id, serial, count).await
    }

    pub async fn fetch_temperature_readings(
        &self,
        serial: u64,
        count: u32,
    ) -> Result<Vec<TemperatureReading>, GatewayError> {
        self.manager.fetch_temperature_readings(&self.gateway_id, serial, count).await
    }

    pub async fn fetch_battery_readings(
        &self,
        serial: u64,
        count: u32,
    ) -> Result<Vec<BatteryReading>, GatewayError> {
        self.manager.fetch_battery_readings(&self.gateway_id, serial, count).await
    }

    /// Subscribe to this gateway's events only. The returned guard keeps
    /// forwarding until dropped.
    pub fn subscribe(&self) -> GatewaySubscription {
        let mut manager_rx = self.manager.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway_id = self.gateway_id.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                match manager_rx.recv().await {
                    Ok(evt) if evt.gateway_id == gateway_id => {
                        if tx.send(evt.event).is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        GatewaySubscription { rx, forwarder }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[tokio::test]
    async fn unconnected_gateway_defaults_to_disconnected() {
        let manager = Manager::new(ClientConfig::default());
        let facade = GatewayFacade::new(manager, "gw-1");
        assert_eq!(facade.status(), ConnectionState::Disconnected);
        assert!(!facade.is_connected());
        assert!(facade.connected_sensors().is_empty());
    }

    #[tokio::test]
    async fn subscription_drop_stops_forwarding_without_panicking() {
        let manager = Manager::new(ClientConfig::default());
        let facade = GatewayFacade::new(manager, "gw-1");
        let sub = facade.subscribe();
        drop(sub);
    }
}
