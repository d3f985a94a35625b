//! Gateway protocol client.
//!
//! A long-lived, authenticated, full-duplex JSON-over-WebSocket connection
//! to one or more sensor gateways: login handshake, automatic reconnection
//! with capped exponential backoff, request/response correlation, a bounded
//! reading cache per sensor kind, and a façade an application binds its UI
//! to.
//!
//! Three layers, thinnest first:
//!
//! - [`Connection`] drives a single gateway: one actor task owns the
//!   socket, the state machine, and the outbound queue.
//! - [`Manager`] owns every [`Connection`] a host application cares about,
//!   keyed by gateway id, and publishes a debounced, gateway-tagged event
//!   stream so flapping reconnects don't reach the UI as flicker.
//! - [`GatewayFacade`] is the per-gateway-id view an application actually
//!   binds widgets to — a cheap handle into a shared [`Manager`].
//!
//! ```ignore
//! let manager = Manager::new(ClientConfig::default());
//! manager.connect_to_gateway("gw-1", "wss://gw.local/ws", "user", "pass").await?;
//! let facade = GatewayFacade::new(manager, "gw-1");
//! let reading = facade.take_battery_reading(1234).await?;
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod facade;
pub mod manager;
pub mod transport;

pub use cache::SensorInventoryEntry;
pub use codec::{
    BatteryReading, CommandKind, OutboundCommand, Reading, ReadingKind, TemperatureReading,
    VibrationReading,
};
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionState, GatewayRecord};
pub use error::GatewayError;
pub use events::{ConnectionEvent, GatewayErrorEvent, GatewaySnapshot, ManagerEvent};
pub use facade::{GatewayFacade, GatewaySubscription};
pub use manager::Manager;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn manager_and_facade_agree_on_default_state() {
        let manager = Manager::new(ClientConfig::default());
        let facade = GatewayFacade::new(Arc::clone(&manager), "gw-unknown");
        assert_eq!(facade.status(), ConnectionState::Disconnected);
        assert_eq!(manager.get_gateway_state("gw-unknown"), None);
    }
}
