//! Observable event streams.
//!
//! Modeled as named broadcast streams rather than inheritance, grounded in
//! `trailsd-trails/server/src/state.rs`'s `event_tx: broadcast::Sender<Event>`
//! — here used client-side for the same "fan a tagged enum out to N
//! independent subscribers" problem. Every [`ConnectionEvent`] a
//! [`crate::Connection`] emits is re-emitted by the [`crate::Manager`] as a
//! [`ManagerEvent`] with the originating gateway id attached, per `spec.md`
//! §4.3.

use crate::cache::SensorInventoryEntry;
use crate::codec::Reading;
use crate::error::GatewayError;
use crate::ConnectionState;

/// Default capacity of the broadcast channel backing each event stream. A
/// slow subscriber that falls this far behind starts missing events (a
/// `RecvError::Lagged`); ordinary UI subscribers never get close.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted on a single [`crate::Connection`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    Close { code: Option<u16> },
    Error(GatewayErrorEvent),
    Message { type_name: String },
    Connected,
    Disconnected,
    Authenticated,
    SensorConnected { serial: u64 },
    SensorDisconnected { serial: u64 },
    ReadingStarted { serial: u64 },
    ReadingCompleted { reading: Reading },
    TemperatureReading { reading: Reading },
    BatteryReading { reading: Reading },
    /// Raw state machine transition, before Manager-level debouncing.
    StateChanged { state: ConnectionState },
}

/// `GatewayError` isn't `Clone`-friendly across a broadcast channel boundary
/// in all cases (some variants carry non-'static data in principle), so
/// events carry a display-formatted summary alongside the kind.
#[derive(Debug, Clone)]
pub struct GatewayErrorEvent {
    pub message: String,
}

impl From<&GatewayError> for GatewayErrorEvent {
    fn from(e: &GatewayError) -> Self {
        Self { message: e.to_string() }
    }
}

/// Events emitted on the [`crate::Manager`]: every [`ConnectionEvent`],
/// tagged with the gateway it came from.
#[derive(Debug, Clone)]
pub struct ManagerEvent {
    pub gateway_id: String,
    pub event: ConnectionEvent,
}

/// Current externally-visible snapshot for a gateway, used by the façade.
#[derive(Debug, Clone)]
pub struct GatewaySnapshot {
    pub state: ConnectionState,
    pub sensors: Vec<SensorInventoryEntry>,
}
