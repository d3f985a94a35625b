//! A single gateway's connection: transport ownership, the authentication
//! and reconnection state machine, request/response correlation, and
//! outbound queueing (`spec.md` §4.2).
//!
//! Structured as a single-task actor owning everything mutable, exactly the
//! shape of `trailsd-trails/client-rust`'s `ws_task`: one `tokio::select!`
//! loop driven by a command channel, the transport's inbound stream, a ping
//! interval, and a `DelayQueue` of timeouts. [`Connection`] is the cheap,
//! cloneable handle the rest of the crate holds; [`ConnectionActor`] is the
//! task nobody outside this module ever sees directly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::time::delay_queue::Key as DelayKey;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, warn};

use crate::cache::GatewayCache;
use crate::codec::{
    decode_inbound, CommandKind, InboundFrame, Notification, OutboundCommand, Reading,
    ReadingKind, ResponsePayload,
};
use crate::config::ClientConfig;
use crate::error::GatewayError;
use crate::events::{ConnectionEvent, GatewayErrorEvent};
use crate::transport::{default_ws_factory, Transport, TransportEvent, TransportFactory};

/// `spec.md` §3 `GatewayRecord`: identity, endpoint, credentials. Immutable
/// for the lifetime of a [`Connection`] — reconnecting reuses it unchanged.
#[derive(Clone)]
pub struct GatewayRecord {
    pub id: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub name: Option<String>,
}

impl std::fmt::Debug for GatewayRecord {
    /// Manual impl so a stray `{record:?}` in a log line never leaks the
    /// password (`spec.md` §3 invariant: credentials never leave the
    /// Connection).
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRecord")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .finish()
    }
}

/// `spec.md` §3 `ConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// `CONNECTED` and `AUTHENTICATED` accept outbound traffic directly
    /// (`spec.md` §4.2); every other state enqueues.
    fn is_send_capable(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }
}

/// Close codes the protocol treats as clean (`spec.md` §6).
fn is_clean_close(code: Option<u16>) -> bool {
    matches!(code, Some(1000) | Some(1001))
}

enum Action {
    SendNow,
    Enqueue,
    FailNotAuthenticated,
}

/// Messages sent from a [`Connection`] handle into its actor task.
enum ActorMessage {
    Connect(oneshot::Sender<Result<(), GatewayError>>),
    Close(oneshot::Sender<()>),
    SendCommand(OutboundCommand, oneshot::Sender<Result<ResponsePayload, GatewayError>>),
    TakeReading(ReadingKind, u64, oneshot::Sender<Result<Reading, GatewayError>>),
}

struct PendingCommandSlot {
    responder: oneshot::Sender<Result<ResponsePayload, GatewayError>>,
    delay_key: DelayKey,
}

struct PendingReadingSlot {
    responder: oneshot::Sender<Result<Reading, GatewayError>>,
    delay_key: DelayKey,
}

/// A frame that couldn't be sent immediately and is waiting on the outbound
/// queue, carrying whatever correlation the caller is owed once it is
/// eventually dispatched.
enum QueuedItem {
    Command { cmd: OutboundCommand, responder: oneshot::Sender<Result<ResponsePayload, GatewayError>> },
    Reading { kind: ReadingKind, serial: u64, responder: oneshot::Sender<Result<Reading, GatewayError>> },
}

/// Tokens tracked by the actor's single `DelayQueue`, unifying command
/// timeouts, reading timeouts, the post-authentication queue-drain settle
/// delay, and reconnect backoff into one `select!` branch
/// (`SPEC_FULL.md` §3.2).
#[derive(Debug, Clone)]
enum TimeoutToken {
    Command { kind: CommandKind, tag: u64 },
    Reading { kind: ReadingKind, serial: u64, tag: u64 },
    SettleThenDrain,
    Reconnect { attempt: u32 },
}

static TAG_SOURCE: AtomicU64 = AtomicU64::new(1);

fn next_tag() -> u64 {
    TAG_SOURCE.fetch_add(1, Ordering::Relaxed)
}

/// Cheap, cloneable handle to one gateway's connection. All methods send a
/// message into the actor task and await its reply; the actor is the only
/// thing that ever touches the transport, the pending-command map, or the
/// state machine directly.
#[derive(Clone)]
pub struct Connection {
    id: Arc<str>,
    cmd_tx: mpsc::Sender<ActorMessage>,
    state: Arc<Mutex<ConnectionState>>,
    cache: Arc<Mutex<GatewayCache>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Connection {
    /// Construct a handle and spawn its actor task, starting `DISCONNECTED`.
    /// The transport is not opened until [`Connection::connect`] is called.
    /// Opens real `ws://`/`wss://` sockets; use
    /// [`Connection::spawn_with_transport`] to inject a
    /// [`crate::transport::MockTransport`] factory in tests.
    pub fn spawn(record: GatewayRecord, config: ClientConfig) -> Self {
        Self::spawn_with_transport(record, config, default_ws_factory())
    }

    /// Like [`Connection::spawn`], but with the transport-opening strategy
    /// supplied explicitly. Exists so connection-state-machine behavior can
    /// be exercised against a [`crate::transport::MockTransport`] without a
    /// live socket (`SPEC_FULL.md` §2.4) — also a legitimate extension point
    /// for a host that wants its own transport (e.g. a proxy-aware dialer).
    pub fn spawn_with_transport(record: GatewayRecord, config: ClientConfig, connect_fn: TransportFactory) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(crate::events::EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        let cache = Arc::new(Mutex::new(GatewayCache::new(config.cache_per_kind_capacity)));

        let handle = Self { id: record.id.clone().into(), cmd_tx, state: state.clone(), cache: cache.clone(), events: events.clone() };

        let actor = ConnectionActor {
            record,
            config,
            connect_fn,
            cmd_rx,
            state,
            cache,
            events,
            transport: None,
            outbound_queue: VecDeque::new(),
            pending_commands: HashMap::new(),
            pending_readings: HashMap::new(),
            connect_waiters: Vec::new(),
            delay_queue: DelayQueue::new(),
            reconnect_attempts: 0,
            last_activity: Instant::now(),
            login_timeout_key: None,
        };
        tokio::spawn(actor.run());
        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state mutex poisoned")
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Authenticating | ConnectionState::Authenticated
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn connected_sensors(&self) -> Vec<crate::cache::SensorInventoryEntry> {
        self.cache.lock().expect("cache mutex poisoned").connected_sensors()
    }

    pub fn vibration_readings(&self) -> Vec<crate::codec::VibrationReading> {
        self.cache.lock().expect("cache mutex poisoned").vibration_readings()
    }

    pub fn temperature_readings(&self) -> Vec<crate::codec::TemperatureReading> {
        self.cache.lock().expect("cache mutex poisoned").temperature_readings()
    }

    pub fn battery_readings(&self) -> Vec<crate::codec::BatteryReading> {
        self.cache.lock().expect("cache mutex poisoned").battery_readings()
    }

    /// Opens the stream and performs the `POST_LOGIN` handshake. Idempotent:
    /// already `CONNECTED`/`AUTHENTICATING`/`AUTHENTICATED` returns success
    /// without reopening (`spec.md` §4.2).
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(ActorMessage::Connect(tx)).await.map_err(|_| GatewayError::Cancelled)?;
        rx.await.map_err(|_| GatewayError::Cancelled)?
    }

    /// Cancels pending reconnect, closes the stream, rejects every pending
    /// future with `Cancelled`, transitions to `DISCONNECTED`. Idempotent.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ActorMessage::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a command frame, queueing it if the connection isn't currently
    /// send-capable. Resolves with the correlated `RTN_*` payload, or
    /// rejects with `NotAuthenticated`, `CommandTimeout`, or `Cancelled`.
    pub async fn send_command(&self, cmd: OutboundCommand) -> Result<ResponsePayload, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorMessage::SendCommand(cmd, tx))
            .await
            .map_err(|_| GatewayError::Cancelled)?;
        rx.await.map_err(|_| GatewayError::Cancelled)?
    }

    /// Request a reading of `kind` for `serial`. Resolves when the matching
    /// `NOT_DYN_*` notification arrives, or rejects with `ReadingTimeout`
    /// after `readingTimeoutMs` even if the `RTN_TAKE_DYN_*` ack arrived
    /// (`spec.md` §8 boundary behaviors).
    pub async fn take_reading(&self, kind: ReadingKind, serial: u64) -> Result<Reading, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorMessage::TakeReading(kind, serial, tx))
            .await
            .map_err(|_| GatewayError::Cancelled)?;
        rx.await.map_err(|_| GatewayError::Cancelled)?
    }

    pub async fn take_vibration_reading(&self, serial: u64) -> Result<Reading, GatewayError> {
        self.take_reading(ReadingKind::Vibration, serial).await
    }

    pub async fn take_temperature_reading(&self, serial: u64) -> Result<Reading, GatewayError> {
        self.take_reading(ReadingKind::Temperature, serial).await
    }

    pub async fn take_battery_reading(&self, serial: u64) -> Result<Reading, GatewayError> {
        self.take_reading(ReadingKind::Battery, serial).await
    }

    pub async fn get_connected_sensors(&self) -> Result<Vec<crate::cache::SensorInventoryEntry>, GatewayError> {
        match self.send_command(OutboundCommand::GetDynConnected).await? {
            ResponsePayload::DynConnected(_) | ResponsePayload::Raw(_) => Ok(self.connected_sensors()),
            _ => Ok(self.connected_sensors()),
        }
    }

    pub async fn get_readings(&self, serial: u64, count: u32) -> Result<Vec<crate::codec::VibrationReading>, GatewayError> {
        match self.send_command(OutboundCommand::GetDynReadings { serial, count }).await? {
            ResponsePayload::DynReadings(readings) => Ok(readings),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn get_temperatures(&self, serial: u64, count: u32) -> Result<Vec<crate::codec::TemperatureReading>, GatewayError> {
        match self.send_command(OutboundCommand::GetDynTemps { serial, count }).await? {
            ResponsePayload::DynTemps(readings) => Ok(readings),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn get_batteries(&self, serial: u64, count: u32) -> Result<Vec<crate::codec::BatteryReading>, GatewayError> {
        match self.send_command(OutboundCommand::GetDynBatts { serial, count }).await? {
            ResponsePayload::DynBatts(readings) => Ok(readings),
            _ => Ok(Vec::new()),
        }
    }
}

/// The task that owns a gateway's transport and all of its mutable state.
struct ConnectionActor {
    record: GatewayRecord,
    config: ClientConfig,
    connect_fn: TransportFactory,
    cmd_rx: mpsc::Receiver<ActorMessage>,
    state: Arc<Mutex<ConnectionState>>,
    cache: Arc<Mutex<GatewayCache>>,
    events: broadcast::Sender<ConnectionEvent>,
    transport: Option<Box<dyn Transport>>,
    outbound_queue: VecDeque<QueuedItem>,
    pending_commands: HashMap<CommandKind, VecDeque<PendingCommandSlot>>,
    pending_readings: HashMap<(ReadingKind, u64), VecDeque<PendingReadingSlot>>,
    connect_waiters: Vec<oneshot::Sender<Result<(), GatewayError>>>,
    delay_queue: DelayQueue<TimeoutToken>,
    reconnect_attempts: u32,
    last_activity: Instant,
    /// Deadline for the in-flight `POST_LOGIN` round-trip. `POST_LOGIN` has
    /// no pending-command waiter of its own (the handshake settles via
    /// `connect_waiters` instead), so its timeout is tracked separately
    /// rather than through `pending_commands`.
    login_timeout_key: Option<DelayKey>,
}

async fn recv_transport(transport: &mut Option<Box<dyn Transport>>) -> Option<TransportEvent> {
    match transport {
        Some(t) => t.recv().await,
        None => std::future::pending().await,
    }
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut ping_interval = tokio::time::interval(self.config.ping_interval());
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.cmd_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => return, // every Connection handle dropped
                    }
                }
                ev = recv_transport(&mut self.transport) => {
                    self.handle_transport_event(ev).await;
                }
                _ = ping_interval.tick() => {
                    self.maybe_ping().await;
                }
                Some(expired) = self.delay_queue.next() => {
                    self.handle_timeout(expired.into_inner()).await;
                }
            }
        }
    }

    // ── State & events ──────────────────────────────────────

    fn set_state(&mut self, new: ConnectionState) {
        *self.state.lock().expect("connection state mutex poisoned") = new;
        self.emit(ConnectionEvent::StateChanged { state: new });
        match new {
            ConnectionState::Connected => self.emit(ConnectionEvent::Connected),
            ConnectionState::Authenticated => self.emit(ConnectionEvent::Authenticated),
            ConnectionState::Disconnected => self.emit(ConnectionEvent::Disconnected),
            _ => {}
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state mutex poisoned")
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    // ── Actor message handling ──────────────────────────────

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Connect(responder) => self.handle_connect(responder).await,
            ActorMessage::Close(responder) => {
                self.handle_close().await;
                let _ = responder.send(());
            }
            ActorMessage::SendCommand(cmd, responder) => self.handle_send_command(cmd, responder).await,
            ActorMessage::TakeReading(kind, serial, responder) => {
                self.handle_take_reading(kind, serial, responder).await;
            }
        }
    }

    async fn handle_connect(&mut self, responder: oneshot::Sender<Result<(), GatewayError>>) {
        match self.state() {
            ConnectionState::Authenticated => {
                let _ = responder.send(Ok(()));
            }
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Authenticating => {
                self.connect_waiters.push(responder);
            }
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Reconnecting => {
                self.connect_waiters.push(responder);
                self.reconnect_attempts = 0;
                self.begin_connect_attempt(false).await;
            }
        }
    }

    /// Dial the gateway once. `from_reconnect` distinguishes a dial fired by
    /// the automatic reconnection schedule (`TimeoutToken::Reconnect`) from
    /// an explicit `connect()`/queue-triggered attempt: only the former
    /// re-arms the backoff schedule on failure instead of giving up after a
    /// single try (`spec.md` §4.2, §8 invariant 5).
    async fn begin_connect_attempt(&mut self, from_reconnect: bool) {
        self.set_state(ConnectionState::Connecting);
        let deadline = self.config.connect_timeout();
        match tokio::time::timeout(deadline, (self.connect_fn)(self.record.url.clone())).await {
            Ok(Ok(transport)) => {
                self.transport = Some(transport);
                self.touch_activity();
                self.emit(ConnectionEvent::Open);
                self.set_state(ConnectionState::Connected);
                self.begin_login().await;
            }
            Ok(Err(e)) => {
                warn!(gateway_id = %self.record.id, "connect failed: {e}");
                if from_reconnect {
                    self.arm_reconnect().await;
                } else {
                    self.set_state(ConnectionState::Failed);
                    self.fail_connect_waiters(e);
                }
            }
            Err(_) => {
                warn!(gateway_id = %self.record.id, "connect timed out");
                if from_reconnect {
                    self.arm_reconnect().await;
                } else {
                    self.set_state(ConnectionState::Failed);
                    self.fail_connect_waiters(GatewayError::ConnectTimeout(deadline));
                }
            }
        }
    }

    async fn begin_login(&mut self) {
        self.set_state(ConnectionState::Authenticating);
        let cmd = OutboundCommand::Login {
            email: self.record.username.clone(),
            password: self.record.password.clone(),
        };
        self.write_frame_tracked(cmd, CommandKind::Login, None).await;
    }

    fn fail_connect_waiters(&mut self, err: GatewayError) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    async fn handle_close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.delay_queue.clear();
        self.login_timeout_key = None;
        self.reconnect_attempts = 0;
        self.cancel_all_pending(GatewayError::Cancelled);
        self.fail_connect_waiters(GatewayError::Cancelled);
        self.set_state(ConnectionState::Disconnected);
    }

    fn cancel_all_pending(&mut self, err: GatewayError) {
        for (_, mut slots) in self.pending_commands.drain() {
            for slot in slots.drain(..) {
                let _ = slot.responder.send(Err(err.clone()));
            }
        }
        for (_, mut slots) in self.pending_readings.drain() {
            for slot in slots.drain(..) {
                let _ = slot.responder.send(Err(err.clone()));
            }
        }
        for item in self.outbound_queue.drain(..) {
            match item {
                QueuedItem::Command { responder, .. } => {
                    let _ = responder.send(Err(err.clone()));
                }
                QueuedItem::Reading { responder, .. } => {
                    let _ = responder.send(Err(err.clone()));
                }
            }
        }
    }

    fn classify(&self, kind: CommandKind) -> Action {
        let state = self.state();
        if kind.requires_authentication() {
            match state {
                ConnectionState::Authenticated => Action::SendNow,
                ConnectionState::Connected | ConnectionState::Authenticating => Action::FailNotAuthenticated,
                _ => Action::Enqueue,
            }
        } else if state.is_send_capable() {
            Action::SendNow
        } else {
            Action::Enqueue
        }
    }

    async fn handle_send_command(
        &mut self,
        cmd: OutboundCommand,
        responder: oneshot::Sender<Result<ResponsePayload, GatewayError>>,
    ) {
        let kind = cmd.kind();
        match self.classify(kind) {
            Action::FailNotAuthenticated => {
                let _ = responder.send(Err(GatewayError::NotAuthenticated));
            }
            Action::SendNow => {
                self.write_frame_tracked(cmd, kind, Some(responder)).await;
            }
            Action::Enqueue => {
                self.outbound_queue.push_back(QueuedItem::Command { cmd, responder });
                self.maybe_kick_reconnect().await;
            }
        }
    }

    async fn handle_take_reading(
        &mut self,
        kind: ReadingKind,
        serial: u64,
        responder: oneshot::Sender<Result<Reading, GatewayError>>,
    ) {
        let cmd_kind = match kind {
            ReadingKind::Vibration => CommandKind::TakeDynReading,
            ReadingKind::Temperature => CommandKind::TakeDynTemp,
            ReadingKind::Battery => CommandKind::TakeDynBatt,
        };
        match self.classify(cmd_kind) {
            Action::FailNotAuthenticated => {
                let _ = responder.send(Err(GatewayError::NotAuthenticated));
            }
            Action::SendNow => {
                self.register_reading_listener(kind, serial, responder);
                let cmd = match kind {
                    ReadingKind::Vibration => OutboundCommand::TakeDynReading { serial },
                    ReadingKind::Temperature => OutboundCommand::TakeDynTemp { serial },
                    ReadingKind::Battery => OutboundCommand::TakeDynBatt { serial },
                };
                // The RTN_TAKE_DYN_* ack is swallowed: completion is signaled
                // by the NOT_DYN_* notification registered above, never by
                // this response (spec.md §8 boundary behaviors).
                self.write_frame_tracked(cmd, cmd_kind, None).await;
            }
            Action::Enqueue => {
                // The reading deadline starts once the TAKE_DYN_* frame is
                // actually dispatched (drain_queue), not here — otherwise a
                // reading requested during an outage could time out before
                // the frame was ever sent.
                self.outbound_queue.push_back(QueuedItem::Reading { kind, serial, responder });
                self.maybe_kick_reconnect().await;
            }
        }
    }

    fn register_reading_listener(
        &mut self,
        kind: ReadingKind,
        serial: u64,
        responder: oneshot::Sender<Result<Reading, GatewayError>>,
    ) {
        let tag = next_tag();
        let delay_key = self
            .delay_queue
            .insert(TimeoutToken::Reading { kind, serial, tag }, self.config.reading_timeout());
        self.pending_readings
            .entry((kind, serial))
            .or_default()
            .push_back(PendingReadingSlot { responder, delay_key });
    }

    /// `spec.md` §4.2: queueing a command while `DISCONNECTED`/`FAILED`
    /// triggers a reconnect attempt rather than waiting for an explicit
    /// `connect()` call.
    async fn maybe_kick_reconnect(&mut self) {
        if matches!(self.state(), ConnectionState::Disconnected | ConnectionState::Failed) {
            self.reconnect_attempts = 0;
            self.begin_connect_attempt(false).await;
        }
    }

    /// Write a frame to the wire and register whatever correlation it
    /// needs. Only called when the connection is already known
    /// send-capable (directly, or as the login/sub-changes handshake
    /// immediately after a transport opens).
    async fn write_frame_tracked(
        &mut self,
        cmd: OutboundCommand,
        kind: CommandKind,
        responder: Option<oneshot::Sender<Result<ResponsePayload, GatewayError>>>,
    ) {
        let Some(transport) = self.transport.as_mut() else {
            if let Some(responder) = responder {
                let _ = responder.send(Err(GatewayError::StreamError("no transport".into())));
            }
            return;
        };
        let encoded = cmd.encode();
        if let Err(e) = transport.send(encoded).await {
            if let Some(responder) = responder {
                let _ = responder.send(Err(e));
            }
            return;
        }
        self.touch_activity();
        if let Some(responder) = responder {
            let tag = next_tag();
            let delay_key = self.delay_queue.insert(TimeoutToken::Command { kind, tag }, self.config.command_timeout());
            self.pending_commands.entry(kind).or_default().push_back(PendingCommandSlot { responder, delay_key });
        } else if kind == CommandKind::Login {
            // POST_LOGIN has no pending-command waiter (the handshake
            // settles via connect_waiters, not the normal RTN_* correlation
            // path) but still needs a deadline — otherwise a server that
            // opens the socket and never answers leaves the Connection
            // stuck in AUTHENTICATING forever (spec.md §4.2).
            let tag = next_tag();
            let delay_key = self.delay_queue.insert(TimeoutToken::Command { kind, tag }, self.config.command_timeout());
            self.login_timeout_key = Some(delay_key);
        }
    }

    async fn maybe_ping(&mut self) {
        if self.transport.is_none() {
            return;
        }
        if self.last_activity.elapsed() < self.config.ping_inactivity_threshold() {
            return;
        }
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        if let Some(transport) = self.transport.as_mut() {
            let cmd = OutboundCommand::Ping { timestamp_ms };
            if transport.send(cmd.encode()).await.is_ok() {
                self.touch_activity();
            }
        }
    }

    // ── Inbound frame handling ───────────────────────────────

    async fn handle_transport_event(&mut self, ev: Option<TransportEvent>) {
        match ev {
            None => self.on_transport_closed(None).await,
            Some(TransportEvent::Closed(code)) => self.on_transport_closed(code).await,
            Some(TransportEvent::Text(text)) => {
                self.touch_activity();
                self.emit(ConnectionEvent::Message { type_name: peek_type(&text) });
                match decode_inbound(&text) {
                    Ok(frame) => self.dispatch_inbound(frame).await,
                    Err(e) => {
                        warn!(gateway_id = %self.record.id, "invalid frame: {e}");
                        self.emit(ConnectionEvent::Error((&e).into()));
                    }
                }
            }
        }
    }

    async fn on_transport_closed(&mut self, code: Option<u16>) {
        if self.transport.is_none() && self.state() != ConnectionState::Connecting {
            return; // already torn down (e.g. via explicit close())
        }
        self.transport = None;
        self.emit(ConnectionEvent::Close { code });

        let was_authenticated = self.state() == ConnectionState::Authenticated;
        self.cancel_all_pending_keep_queue(GatewayError::Cancelled);
        self.fail_connect_waiters(GatewayError::StreamError("connection closed".into()));

        if was_authenticated && !is_clean_close(code) {
            self.arm_reconnect().await;
        } else if was_authenticated {
            self.set_state(ConnectionState::Disconnected);
        } else {
            self.set_state(ConnectionState::Failed);
        }
    }

    /// Like [`Self::cancel_all_pending`] but preserves the outbound queue —
    /// frames never dispatched survive a reconnect (`spec.md` §4.2 "if the
    /// stream closes mid-drain, undispatched frames are re-enqueued").
    fn cancel_all_pending_keep_queue(&mut self, err: GatewayError) {
        for (_, mut slots) in self.pending_commands.drain() {
            for slot in slots.drain(..) {
                let _ = slot.responder.send(Err(err.clone()));
            }
        }
        for (_, mut slots) in self.pending_readings.drain() {
            for slot in slots.drain(..) {
                let _ = slot.responder.send(Err(err.clone()));
            }
        }
    }

    async fn arm_reconnect(&mut self) {
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.config.max_reconnect_attempts {
            error!(gateway_id = %self.record.id, "max reconnect attempts exceeded");
            self.set_state(ConnectionState::Failed);
            self.fail_connect_waiters(GatewayError::MaxReconnectAttemptsExceeded(self.config.max_reconnect_attempts));
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        let delay = self.config.reconnect_delay(self.reconnect_attempts);
        self.delay_queue.insert(TimeoutToken::Reconnect { attempt: self.reconnect_attempts }, delay);
    }

    async fn dispatch_inbound(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response { kind, payload } => self.on_response(kind, payload).await,
            InboundFrame::UnknownResponseType { type_name, .. } => {
                debug!(gateway_id = %self.record.id, %type_name, "unknown response type, no matching pending command");
                self.emit(ConnectionEvent::Error(GatewayErrorEvent {
                    message: format!("unknown response type: {type_name}"),
                }));
            }
            InboundFrame::Notification(n) => self.handle_notification(n).await,
            InboundFrame::Unrecognized(ty) => {
                debug!(gateway_id = %self.record.id, %ty, "unrecognized frame type, discarded");
            }
        }
    }

    async fn on_response(&mut self, kind: CommandKind, payload: ResponsePayload) {
        if kind == CommandKind::GetDynConnected {
            if let ResponsePayload::DynConnected(ref entries) = payload {
                let mut cache = self.cache.lock().expect("cache mutex poisoned");
                cache.replace_inventory(entries.iter().map(|e| (e.serial, e.part_number.clone(), e.connected)));
            }
        }

        let slot = self.pending_commands.get_mut(&kind).and_then(VecDeque::pop_front);
        if let Some(slot) = slot {
            self.delay_queue.remove(&slot.delay_key);
            let _ = slot.responder.send(Ok(payload.clone()));
        } else if kind != CommandKind::Login {
            // Login's own pending slot is consumed above in the common path
            // too; anything else with nobody waiting is logged, not dropped.
            debug!(gateway_id = %self.record.id, ?kind, "response with no pending command (late arrival)");
        }

        if kind == CommandKind::Login {
            self.on_login_response(payload).await;
        }
    }

    async fn on_login_response(&mut self, payload: ResponsePayload) {
        if let Some(key) = self.login_timeout_key.take() {
            self.delay_queue.remove(&key);
        }
        let success = matches!(payload, ResponsePayload::Login { success: true });
        if success {
            self.reconnect_attempts = 0;
            self.set_state(ConnectionState::Authenticated);
            self.write_frame_tracked(OutboundCommand::SubChanges, CommandKind::SubChanges, None).await;
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            self.delay_queue.insert(TimeoutToken::SettleThenDrain, std::time::Duration::from_millis(500));
        } else {
            warn!(gateway_id = %self.record.id, "authentication failed");
            self.set_state(ConnectionState::Failed);
            self.fail_connect_waiters(GatewayError::AuthFailed("server rejected credentials".into()));
        }
    }

    async fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::ApConn { connected } => {
                if connected {
                    debug!(gateway_id = %self.record.id, "access point link up");
                } else {
                    // Suppressed from external observation to prevent UI
                    // flicker (spec.md §9 open question 2) — logged only.
                    debug!(gateway_id = %self.record.id, "access point link down (suppressed)");
                }
            }
            Notification::DynConn { serial, connected } => {
                {
                    let mut cache = self.cache.lock().expect("cache mutex poisoned");
                    cache.set_sensor_connected(serial, connected);
                }
                if connected {
                    self.emit(ConnectionEvent::SensorConnected { serial });
                } else {
                    self.emit(ConnectionEvent::SensorDisconnected { serial });
                }
            }
            Notification::DynReadingStarted { serial } => {
                self.emit(ConnectionEvent::ReadingStarted { serial });
            }
            Notification::DynReading(r) => {
                let reading = Reading::Vibration(r);
                self.deliver_reading(ReadingKind::Vibration, reading.serial(), reading.clone());
                self.emit(ConnectionEvent::ReadingCompleted { reading });
            }
            Notification::DynTemp(r) => {
                let reading = Reading::Temperature(r);
                self.deliver_reading(ReadingKind::Temperature, reading.serial(), reading.clone());
                self.emit(ConnectionEvent::TemperatureReading { reading });
            }
            Notification::DynBatt(r) => {
                let reading = Reading::Battery(r);
                self.deliver_reading(ReadingKind::Battery, reading.serial(), reading.clone());
                self.emit(ConnectionEvent::BatteryReading { reading });
            }
            Notification::Raw { type_name, .. } => {
                debug!(gateway_id = %self.record.id, %type_name, "unrecognized notification subtype");
            }
        }
    }

    fn deliver_reading(&mut self, kind: ReadingKind, serial: u64, reading: Reading) {
        self.cache.lock().expect("cache mutex poisoned").insert_reading(reading.clone());
        if let Some(slot) = self.pending_readings.get_mut(&(kind, serial)).and_then(VecDeque::pop_front) {
            self.delay_queue.remove(&slot.delay_key);
            let _ = slot.responder.send(Ok(reading));
        }
        // No waiter: the reading is still cached (spec.md §9 open question
        // 4 — late notifications still update caches) but nobody is told.
    }

    // ── Timeout handling ──────────────────────────────────────

    async fn handle_timeout(&mut self, token: TimeoutToken) {
        match token {
            TimeoutToken::Command { kind, .. } => {
                if let Some(slot) = self.pending_commands.get_mut(&kind).and_then(VecDeque::pop_front) {
                    let _ = slot.responder.send(Err(GatewayError::CommandTimeout(kind)));
                }
                if kind == CommandKind::Login && self.state() == ConnectionState::Authenticating {
                    self.login_timeout_key = None;
                    self.set_state(ConnectionState::Failed);
                    self.fail_connect_waiters(GatewayError::AuthFailed("login timed out".into()));
                }
            }
            TimeoutToken::Reading { kind, serial, .. } => {
                if let Some(slot) = self.pending_readings.get_mut(&(kind, serial)).and_then(VecDeque::pop_front) {
                    let _ = slot.responder.send(Err(GatewayError::ReadingTimeout(serial)));
                }
            }
            TimeoutToken::SettleThenDrain => {
                self.drain_queue().await;
            }
            TimeoutToken::Reconnect { attempt } => {
                if attempt == self.reconnect_attempts {
                    self.begin_connect_attempt(true).await;
                }
            }
        }
    }

    /// Drain the outbound queue with `queueDrainPacingMs` pacing between
    /// frames. If the stream closes mid-drain, remaining items are left in
    /// the queue (pushed back onto the front) rather than dropped.
    async fn drain_queue(&mut self) {
        while let Some(item) = self.outbound_queue.pop_front() {
            if !self.state().is_send_capable() {
                self.outbound_queue.push_front(item);
                break;
            }
            match item {
                QueuedItem::Command { cmd, responder } => {
                    let kind = cmd.kind();
                    match self.classify(kind) {
                        Action::FailNotAuthenticated => {
                            let _ = responder.send(Err(GatewayError::NotAuthenticated));
                        }
                        _ => {
                            self.write_frame_tracked(cmd, kind, Some(responder)).await;
                        }
                    }
                }
                QueuedItem::Reading { kind, serial, responder } => {
                    self.register_reading_listener(kind, serial, responder);
                    let cmd = match kind {
                        ReadingKind::Vibration => OutboundCommand::TakeDynReading { serial },
                        ReadingKind::Temperature => OutboundCommand::TakeDynTemp { serial },
                        ReadingKind::Battery => OutboundCommand::TakeDynBatt { serial },
                    };
                    let cmd_kind = cmd.kind();
                    self.write_frame_tracked(cmd, cmd_kind, None).await;
                }
            }
            if !self.outbound_queue.is_empty() {
                tokio::time::sleep(self.config.queue_drain_pacing()).await;
            }
        }
    }
}

fn peek_type(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("Type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_default()
}
