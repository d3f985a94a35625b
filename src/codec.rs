//! Wire schema for the gateway JSON protocol and the codec that turns bytes
//! into typed frames (and back).
//!
//! Every inbound frame is a JSON object carrying at least a string `Type`.
//! Three families are distinguished by prefix: `POST_*` (client → server
//! command), `RTN_*` (server's direct response to a prior command), and
//! `NOT_*` (unsolicited server-initiated notification). See `spec.md` §4.1
//! for the full table this module reproduces.

use chrono::{DateTime, Utc};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::GatewayError;

// ═══════════════════════════════════════════════════════════════
// Flexible field decoding
// ═══════════════════════════════════════════════════════════════

/// Sensor serials are sent as bare numbers in most frames but as quoted
/// strings in at least one documented notification shape. Accept either and
/// normalize to `u64` so the rest of the crate never has to care.
fn deserialize_flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(D::Error::custom),
    }
}

/// `Connected` is documented as `{0,1}` in some frames and a JSON boolean in
/// others. Accept either.
fn deserialize_flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrInt {
        B(bool),
        I(i64),
    }
    match BoolOrInt::deserialize(deserializer)? {
        BoolOrInt::B(b) => Ok(b),
        BoolOrInt::I(i) => Ok(i != 0),
    }
}

// ═══════════════════════════════════════════════════════════════
// Commands (client → server)
// ═══════════════════════════════════════════════════════════════

/// Every command the protocol recognizes, tagged rather than stringly typed
/// so correlation never has to compare raw `Type` strings at each call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Login,
    SubChanges,
    GetDynConnected,
    TakeDynReading,
    TakeDynTemp,
    TakeDynBatt,
    GetDynReadings,
    GetDynTemps,
    GetDynBatts,
    Ping,
}

impl CommandKind {
    /// The `Type` string sent on the wire for this command.
    pub fn post_type(self) -> &'static str {
        match self {
            Self::Login => "POST_LOGIN",
            Self::SubChanges => "POST_SUB_CHANGES",
            Self::GetDynConnected => "GET_DYN_CONNECTED",
            Self::TakeDynReading => "TAKE_DYN_READING",
            Self::TakeDynTemp => "TAKE_DYN_TEMP",
            Self::TakeDynBatt => "TAKE_DYN_BATT",
            Self::GetDynReadings => "GET_DYN_READINGS",
            Self::GetDynTemps => "GET_DYN_TEMPS",
            Self::GetDynBatts => "GET_DYN_BATTS",
            Self::Ping => "PING",
        }
    }

    /// The `Type` string this command's direct `RTN_*` response carries, if
    /// the server sends one at all (`PING` does not).
    pub fn response_type(self) -> Option<&'static str> {
        match self {
            Self::Login => Some("RTN_LOGIN"),
            Self::SubChanges => Some("RTN_SUB_CHANGES"),
            Self::GetDynConnected => Some("RTN_DYN_CONNECTED"),
            Self::TakeDynReading => Some("RTN_TAKE_DYN_READING"),
            Self::TakeDynTemp => Some("RTN_TAKE_DYN_TEMP"),
            Self::TakeDynBatt => Some("RTN_TAKE_DYN_BATT"),
            Self::GetDynReadings => Some("RTN_DYN_READINGS"),
            Self::GetDynTemps => Some("RTN_DYN_TEMPS"),
            Self::GetDynBatts => Some("RTN_DYN_BATTS"),
            Self::Ping => None,
        }
    }

    /// Reverse lookup: which command does this `RTN_*` type answer?
    pub fn from_rtn_type(ty: &str) -> Option<Self> {
        match ty {
            "RTN_LOGIN" => Some(Self::Login),
            "RTN_SUB_CHANGES" => Some(Self::SubChanges),
            "RTN_DYN_CONNECTED" => Some(Self::GetDynConnected),
            "RTN_TAKE_DYN_READING" => Some(Self::TakeDynReading),
            "RTN_TAKE_DYN_TEMP" => Some(Self::TakeDynTemp),
            "RTN_TAKE_DYN_BATT" => Some(Self::TakeDynBatt),
            "RTN_DYN_READINGS" => Some(Self::GetDynReadings),
            "RTN_DYN_TEMPS" => Some(Self::GetDynTemps),
            "RTN_DYN_BATTS" => Some(Self::GetDynBatts),
            _ => None,
        }
    }

    /// Whether this command may only be issued once authenticated (all of
    /// them except login itself and the liveness ping).
    pub fn requires_authentication(self) -> bool {
        !matches!(self, Self::Login | Self::Ping)
    }
}

/// A command ready to be encoded onto the wire.
#[derive(Debug, Clone)]
pub enum OutboundCommand {
    Login { email: String, password: String },
    SubChanges,
    GetDynConnected,
    TakeDynReading { serial: u64 },
    TakeDynTemp { serial: u64 },
    TakeDynBatt { serial: u64 },
    GetDynReadings { serial: u64, count: u32 },
    GetDynTemps { serial: u64, count: u32 },
    GetDynBatts { serial: u64, count: u32 },
    Ping { timestamp_ms: i64 },
}

impl OutboundCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Login { .. } => CommandKind::Login,
            Self::SubChanges => CommandKind::SubChanges,
            Self::GetDynConnected => CommandKind::GetDynConnected,
            Self::TakeDynReading { .. } => CommandKind::TakeDynReading,
            Self::TakeDynTemp { .. } => CommandKind::TakeDynTemp,
            Self::TakeDynBatt { .. } => CommandKind::TakeDynBatt,
            Self::GetDynReadings { .. } => CommandKind::GetDynReadings,
            Self::GetDynTemps { .. } => CommandKind::GetDynTemps,
            Self::GetDynBatts { .. } => CommandKind::GetDynBatts,
            Self::Ping { .. } => CommandKind::Ping,
        }
    }

    fn data(&self) -> Value {
        match self {
            Self::Login { email, password } => json!({ "Email": email, "Password": password }),
            Self::SubChanges | Self::GetDynConnected => json!({}),
            Self::TakeDynReading { serial }
            | Self::TakeDynTemp { serial }
            | Self::TakeDynBatt { serial } => json!({ "DynSerial": serial }),
            Self::GetDynReadings { serial, count }
            | Self::GetDynTemps { serial, count }
            | Self::GetDynBatts { serial, count } => {
                json!({ "DynSerial": serial, "Count": count })
            }
            Self::Ping { timestamp_ms } => json!({ "timestamp": timestamp_ms }),
        }
    }

    /// Serialize as the `{Type, From, To, Data}` command envelope.
    pub fn encode(&self) -> String {
        json!({
            "Type": self.kind().post_type(),
            "From": "UI",
            "To": "SERV",
            "Data": self.data(),
        })
        .to_string()
    }
}

// ═══════════════════════════════════════════════════════════════
// Reading kinds (§3 data model)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingKind {
    Vibration,
    Temperature,
    Battery,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VibrationReading {
    pub id: u64,
    pub serial: u64,
    pub time: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub id: u64,
    pub serial: u64,
    pub time: String,
    pub temp_c: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryReading {
    pub id: u64,
    pub serial: u64,
    pub time: String,
    pub percent: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Vibration(VibrationReading),
    Temperature(TemperatureReading),
    Battery(BatteryReading),
}

impl Reading {
    pub fn id(&self) -> u64 {
        match self {
            Self::Vibration(r) => r.id,
            Self::Temperature(r) => r.id,
            Self::Battery(r) => r.id,
        }
    }

    pub fn serial(&self) -> u64 {
        match self {
            Self::Vibration(r) => r.serial,
            Self::Temperature(r) => r.serial,
            Self::Battery(r) => r.serial,
        }
    }

    pub fn kind(&self) -> ReadingKind {
        match self {
            Self::Vibration(_) => ReadingKind::Vibration,
            Self::Temperature(_) => ReadingKind::Temperature,
            Self::Battery(_) => ReadingKind::Battery,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VibrationReadingWire {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(rename = "Serial", deserialize_with = "deserialize_flexible_u64")]
    serial: u64,
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "X")]
    x: f64,
    #[serde(rename = "Y")]
    y: f64,
    #[serde(rename = "Z")]
    z: f64,
}

impl From<VibrationReadingWire> for VibrationReading {
    fn from(w: VibrationReadingWire) -> Self {
        Self { id: w.id, serial: w.serial, time: w.time, x: w.x, y: w.y, z: w.z }
    }
}

#[derive(Debug, Deserialize)]
struct TemperatureReadingWire {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(rename = "Serial", deserialize_with = "deserialize_flexible_u64")]
    serial: u64,
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Temp")]
    temp_c: f64,
}

impl From<TemperatureReadingWire> for TemperatureReading {
    fn from(w: TemperatureReadingWire) -> Self {
        Self { id: w.id, serial: w.serial, time: w.time, temp_c: w.temp_c }
    }
}

#[derive(Debug, Deserialize)]
struct BatteryReadingWire {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(rename = "Serial", deserialize_with = "deserialize_flexible_u64")]
    serial: u64,
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Batt")]
    percent: u32,
}

impl From<BatteryReadingWire> for BatteryReading {
    fn from(w: BatteryReadingWire) -> Self {
        Self { id: w.id, serial: w.serial, time: w.time, percent: w.percent }
    }
}

/// `GET_DYN_CONNECTED`'s `RTN_DYN_CONNECTED.Dynamizers[]` entries.
#[derive(Debug, Clone, Deserialize)]
pub struct DynamizerWire {
    #[serde(rename = "DynSerial", alias = "Serial", deserialize_with = "deserialize_flexible_u64")]
    pub serial: u64,
    #[serde(rename = "PartNumber", default)]
    pub part_number: String,
    #[serde(rename = "Connected", default, deserialize_with = "deserialize_flexible_bool")]
    pub connected: bool,
}

// ═══════════════════════════════════════════════════════════════
// Responses (RTN_*) and notifications (NOT_*)
// ═══════════════════════════════════════════════════════════════

/// Parsed `Data` payload of a `RTN_*` frame, or the raw value if strict
/// schema validation failed (tolerant-fallback path, `spec.md` §4.1).
#[derive(Debug, Clone)]
pub enum ResponsePayload {
    Login { success: bool },
    SubChanges,
    DynConnected(Vec<DynamizerWire>),
    TakeDynReadingAck,
    TakeDynTempAck,
    TakeDynBattAck,
    DynReadings(Vec<VibrationReading>),
    DynTemps(Vec<TemperatureReading>),
    DynBatts(Vec<BatteryReading>),
    /// Schema validation failed but the frame was structurally a response;
    /// never silently dropped.
    Raw(Value),
}

#[derive(Debug, Clone)]
pub enum Notification {
    ApConn { connected: bool },
    DynConn { serial: u64, connected: bool },
    DynReadingStarted { serial: u64 },
    DynReading(VibrationReading),
    DynTemp(TemperatureReading),
    DynBatt(BatteryReading),
    /// Unrecognized `NOT_*` subtype, or one whose schema didn't validate.
    Raw { type_name: String, data: Value },
}

#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// A direct response to a previously issued command.
    Response { kind: CommandKind, payload: ResponsePayload },
    /// A `RTN_*` frame whose type doesn't match any known command. Still
    /// surfaced (never silently dropped) so the caller can log it as
    /// `UnknownResponse`.
    UnknownResponseType { type_name: String, data: Value },
    /// An unsolicited server-initiated notification.
    Notification(Notification),
    /// `Type` doesn't start with `RTN_`/`NOT_` and isn't a recognized
    /// oddity — logged and discarded per `spec.md` §4.1 (e.g.
    /// `PING_RESPONSE`, `*_ACK`).
    Unrecognized(String),
}

/// Parse one inbound wire frame.
///
/// Returns `InvalidFrame` only when the text isn't JSON, isn't an object, or
/// lacks a string `Type` — every other case (including schema mismatches on
/// an otherwise well-formed response/notification) degrades to a tolerant
/// variant rather than an error, per the decoding policy in `spec.md` §4.1.
pub fn decode_inbound(raw: &str) -> Result<InboundFrame, GatewayError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| GatewayError::InvalidFrame(format!("not valid JSON: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| GatewayError::InvalidFrame("frame is not a JSON object".into()))?;
    let ty = obj
        .get("Type")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidFrame("frame missing string Type".into()))?
        .to_string();
    let data = obj.get("Data").cloned().unwrap_or(Value::Null);

    if ty.starts_with("RTN_") {
        return Ok(decode_response(&ty, data));
    }
    if let Some(suffix) = ty.strip_prefix("NOT_") {
        return Ok(InboundFrame::Notification(decode_notification(suffix, data)));
    }
    Ok(InboundFrame::Unrecognized(ty))
}

fn decode_response(ty: &str, data: Value) -> InboundFrame {
    match CommandKind::from_rtn_type(ty) {
        Some(kind) => {
            let payload = parse_response_payload(kind, &data).unwrap_or(ResponsePayload::Raw(data));
            InboundFrame::Response { kind, payload }
        }
        None => InboundFrame::UnknownResponseType { type_name: ty.to_string(), data },
    }
}

fn parse_response_payload(kind: CommandKind, data: &Value) -> Option<ResponsePayload> {
    match kind {
        CommandKind::Login => {
            #[derive(Deserialize)]
            struct D {
                #[serde(rename = "Success")]
                success: bool,
            }
            serde_json::from_value::<D>(data.clone())
                .ok()
                .map(|d| ResponsePayload::Login { success: d.success })
        }
        CommandKind::SubChanges => Some(ResponsePayload::SubChanges),
        CommandKind::GetDynConnected => {
            #[derive(Deserialize)]
            struct D {
                #[serde(rename = "Dynamizers")]
                dynamizers: Vec<DynamizerWire>,
            }
            serde_json::from_value::<D>(data.clone())
                .ok()
                .map(|d| ResponsePayload::DynConnected(d.dynamizers))
        }
        CommandKind::TakeDynReading => Some(ResponsePayload::TakeDynReadingAck),
        CommandKind::TakeDynTemp => Some(ResponsePayload::TakeDynTempAck),
        CommandKind::TakeDynBatt => Some(ResponsePayload::TakeDynBattAck),
        CommandKind::GetDynReadings => {
            #[derive(Deserialize)]
            struct D {
                #[serde(rename = "Readings")]
                readings: Vec<VibrationReadingWire>,
            }
            serde_json::from_value::<D>(data.clone())
                .ok()
                .map(|d| ResponsePayload::DynReadings(d.readings.into_iter().map(Into::into).collect()))
        }
        CommandKind::GetDynTemps => {
            #[derive(Deserialize)]
            struct D {
                #[serde(rename = "Temperatures")]
                temperatures: Vec<TemperatureReadingWire>,
            }
            serde_json::from_value::<D>(data.clone())
                .ok()
                .map(|d| ResponsePayload::DynTemps(d.temperatures.into_iter().map(Into::into).collect()))
        }
        CommandKind::GetDynBatts => {
            #[derive(Deserialize)]
            struct D {
                #[serde(rename = "Batteries")]
                batteries: Vec<BatteryReadingWire>,
            }
            serde_json::from_value::<D>(data.clone())
                .ok()
                .map(|d| ResponsePayload::DynBatts(d.batteries.into_iter().map(Into::into).collect()))
        }
        CommandKind::Ping => None,
    }
}

fn decode_notification(ty: &str, data: Value) -> Notification {
    let full_ty = format!("NOT_{ty}");
    match ty {
        "AP_CONN" => {
            #[derive(Deserialize)]
            struct D {
                #[serde(rename = "Connected", deserialize_with = "deserialize_flexible_bool")]
                connected: bool,
            }
            match serde_json::from_value::<D>(data.clone()) {
                Ok(d) => Notification::ApConn { connected: d.connected },
                Err(_) => Notification::Raw { type_name: full_ty, data },
            }
        }
        "DYN_CONN" => {
            #[derive(Deserialize)]
            struct D {
                #[serde(rename = "DynSerial", deserialize_with = "deserialize_flexible_u64")]
                serial: u64,
                #[serde(rename = "Connected", deserialize_with = "deserialize_flexible_bool")]
                connected: bool,
            }
            match serde_json::from_value::<D>(data.clone()) {
                Ok(d) => Notification::DynConn { serial: d.serial, connected: d.connected },
                Err(_) => Notification::Raw { type_name: full_ty, data },
            }
        }
        "DYN_READING_STARTED" => {
            #[derive(Deserialize)]
            struct D {
                #[serde(rename = "DynSerial", deserialize_with = "deserialize_flexible_u64")]
                serial: u64,
            }
            match serde_json::from_value::<D>(data.clone()) {
                Ok(d) => Notification::DynReadingStarted { serial: d.serial },
                Err(_) => Notification::Raw { type_name: full_ty, data },
            }
        }
        "DYN_READING" => match serde_json::from_value::<VibrationReadingWire>(data.clone()) {
            Ok(w) => Notification::DynReading(w.into()),
            Err(_) => Notification::Raw { type_name: full_ty, data },
        },
        "DYN_TEMP" => match serde_json::from_value::<TemperatureReadingWire>(data.clone()) {
            Ok(w) => Notification::DynTemp(w.into()),
            Err(_) => Notification::Raw { type_name: full_ty, data },
        },
        "DYN_BATT" => match serde_json::from_value::<BatteryReadingWire>(data.clone()) {
            Ok(w) => Notification::DynBatt(w.into()),
            Err(_) => Notification::Raw { type_name: full_ty, data },
        },
        _ => Notification::Raw { type_name: full_ty, data },
    }
}

/// Timestamp stamped locally when a cache entry is created/updated — not
/// part of the wire schema (`spec.md` §3, `SensorInventoryEntry.lastSeenAt`).
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_login_command_envelope() {
        let cmd = OutboundCommand::Login { email: "op@example.com".into(), password: "hunter2".into() };
        let encoded = cmd.encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["Type"], "POST_LOGIN");
        assert_eq!(value["From"], "UI");
        assert_eq!(value["To"], "SERV");
        assert_eq!(value["Data"]["Email"], "op@example.com");
        assert_eq!(value["Data"]["Password"], "hunter2");
    }

    #[test]
    fn encodes_take_reading_with_dyn_serial() {
        let cmd = OutboundCommand::TakeDynBatt { serial: 1234 };
        let encoded = cmd.encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["Type"], "TAKE_DYN_BATT");
        assert_eq!(value["Data"]["DynSerial"], 1234);
    }

    #[test]
    fn decodes_login_success_response() {
        let raw = r#"{"Type":"RTN_LOGIN","Target":"UI","Data":{"Success":true}}"#;
        match decode_inbound(raw).unwrap() {
            InboundFrame::Response { kind: CommandKind::Login, payload: ResponsePayload::Login { success } } => {
                assert!(success);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_battery_notification_with_string_serial() {
        // spec.md §8 scenario S2: Serial arrives quoted.
        let raw = r#"{"Type":"NOT_DYN_BATT","Target":"UI","Data":{"ID":7,"Serial":"1234","Batt":87,"Time":"2025-01-01T00:00:00Z"}}"#;
        match decode_inbound(raw).unwrap() {
            InboundFrame::Notification(Notification::DynBatt(r)) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.serial, 1234);
                assert_eq!(r.percent, 87);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_ap_conn_with_integer_connected() {
        let raw = r#"{"Type":"NOT_AP_CONN","Target":"UI","Data":{"Connected":1}}"#;
        match decode_inbound(raw).unwrap() {
            InboundFrame::Notification(Notification::ApConn { connected }) => assert!(connected),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tolerant_fallback_on_schema_mismatch_still_resolves_response() {
        // Known RTN_ type but Data is missing the required field — schema
        // validation fails, but the frame is not dropped.
        let raw = r#"{"Type":"RTN_LOGIN","Target":"UI","Data":{"unexpected":true}}"#;
        match decode_inbound(raw).unwrap() {
            InboundFrame::Response { kind: CommandKind::Login, payload: ResponsePayload::Raw(_) } => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_rtn_type_is_not_silently_dropped() {
        let raw = r#"{"Type":"RTN_SOMETHING_NEW","Target":"UI","Data":{}}"#;
        match decode_inbound(raw).unwrap() {
            InboundFrame::UnknownResponseType { type_name, .. } => assert_eq!(type_name, "RTN_SOMETHING_NEW"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_type_is_discarded() {
        let raw = r#"{"Type":"PING_RESPONSE"}"#;
        match decode_inbound(raw).unwrap() {
            InboundFrame::Unrecognized(ty) => assert_eq!(ty, "PING_RESPONSE"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_non_object_frame() {
        assert!(decode_inbound("[1,2,3]").is_err());
    }

    #[test]
    fn rejects_frame_missing_type() {
        assert!(decode_inbound(r#"{"Data":{}}"#).is_err());
    }

    #[test]
    fn unknown_notification_subtype_falls_back_to_raw() {
        let raw = r#"{"Type":"NOT_FUTURE_THING","Target":"UI","Data":{"foo":1}}"#;
        match decode_inbound(raw).unwrap() {
            InboundFrame::Notification(Notification::Raw { type_name, .. }) => {
                assert_eq!(type_name, "NOT_FUTURE_THING");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
