//! Wire protocol types for both WebSocket boundaries.
//!
//! Upstream (relay) and downstream (UI) payloads are schema-light JSON on
//! the wire. Both directions are converted to the typed records in this
//! module at the boundary; raw `serde_json::Value` survives only as log
//! context. Unknown fields are ignored, matching what the relays and the
//! browser UI actually emit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::FieldConfig;
use crate::fleet::GoalAssignment;
use crate::registry::{CubeActivity, CubeState, LedColor, Pose};
use crate::relay::connection::RelayConnectionState;

// ---------------------------------------------------------------------------
// Upstream: control server -> relay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayOutbound {
    Command(RelayCommand),
    Query(RelayQuery),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayCommand {
    pub cmd: RelayCmd,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<RelayCommandParams>,
    pub require_result: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayCmd {
    Connect,
    Disconnect,
    Move,
    Led,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RelayCommandParams {
    Move { left_speed: i32, right_speed: i32 },
    Led { r: u8, g: u8, b: u8 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayQuery {
    pub info: RelayQueryInfo,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayQueryInfo {
    Battery,
    Position,
}

impl RelayOutbound {
    pub fn connect(target: impl Into<String>) -> Self {
        Self::Command(RelayCommand {
            cmd: RelayCmd::Connect,
            target: target.into(),
            params: None,
            require_result: false,
        })
    }

    pub fn drive(target: impl Into<String>, left_speed: i32, right_speed: i32) -> Self {
        Self::Command(RelayCommand {
            cmd: RelayCmd::Move,
            target: target.into(),
            params: Some(RelayCommandParams::Move {
                left_speed,
                right_speed,
            }),
            require_result: false,
        })
    }

    pub fn led(target: impl Into<String>, r: u8, g: u8, b: u8) -> Self {
        Self::Command(RelayCommand {
            cmd: RelayCmd::Led,
            target: target.into(),
            params: Some(RelayCommandParams::Led { r, g, b }),
            require_result: false,
        })
    }

    pub fn query_position_notify(target: impl Into<String>) -> Self {
        Self::Query(RelayQuery {
            info: RelayQueryInfo::Position,
            target: target.into(),
            notify: Some(true),
        })
    }

    pub fn query_battery(target: impl Into<String>) -> Self {
        Self::Query(RelayQuery {
            info: RelayQueryInfo::Battery,
            target: target.into(),
            notify: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Upstream: relay -> control server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayInbound {
    Response(RelayResponse),
    Result(Option<Value>),
    System(RelaySystem),
    Error(RelayErrorMessage),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayResponse {
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub position: Option<WirePose>,
    #[serde(default)]
    pub battery_level: Option<i64>,
    #[serde(default)]
    pub led: Option<WireLed>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WirePose {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub angle: Option<f64>,
    #[serde(default)]
    pub on_mat: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WireLed {
    #[serde(default)]
    pub r: Option<i64>,
    #[serde(default)]
    pub g: Option<i64>,
    #[serde(default)]
    pub b: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelaySystem {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RelaySystem {
    /// The full payload reassembled for log context.
    pub fn as_log_value(&self) -> Value {
        let mut map = self.extra.clone();
        if let Some(target) = &self.target {
            map.insert("target".to_string(), Value::String(target.clone()));
        }
        if let Some(status) = &self.status {
            map.insert("status".to_string(), Value::String(status.clone()));
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayErrorMessage {
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Downstream: UI -> control server
// ---------------------------------------------------------------------------

/// Why an inbound UI message could not be turned into a [`UiRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiRequestError {
    UnknownType(String),
    Invalid(String),
}

#[derive(Debug, Clone)]
pub enum UiRequest {
    Subscribe(SubscribeRequest),
    ManualDrive(ManualDriveRequest),
    SetLed(SetLedRequest),
    SetGoal(SetGoalRequest),
    SetGroup(SetGroupRequest),
    RequestSnapshot(SnapshotRequest),
}

impl UiRequest {
    pub fn parse(kind: &str, payload: Value) -> Result<Self, UiRequestError> {
        fn typed<T: serde::de::DeserializeOwned>(
            kind: &str,
            payload: Value,
        ) -> Result<T, UiRequestError> {
            serde_json::from_value(payload)
                .map_err(|err| UiRequestError::Invalid(format!("{kind}: {err}")))
        }

        match kind {
            "subscribe" => typed(kind, payload).map(Self::Subscribe),
            "manual_drive" => typed(kind, payload).map(Self::ManualDrive),
            "set_led" => typed(kind, payload).map(Self::SetLed),
            "set_goal" => {
                let request: SetGoalRequest = typed(kind, payload)?;
                if request.targets.is_empty() {
                    return Err(UiRequestError::Invalid(
                        "set_goal.targets must be non-empty array".to_string(),
                    ));
                }
                Ok(Self::SetGoal(request))
            }
            "set_group" => {
                let request: SetGroupRequest = typed(kind, payload)?;
                if request.group_id.is_empty() {
                    return Err(UiRequestError::Invalid("group_id is required".to_string()));
                }
                Ok(Self::SetGroup(request))
            }
            "request_snapshot" => typed(kind, payload).map(Self::RequestSnapshot),
            other => Err(UiRequestError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub streams: Option<Vec<String>>,
    #[serde(default)]
    pub cube_filter: Option<Vec<String>>,
    #[serde(default)]
    pub include_history: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualDriveRequest {
    pub targets: Vec<String>,
    #[serde(default)]
    pub left: i32,
    #[serde(default)]
    pub right: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetLedRequest {
    pub targets: Vec<String>,
    #[serde(default)]
    pub color: LedColorRequest,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LedColorRequest {
    #[serde(default)]
    pub r: u8,
    #[serde(default)]
    pub g: u8,
    #[serde(default)]
    pub b: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetGoalRequest {
    pub targets: Vec<String>,
    pub goal: GoalPoseRequest,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub keep_history: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct GoalPoseRequest {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub angle: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetGroupRequest {
    #[serde(default)]
    pub group_id: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SnapshotRequest {
    #[serde(default)]
    pub include_history: bool,
}

/// The four broadcast streams a session can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    RelayStatus,
    CubeUpdate,
    FleetState,
    Log,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::RelayStatus,
        StreamKind::CubeUpdate,
        StreamKind::FleetState,
        StreamKind::Log,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "relay_status" => Some(Self::RelayStatus),
            "cube_update" => Some(Self::CubeUpdate),
            "fleet_state" => Some(Self::FleetState),
            "log" => Some(Self::Log),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Downstream: control server -> UI
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum UiOutbound {
    Ack(AckPayload),
    Error(ErrorPayload),
    Snapshot(SnapshotPayload),
    FieldInfo(FieldConfig),
    RelayStatus(RelayStatusPayload),
    CubeUpdate(CubeUpdatePayload),
    FleetState(FleetStatePayload),
    Log(LogPayload),
}

impl UiOutbound {
    /// Render the final wire frame, injecting the envelope timestamp
    /// (milliseconds since the Unix epoch) next to `type` and `payload`.
    pub fn to_frame(&self, timestamp_ms: i64) -> Option<String> {
        let mut value = serde_json::to_value(self).ok()?;
        value
            .as_object_mut()?
            .insert("timestamp".to_string(), timestamp_ms.into());
        Some(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AckPayload {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<AckDetails>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckDetails {
    pub goal_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub request_id: String,
    pub code: UiErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiErrorCode {
    InvalidPayload,
    UnknownCube,
    RelayError,
    /// Reserved for future backpressure handling.
    Busy,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatusPayload {
    pub relay_id: String,
    pub status: RelayConnectionState,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CubeUpdatePayload {
    pub updates: Vec<CubeStateWire>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CubeStateWire {
    pub cube_id: String,
    pub relay_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Pose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    pub state: CubeActivity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    pub led: LedColor,
}

impl From<&CubeState> for CubeStateWire {
    fn from(state: &CubeState) -> Self {
        Self {
            cube_id: state.cube_id.clone(),
            relay_id: state.relay_id.clone(),
            position: state.position,
            battery: state.battery,
            state: state.state,
            goal_id: state.goal_id.clone(),
            led: state.led,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatePayload {
    pub tick_hz: f64,
    pub tasks_in_queue: usize,
    pub warnings: Vec<String>,
    pub active_goals: Vec<GoalWire>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalWire {
    pub goal_id: String,
    pub cube_id: String,
    pub priority: i32,
    pub created_at: i64,
    pub pose: GoalPoseWire,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalPoseWire {
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
}

impl From<&GoalAssignment> for GoalWire {
    fn from(goal: &GoalAssignment) -> Self {
        Self {
            goal_id: goal.goal_id.clone(),
            cube_id: goal.cube_id.clone(),
            priority: goal.priority,
            created_at: goal.created_at.timestamp_millis(),
            pose: GoalPoseWire {
                x: goal.pose.x,
                y: goal.pose.y,
                angle: goal.pose.angle,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPayload {
    pub level: String,
    pub message: String,
    pub context: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotPayload {
    pub field: FieldConfig,
    pub relays: Vec<RelayStatusPayload>,
    pub cubes: Vec<CubeStateWire>,
    pub history: Vec<HistoryWire>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryWire {
    #[serde(flatten)]
    pub state: CubeStateWire,
    pub timestamp: i64,
}
