//! UI-facing WebSocket gateway.
//!
//! Translates between the UI wire protocol and internal events, enforces
//! per-session subscription filters, and fans registry diffs, relay status
//! changes, and fleet snapshots out to every connected operator. The
//! gateway owns nothing upstream — it holds non-owning references to the
//! manager, registry, and orchestrator and feeds them UI requests.

pub mod session;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::config::FieldConfig;
use crate::error::RelayError;
use crate::fleet::{FleetOrchestrator, GoalPose, GoalRequest};
use crate::now_ms;
use crate::protocol::{
    AckDetails, AckPayload, CubeStateWire, CubeUpdatePayload, ErrorPayload, FleetStatePayload,
    GoalWire, HistoryWire, LogPayload, RelayStatusPayload, SnapshotPayload, StreamKind,
    SubscribeRequest, UiErrorCode, UiOutbound, UiRequest, UiRequestError,
};
use crate::registry::{CubeRegistry, CubeState, CubeUpdate, HISTORY_CAPACITY};
use crate::relay::manager::{
    LedCommand, ManagerEvent, ManualDriveCommand, RelayManager, RelayStatusEvent,
};

/// Per-session filter over streams and cube ids. A fresh session gets all
/// streams and no cube filter; an explicit `subscribe` replaces the record.
#[derive(Debug, Clone)]
pub struct Subscription {
    streams: HashSet<StreamKind>,
    cube_filter: HashSet<String>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            streams: StreamKind::ALL.into_iter().collect(),
            cube_filter: HashSet::new(),
        }
    }
}

impl Subscription {
    pub fn from_request(request: &SubscribeRequest) -> Self {
        let mut streams: HashSet<StreamKind> = StreamKind::ALL.into_iter().collect();
        if let Some(requested) = &request.streams {
            let parsed: HashSet<StreamKind> = requested
                .iter()
                .filter_map(|name| StreamKind::parse(name))
                .collect();
            if !parsed.is_empty() {
                streams = parsed;
            }
        }
        let cube_filter = request
            .cube_filter
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        Self {
            streams,
            cube_filter,
        }
    }

    pub fn allows_stream(&self, stream: StreamKind) -> bool {
        self.streams.is_empty() || self.streams.contains(&stream)
    }

    /// Empty filter means all cubes.
    pub fn allows_cube(&self, cube_id: &str) -> bool {
        self.cube_filter.is_empty() || self.cube_filter.contains(cube_id)
    }
}

struct SessionEntry {
    tx: mpsc::UnboundedSender<String>,
    subscription: Subscription,
}

struct GatewayShared {
    registry: Arc<CubeRegistry>,
    manager: Arc<RelayManager>,
    fleet: Arc<FleetOrchestrator>,
    field: FieldConfig,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    groups: Mutex<HashMap<String, Vec<String>>>,
    relay_status: Mutex<BTreeMap<String, RelayStatusPayload>>,
}

#[derive(Clone)]
pub struct UiGateway {
    shared: Arc<GatewayShared>,
}

impl UiGateway {
    pub fn new(
        registry: Arc<CubeRegistry>,
        manager: Arc<RelayManager>,
        fleet: Arc<FleetOrchestrator>,
        field: FieldConfig,
    ) -> Self {
        Self {
            shared: Arc::new(GatewayShared {
                registry,
                manager,
                fleet,
                field,
                sessions: Mutex::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                relay_status: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// The axum router serving the UI WebSocket endpoint.
    pub fn router(&self) -> axum::Router {
        session::router(self.clone())
    }

    /// Consume manager events and fan them out. Runs until the manager
    /// side of the channel closes.
    pub async fn run(self, mut events_rx: mpsc::UnboundedReceiver<ManagerEvent>) {
        while let Some(event) = events_rx.recv().await {
            self.dispatch_event(event);
        }
    }

    pub(crate) fn dispatch_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::RelayStatus(status) => self.publish_relay_status(status),
            ManagerEvent::CubeUpdates(updates) => self.publish_cube_updates(&updates),
            ManagerEvent::Log {
                level,
                message,
                context,
            } => self.publish_log(&level, &message, context),
        }
    }

    /// Install a session with the default subscription and send the
    /// opening snapshot. Returns the receiver the write loop drains. The
    /// snapshot is enqueued before the session becomes visible to the
    /// broadcast paths, so it is always the first envelope on the wire.
    pub(crate) fn register_session(&self, session_id: Uuid) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = SessionEntry {
            tx,
            subscription: Subscription::default(),
        };
        enqueue(
            &entry,
            &UiOutbound::Snapshot(self.build_snapshot(false)),
            now_ms(),
        );
        self.shared.sessions.lock().insert(session_id, entry);
        rx
    }

    /// Drop the session record. Nothing is enqueued for the session
    /// afterwards.
    pub(crate) fn unregister_session(&self, session_id: Uuid) {
        self.shared.sessions.lock().remove(&session_id);
    }

    /// Handle one inbound UI text frame.
    pub(crate) fn handle_request(&self, session_id: Uuid, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    target: "control_server::gateway",
                    %session_id,
                    error = %err,
                    "dropping invalid JSON from UI session"
                );
                return;
            }
        };

        let request_id = message
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(kind) = message.get("type").and_then(Value::as_str) else {
            self.send_error(
                session_id,
                &request_id,
                UiErrorCode::InvalidPayload,
                "message.type must be string",
            );
            return;
        };
        let payload = message
            .get("payload")
            .cloned()
            .unwrap_or_else(|| json!({}));

        match UiRequest::parse(kind, payload) {
            Ok(request) => self.dispatch_request(session_id, &request_id, request),
            Err(UiRequestError::UnknownType(other)) => self.send_error(
                session_id,
                &request_id,
                UiErrorCode::InvalidPayload,
                &format!("unknown command type: {other}"),
            ),
            Err(UiRequestError::Invalid(message)) => {
                self.send_error(session_id, &request_id, UiErrorCode::InvalidPayload, &message)
            }
        }
    }

    fn dispatch_request(&self, session_id: Uuid, request_id: &str, request: UiRequest) {
        match request {
            UiRequest::Subscribe(subscribe) => {
                let subscription = Subscription::from_request(&subscribe);
                if let Some(entry) = self.shared.sessions.lock().get_mut(&session_id) {
                    entry.subscription = subscription;
                }
                self.send_ack(session_id, request_id, None);
                self.send_field_info(session_id);
                if subscribe.include_history {
                    self.send_snapshot(session_id, true);
                }
            }
            UiRequest::ManualDrive(drive) => {
                let command = ManualDriveCommand {
                    targets: drive.targets,
                    left: drive.left,
                    right: drive.right,
                };
                match self.shared.manager.send_manual_drive(&command) {
                    Ok(()) => self.send_ack(session_id, request_id, None),
                    Err(err) => self.send_relay_error(session_id, request_id, &err),
                }
            }
            UiRequest::SetLed(set_led) => {
                let command = LedCommand {
                    targets: set_led.targets,
                    r: set_led.color.r,
                    g: set_led.color.g,
                    b: set_led.color.b,
                };
                match self.shared.manager.send_led_command(&command) {
                    Ok(()) => self.send_ack(session_id, request_id, None),
                    Err(err) => self.send_relay_error(session_id, request_id, &err),
                }
            }
            UiRequest::SetGoal(set_goal) => {
                let request = GoalRequest {
                    targets: set_goal.targets.clone(),
                    pose: GoalPose {
                        x: set_goal.goal.x,
                        y: set_goal.goal.y,
                        angle: set_goal.goal.angle,
                    },
                    priority: set_goal.priority,
                    keep_history: set_goal.keep_history,
                };
                match self.shared.fleet.assign_goal(request) {
                    Ok(goal_id) => {
                        self.shared.manager.apply_and_publish(vec![CubeUpdate {
                            goal_id: Some(goal_id.clone()),
                            ..CubeUpdate::new(set_goal.targets[0].clone(), Utc::now())
                        }]);
                        self.publish_fleet_state();
                        self.send_ack(session_id, request_id, Some(AckDetails { goal_id }));
                    }
                    Err(err) => self.send_error(
                        session_id,
                        request_id,
                        UiErrorCode::InvalidPayload,
                        &err.to_string(),
                    ),
                }
            }
            UiRequest::SetGroup(set_group) => {
                self.shared
                    .groups
                    .lock()
                    .insert(set_group.group_id, set_group.members);
                self.send_ack(session_id, request_id, None);
            }
            UiRequest::RequestSnapshot(snapshot) => {
                self.send_snapshot(session_id, snapshot.include_history);
                self.send_ack(session_id, request_id, None);
            }
        }
    }

    /// Stored group membership; groups are echo-only and never routed.
    pub fn group_members(&self, group_id: &str) -> Option<Vec<String>> {
        self.shared.groups.lock().get(group_id).cloned()
    }

    // -- publication ------------------------------------------------------

    fn publish_relay_status(&self, event: RelayStatusEvent) {
        let payload = RelayStatusPayload {
            relay_id: event.relay_id.clone(),
            status: event.status,
            message: event.message,
        };
        self.shared
            .relay_status
            .lock()
            .insert(event.relay_id, payload.clone());

        let timestamp = now_ms();
        let sessions = self.shared.sessions.lock();
        for entry in sessions.values() {
            if entry.subscription.allows_stream(StreamKind::RelayStatus) {
                enqueue(entry, &UiOutbound::RelayStatus(payload.clone()), timestamp);
            }
        }
    }

    /// Fan one diff batch out. The batch is re-filtered per session; a
    /// session whose filter leaves nothing receives no envelope at all.
    fn publish_cube_updates(&self, updates: &[CubeState]) {
        if updates.is_empty() {
            return;
        }
        let timestamp = now_ms();
        let sessions = self.shared.sessions.lock();
        for entry in sessions.values() {
            if !entry.subscription.allows_stream(StreamKind::CubeUpdate) {
                continue;
            }
            let batch: Vec<CubeStateWire> = updates
                .iter()
                .filter(|state| entry.subscription.allows_cube(&state.cube_id))
                .map(CubeStateWire::from)
                .collect();
            if batch.is_empty() {
                continue;
            }
            enqueue(
                entry,
                &UiOutbound::CubeUpdate(CubeUpdatePayload { updates: batch }),
                timestamp,
            );
        }
    }

    fn publish_log(&self, level: &str, message: &str, context: Value) {
        let payload = LogPayload {
            level: level.to_string(),
            message: message.to_string(),
            context,
        };
        let timestamp = now_ms();
        let sessions = self.shared.sessions.lock();
        for entry in sessions.values() {
            if entry.subscription.allows_stream(StreamKind::Log) {
                enqueue(entry, &UiOutbound::Log(payload.clone()), timestamp);
            }
        }
    }

    fn publish_fleet_state(&self) {
        let fleet = self.shared.fleet.snapshot();
        let payload = FleetStatePayload {
            tick_hz: fleet.tick_hz,
            tasks_in_queue: fleet.tasks_in_queue,
            warnings: fleet.warnings,
            active_goals: fleet.active_goals.iter().map(GoalWire::from).collect(),
        };
        let timestamp = now_ms();
        let sessions = self.shared.sessions.lock();
        for entry in sessions.values() {
            if entry.subscription.allows_stream(StreamKind::FleetState) {
                enqueue(entry, &UiOutbound::FleetState(payload.clone()), timestamp);
            }
        }
    }

    /// Send every connected session a courtesy log line and drop all
    /// session records.
    pub fn shutdown(&self) {
        let mut sessions = self.shared.sessions.lock();
        let farewell = UiOutbound::Log(LogPayload {
            level: "info".to_string(),
            message: "server stopping".to_string(),
            context: json!({}),
        });
        let timestamp = now_ms();
        for entry in sessions.values() {
            enqueue(entry, &farewell, timestamp);
        }
        sessions.clear();
    }

    // -- direct sends -----------------------------------------------------

    fn send_snapshot(&self, session_id: Uuid, include_history: bool) {
        let payload = self.build_snapshot(include_history);
        self.send_to_session(session_id, &UiOutbound::Snapshot(payload));
    }

    fn build_snapshot(&self, include_history: bool) -> SnapshotPayload {
        let relays: Vec<RelayStatusPayload> =
            self.shared.relay_status.lock().values().cloned().collect();
        let cubes: Vec<CubeStateWire> = self
            .shared
            .registry
            .snapshot()
            .iter()
            .map(CubeStateWire::from)
            .collect();
        let history = if include_history {
            self.shared
                .registry
                .history(HISTORY_CAPACITY)
                .iter()
                .map(|event| HistoryWire {
                    state: CubeStateWire::from(&event.state),
                    timestamp: event.timestamp.timestamp_millis(),
                })
                .collect()
        } else {
            Vec::new()
        };
        SnapshotPayload {
            field: self.shared.field,
            relays,
            cubes,
            history,
        }
    }

    fn send_field_info(&self, session_id: Uuid) {
        self.send_to_session(session_id, &UiOutbound::FieldInfo(self.shared.field));
    }

    fn send_ack(&self, session_id: Uuid, request_id: &str, details: Option<AckDetails>) {
        self.send_to_session(
            session_id,
            &UiOutbound::Ack(AckPayload {
                request_id: request_id.to_string(),
                details,
            }),
        );
    }

    fn send_error(&self, session_id: Uuid, request_id: &str, code: UiErrorCode, message: &str) {
        self.send_to_session(
            session_id,
            &UiOutbound::Error(ErrorPayload {
                request_id: request_id.to_string(),
                code,
                message: message.to_string(),
            }),
        );
    }

    fn send_relay_error(&self, session_id: Uuid, request_id: &str, err: &RelayError) {
        let code = match err {
            RelayError::UnknownCube(_) => UiErrorCode::UnknownCube,
            RelayError::RelayUnavailable(_) => UiErrorCode::RelayError,
            RelayError::InvalidCommand(_) => UiErrorCode::InvalidPayload,
        };
        self.send_error(session_id, request_id, code, &err.to_string());
    }

    fn send_to_session(&self, session_id: Uuid, outbound: &UiOutbound) {
        let sessions = self.shared.sessions.lock();
        if let Some(entry) = sessions.get(&session_id) {
            enqueue(entry, outbound, now_ms());
        }
    }
}

fn enqueue(entry: &SessionEntry, outbound: &UiOutbound, timestamp: i64) {
    if let Some(frame) = outbound.to_frame(timestamp) {
        let _ = entry.tx.send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlServerConfig;
    use crate::registry::LedUpdate;
    use serde_json::json;

    struct Fixture {
        gateway: UiGateway,
        manager: Arc<RelayManager>,
        registry: Arc<CubeRegistry>,
        events_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let config: ControlServerConfig = serde_json::from_value(json!({
                "ui": {"port": 8765},
                "relays": [
                    {"id": "r1", "uri": "ws://127.0.0.1:59001/ws", "cubes": ["abc", "def"]}
                ]
            }))
            .unwrap();
            let registry = Arc::new(CubeRegistry::new(&config));
            let fleet = Arc::new(FleetOrchestrator::new(Arc::clone(&registry)));
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let manager =
                RelayManager::new(&config, Arc::clone(&registry), events_tx).unwrap();
            let gateway = UiGateway::new(
                Arc::clone(&registry),
                Arc::clone(&manager),
                fleet,
                config.field,
            );
            Self {
                gateway,
                manager,
                registry,
                events_rx,
            }
        }

        fn open_session(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
            let session_id = Uuid::new_v4();
            let rx = self.gateway.register_session(session_id);
            (session_id, rx)
        }

        /// Forward queued manager events into the gateway, as the dispatch
        /// loop would.
        fn pump_events(&mut self) {
            while let Ok(event) = self.events_rx.try_recv() {
                self.gateway.dispatch_event(event);
            }
        }
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut collected = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            collected.push(serde_json::from_str(&frame).unwrap());
        }
        collected
    }

    #[tokio::test]
    async fn session_opens_with_snapshot() {
        let fixture = Fixture::new();
        let (_session_id, mut rx) = fixture.open_session();
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        let snapshot = &frames[0];
        assert_eq!(snapshot["type"], "snapshot");
        assert!(snapshot["timestamp"].is_i64());
        assert_eq!(snapshot["payload"]["field"]["top_left"], json!({"x": 45.0, "y": 45.0}));
        let cubes = snapshot["payload"]["cubes"].as_array().unwrap();
        assert_eq!(cubes.len(), 2);
        assert_eq!(cubes[0]["cube_id"], "abc");
        assert_eq!(cubes[0]["led"], json!({"r": 0, "g": 0, "b": 0}));
        assert!(snapshot["payload"]["history"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_acks_then_publishes_field_info() {
        let fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "subscribe",
                "request_id": "S1",
                "payload": {"streams": ["cube_update"], "cube_filter": ["abc"]}
            })
            .to_string(),
        );
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "ack");
        assert_eq!(frames[0]["payload"]["request_id"], "S1");
        assert_eq!(frames[1]["type"], "field_info");
        assert_eq!(frames[1]["payload"]["bottom_right"], json!({"x": 455.0, "y": 455.0}));
    }

    #[tokio::test]
    async fn subscribe_with_history_also_sends_snapshot() {
        let mut fixture = Fixture::new();
        fixture.manager.apply_and_publish(vec![CubeUpdate {
            led: Some(LedUpdate {
                r: Some(9),
                g: None,
                b: None,
            }),
            ..CubeUpdate::new("abc", Utc::now())
        }]);
        fixture.pump_events();

        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);
        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "subscribe",
                "request_id": "S1",
                "payload": {"include_history": true}
            })
            .to_string(),
        );
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2]["type"], "snapshot");
        let history = frames[2]["payload"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["cube_id"], "abc");
        assert!(history[0]["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn unknown_cube_set_led_yields_error_without_frames() {
        let fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "set_led",
                "request_id": "L1",
                "payload": {"targets": ["zzz"], "color": {"r": 255, "g": 0, "b": 0}}
            })
            .to_string(),
        );
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["payload"]["code"], "unknown_cube");
        assert_eq!(frames[0]["payload"]["request_id"], "L1");
        assert_eq!(fixture.registry.get("zzz"), None);
    }

    #[tokio::test]
    async fn disconnected_relay_yields_relay_error() {
        let fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "manual_drive",
                "request_id": "M1",
                "payload": {"targets": ["abc"], "left": 40, "right": 40}
            })
            .to_string(),
        );
        let frames = frames(&mut rx);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["payload"]["code"], "relay_error");
    }

    #[tokio::test]
    async fn out_of_range_speed_yields_invalid_payload() {
        let fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "manual_drive",
                "request_id": "M1",
                "payload": {"targets": ["abc"], "left": 400, "right": 0}
            })
            .to_string(),
        );
        let frames = frames(&mut rx);
        assert_eq!(frames[0]["payload"]["code"], "invalid_payload");
    }

    #[tokio::test]
    async fn set_goal_acks_with_goal_id_and_updates_fleet() {
        let mut fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "set_goal",
                "request_id": "G1",
                "payload": {
                    "targets": ["abc"],
                    "goal": {"x": 200.0, "y": 150.0, "angle": 90.0},
                    "priority": 3
                }
            })
            .to_string(),
        );
        fixture.pump_events();

        let frames = frames(&mut rx);
        let ack = frames
            .iter()
            .find(|frame| frame["type"] == "ack")
            .expect("ack expected");
        assert_eq!(ack["payload"]["request_id"], "G1");
        assert_eq!(ack["payload"]["details"]["goal_id"], "goal-1");

        let fleet_state = frames
            .iter()
            .find(|frame| frame["type"] == "fleet_state")
            .expect("fleet_state expected");
        assert_eq!(fleet_state["payload"]["tasks_in_queue"], 1);
        assert_eq!(
            fleet_state["payload"]["active_goals"][0]["cube_id"],
            "abc"
        );
        assert_eq!(
            fleet_state["payload"]["active_goals"][0]["pose"],
            json!({"x": 200.0, "y": 150.0, "angle": 90.0})
        );

        let cube_update = frames
            .iter()
            .find(|frame| frame["type"] == "cube_update")
            .expect("cube_update expected");
        assert_eq!(
            cube_update["payload"]["updates"][0]["goal_id"],
            "goal-1"
        );
    }

    #[tokio::test]
    async fn empty_goal_targets_do_not_advance_counter() {
        let fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "set_goal",
                "request_id": "G0",
                "payload": {"targets": [], "goal": {"x": 1.0, "y": 1.0}}
            })
            .to_string(),
        );
        let error_frames = frames(&mut rx);
        assert_eq!(error_frames[0]["type"], "error");
        assert_eq!(error_frames[0]["payload"]["code"], "invalid_payload");

        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "set_goal",
                "request_id": "G1",
                "payload": {"targets": ["abc"], "goal": {"x": 1.0, "y": 1.0}}
            })
            .to_string(),
        );
        let frames = frames(&mut rx);
        let ack = frames
            .iter()
            .find(|frame| frame["type"] == "ack")
            .expect("ack expected");
        assert_eq!(ack["payload"]["details"]["goal_id"], "goal-1");
    }

    #[tokio::test]
    async fn cube_filter_limits_update_batches() {
        let mut fixture = Fixture::new();
        let (session_a, mut rx_a) = fixture.open_session();
        let (_session_b, mut rx_b) = fixture.open_session();
        let _ = frames(&mut rx_a);
        let _ = frames(&mut rx_b);

        fixture.gateway.handle_request(
            session_a,
            &json!({
                "type": "subscribe",
                "request_id": "S1",
                "payload": {"cube_filter": ["abc"]}
            })
            .to_string(),
        );
        let _ = frames(&mut rx_a);

        fixture.manager.apply_and_publish(vec![
            CubeUpdate {
                battery: Some(70),
                ..CubeUpdate::new("abc", Utc::now())
            },
            CubeUpdate {
                battery: Some(60),
                ..CubeUpdate::new("def", Utc::now())
            },
        ]);
        fixture.pump_events();

        let frames_a = frames(&mut rx_a);
        assert_eq!(frames_a.len(), 1);
        let updates_a = frames_a[0]["payload"]["updates"].as_array().unwrap();
        assert_eq!(updates_a.len(), 1);
        assert_eq!(updates_a[0]["cube_id"], "abc");

        let frames_b = frames(&mut rx_b);
        assert_eq!(frames_b.len(), 1);
        let updates_b = frames_b[0]["payload"]["updates"].as_array().unwrap();
        assert_eq!(updates_b.len(), 2);
    }

    #[tokio::test]
    async fn filtered_out_batch_sends_nothing() {
        let mut fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);
        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "subscribe",
                "payload": {"cube_filter": ["def"]}
            })
            .to_string(),
        );
        let _ = frames(&mut rx);

        fixture.manager.apply_and_publish(vec![CubeUpdate {
            battery: Some(70),
            ..CubeUpdate::new("abc", Utc::now())
        }]);
        fixture.pump_events();
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn stream_gate_precedes_cube_filter() {
        let mut fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);
        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "subscribe",
                "payload": {"streams": ["log"]}
            })
            .to_string(),
        );
        let _ = frames(&mut rx);

        fixture.manager.apply_and_publish(vec![CubeUpdate {
            battery: Some(70),
            ..CubeUpdate::new("abc", Utc::now())
        }]);
        fixture.gateway.dispatch_event(ManagerEvent::RelayStatus(RelayStatusEvent {
            relay_id: "r1".to_string(),
            status: crate::relay::connection::RelayConnectionState::Connecting,
            message: "connecting".to_string(),
        }));
        fixture.pump_events();
        assert!(frames(&mut rx).is_empty());

        fixture
            .gateway
            .dispatch_event(ManagerEvent::Log {
                level: "info".to_string(),
                message: "hello".to_string(),
                context: json!({}),
            });
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "log");
    }

    #[tokio::test]
    async fn unknown_type_echoes_invalid_payload() {
        let fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.handle_request(
            session_id,
            &json!({"type": "fly", "request_id": "X1", "payload": {}}).to_string(),
        );
        let frames = frames(&mut rx);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["payload"]["code"], "invalid_payload");
        assert!(frames[0]["payload"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown command type"));
        assert_eq!(frames[0]["payload"]["request_id"], "X1");
    }

    #[tokio::test]
    async fn malformed_json_is_dropped_silently() {
        let fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);
        fixture.gateway.handle_request(session_id, "{not json");
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn set_group_is_stored_and_acknowledged() {
        let fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.handle_request(
            session_id,
            &json!({
                "type": "set_group",
                "request_id": "GR1",
                "payload": {"group_id": "team-a", "members": ["abc", "zzz"]}
            })
            .to_string(),
        );
        let frames = frames(&mut rx);
        assert_eq!(frames[0]["type"], "ack");
        // Membership is not validated against the cube table.
        assert_eq!(
            fixture.gateway.group_members("team-a").unwrap(),
            vec!["abc".to_string(), "zzz".to_string()]
        );
    }

    #[tokio::test]
    async fn closed_session_receives_nothing_further() {
        let mut fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.unregister_session(session_id);
        fixture.manager.apply_and_publish(vec![CubeUpdate {
            battery: Some(70),
            ..CubeUpdate::new("abc", Utc::now())
        }]);
        fixture.pump_events();
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn relay_status_is_latest_wins_in_snapshot() {
        let fixture = Fixture::new();
        fixture
            .gateway
            .dispatch_event(ManagerEvent::RelayStatus(RelayStatusEvent {
                relay_id: "r1".to_string(),
                status: crate::relay::connection::RelayConnectionState::Connecting,
                message: "connecting".to_string(),
            }));
        fixture
            .gateway
            .dispatch_event(ManagerEvent::RelayStatus(RelayStatusEvent {
                relay_id: "r1".to_string(),
                status: crate::relay::connection::RelayConnectionState::Stopped,
                message: "connect error".to_string(),
            }));

        let (_session_id, mut rx) = fixture.open_session();
        let frames = frames(&mut rx);
        let relays = frames[0]["payload"]["relays"].as_array().unwrap();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0]["status"], "stopped");
    }

    #[tokio::test]
    async fn shutdown_sends_farewell_and_clears_sessions() {
        let fixture = Fixture::new();
        let (session_id, mut rx) = fixture.open_session();
        let _ = frames(&mut rx);

        fixture.gateway.shutdown();
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "log");
        assert_eq!(frames[0]["payload"]["message"], "server stopping");

        // The record is gone; direct sends are no-ops now.
        fixture.gateway.send_ack(session_id, "X", None);
        assert!(rx.try_recv().is_err());
    }
}
