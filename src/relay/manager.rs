//! Routing and telemetry ingestion across all relay connections.
//!
//! The manager owns one [`RelayConnection`] per configured relay and the
//! immutable `cube_id -> relay_id` routing table. High-level commands are
//! translated into relay JSON here; inbound envelopes are normalized into
//! registry updates. Everything the UI needs to hear about leaves through
//! the [`ManagerEvent`] channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ControlServerConfig, RelayConfig};
use crate::error::{RelayError, RelayResult};
use crate::protocol::{RelayInbound, RelayOutbound, RelayResponse, RelaySystem};
use crate::registry::{CubeRegistry, CubeState, CubeUpdate, LedUpdate, PoseUpdate};
use crate::relay::connection::{
    ConnectionEvent, RelayConnection, RelayConnectionOptions, RelayConnectionState, RelayUri,
    UriError,
};

#[derive(Debug, Clone)]
pub struct RelayStatusEvent {
    pub relay_id: String,
    pub status: RelayConnectionState,
    pub message: String,
}

/// Everything the manager reports upward to the UI gateway.
#[derive(Debug)]
pub enum ManagerEvent {
    RelayStatus(RelayStatusEvent),
    /// Cubes whose observable state actually changed, in cube-id order.
    CubeUpdates(Vec<CubeState>),
    Log {
        level: String,
        message: String,
        context: Value,
    },
}

#[derive(Debug, Clone)]
pub struct ManualDriveCommand {
    pub targets: Vec<String>,
    pub left: i32,
    pub right: i32,
}

#[derive(Debug, Clone)]
pub struct LedCommand {
    pub targets: Vec<String>,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

pub struct RelayManager {
    relays: HashMap<String, RelayHandle>,
    cube_to_relay: HashMap<String, String>,
    registry: Arc<CubeRegistry>,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    // Keeps apply+publish atomic so same-cube diffs leave in order.
    publish_lock: Mutex<()>,
}

struct RelayHandle {
    config: RelayConfig,
    connection: RelayConnection,
}

impl RelayManager {
    /// Build the routing table, spawn one connection per relay, and start
    /// the ingest task. Connections stay idle until [`start`](Self::start).
    pub fn new(
        config: &ControlServerConfig,
        registry: Arc<CubeRegistry>,
        events_tx: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Result<Arc<Self>, UriError> {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let reconnect_delay = Duration::from_millis(u64::from(config.relay_reconnect_ms));

        let mut relays = HashMap::new();
        let mut cube_to_relay = HashMap::new();
        for relay_config in &config.relays {
            let uri = RelayUri::parse(&relay_config.uri)?;
            let connection = RelayConnection::spawn(
                RelayConnectionOptions {
                    relay_id: relay_config.id.clone(),
                    uri,
                    reconnect_delay,
                },
                conn_tx.clone(),
            );
            for cube in &relay_config.cubes {
                cube_to_relay.insert(cube.clone(), relay_config.id.clone());
            }
            relays.insert(
                relay_config.id.clone(),
                RelayHandle {
                    config: relay_config.clone(),
                    connection,
                },
            );
        }

        let manager = Arc::new(Self {
            relays,
            cube_to_relay,
            registry,
            events_tx,
            publish_lock: Mutex::new(()),
        });
        tokio::spawn(Arc::clone(&manager).ingest_loop(conn_rx));
        Ok(manager)
    }

    pub fn start(&self) {
        for handle in self.relays.values() {
            handle.connection.start();
        }
    }

    pub fn stop(&self) {
        for handle in self.relays.values() {
            handle.connection.stop();
        }
    }

    pub fn relay_state(&self, relay_id: &str) -> Option<RelayConnectionState> {
        self.relays
            .get(relay_id)
            .map(|handle| handle.connection.state())
    }

    pub fn relay_for_cube(&self, cube_id: &str) -> Option<&str> {
        self.cube_to_relay.get(cube_id).map(String::as_str)
    }

    /// Drive one or more cubes. Every target is validated before any frame
    /// is emitted; a single bad target means zero frames hit any relay.
    pub fn send_manual_drive(&self, command: &ManualDriveCommand) -> RelayResult<()> {
        if command.targets.is_empty() {
            return Err(RelayError::InvalidCommand(
                "manual_drive requires at least one target".to_string(),
            ));
        }
        if !(-100..=100).contains(&command.left) || !(-100..=100).contains(&command.right) {
            return Err(RelayError::InvalidCommand(
                "wheel speeds must be within -100..=100".to_string(),
            ));
        }

        let connections = self.resolve_targets(&command.targets)?;
        for (target, connection) in connections {
            connection.send(&RelayOutbound::drive(target, command.left, command.right));
        }
        Ok(())
    }

    /// Set LED color on one or more cubes. On success the registry is
    /// updated optimistically so the UI sees immediate feedback; a later
    /// relay echo reconciles if the cube disagrees.
    pub fn send_led_command(&self, command: &LedCommand) -> RelayResult<()> {
        if command.targets.is_empty() {
            return Err(RelayError::InvalidCommand(
                "set_led requires at least one target".to_string(),
            ));
        }

        let connections = self.resolve_targets(&command.targets)?;
        for (target, connection) in connections {
            connection.send(&RelayOutbound::led(target, command.r, command.g, command.b));
        }

        let now = Utc::now();
        let updates = command
            .targets
            .iter()
            .map(|cube| CubeUpdate {
                led: Some(LedUpdate {
                    r: Some(i64::from(command.r)),
                    g: Some(i64::from(command.g)),
                    b: Some(i64::from(command.b)),
                }),
                ..CubeUpdate::new(cube.clone(), now)
            })
            .collect();
        self.apply_and_publish(updates);
        Ok(())
    }

    /// Apply registry updates and broadcast the resulting diff as one
    /// event. Callers outside telemetry (goal echo) use this too so every
    /// cube_update leaves through the same ordered path.
    pub fn apply_and_publish(&self, updates: Vec<CubeUpdate>) {
        let _guard = self.publish_lock.lock();
        let changed = self.registry.apply_updates(updates);
        if !changed.is_empty() {
            let _ = self.events_tx.send(ManagerEvent::CubeUpdates(changed));
        }
    }

    fn resolve_targets<'a>(
        &'a self,
        targets: &[String],
    ) -> RelayResult<Vec<(String, &'a RelayConnection)>> {
        let mut resolved = Vec::with_capacity(targets.len());
        for target in targets {
            let relay_id = self
                .cube_to_relay
                .get(target)
                .ok_or_else(|| RelayError::UnknownCube(target.clone()))?;
            let handle = self
                .relays
                .get(relay_id)
                .ok_or_else(|| RelayError::RelayUnavailable(relay_id.clone()))?;
            if handle.connection.state() != RelayConnectionState::Connected {
                return Err(RelayError::RelayUnavailable(relay_id.clone()));
            }
            resolved.push((target.clone(), &handle.connection));
        }
        Ok(resolved)
    }

    async fn ingest_loop(self: Arc<Self>, mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = conn_rx.recv().await {
            match event {
                ConnectionEvent::Status {
                    relay_id,
                    state,
                    detail,
                } => self.handle_status(&relay_id, state, &detail),
                ConnectionEvent::Frame { relay_id, inbound } => {
                    self.handle_inbound(&relay_id, inbound)
                }
            }
        }
    }

    pub(crate) fn handle_status(
        &self,
        relay_id: &str,
        state: RelayConnectionState,
        detail: &str,
    ) {
        let _ = self
            .events_tx
            .send(ManagerEvent::RelayStatus(RelayStatusEvent {
                relay_id: relay_id.to_string(),
                status: state,
                message: detail.to_string(),
            }));

        // Cubes only leave connected=false through this re-bootstrap.
        if state == RelayConnectionState::Connected {
            self.bootstrap_relay(relay_id);
        }
    }

    fn bootstrap_relay(&self, relay_id: &str) {
        let Some(handle) = self.relays.get(relay_id) else {
            return;
        };
        for frame in bootstrap_frames(&handle.config.cubes) {
            handle.connection.send(&frame);
        }
    }

    pub(crate) fn handle_inbound(&self, relay_id: &str, inbound: RelayInbound) {
        match inbound {
            RelayInbound::Response(response) => self.handle_response(relay_id, response),
            RelayInbound::Result(result) => debug!(
                target: "control_server::relay",
                relay_id,
                result = ?result,
                "ignoring relay result envelope"
            ),
            RelayInbound::System(system) => self.handle_system(relay_id, system),
            RelayInbound::Error(error) => {
                let _ = self.events_tx.send(ManagerEvent::Log {
                    level: "error".to_string(),
                    message: error.message,
                    context: json!({"relay_id": relay_id}),
                });
            }
        }
    }

    fn handle_response(&self, relay_id: &str, response: RelayResponse) {
        if response.target.is_empty() {
            return;
        }
        let now = Utc::now();
        let update = match response.info.as_str() {
            "position" => {
                let mut update = CubeUpdate::new(response.target.clone(), now);
                if let Some(pose) = response.position {
                    update.position = Some(PoseUpdate {
                        x: pose.x,
                        y: pose.y,
                        deg: pose.angle,
                        on_mat: pose.on_mat,
                    });
                }
                if let Some(led) = response.led {
                    update.led = Some(LedUpdate {
                        r: led.r,
                        g: led.g,
                        b: led.b,
                    });
                }
                update
            }
            "battery" => {
                let Some(level) = response.battery_level else {
                    return;
                };
                if !(0..=100).contains(&level) {
                    warn!(
                        target: "control_server::relay",
                        relay_id,
                        cube_id = %response.target,
                        battery_level = level,
                        "dropping out-of-range battery level"
                    );
                    return;
                }
                CubeUpdate {
                    battery: Some(level as u8),
                    ..CubeUpdate::new(response.target.clone(), now)
                }
            }
            "led" => {
                let Some(led) = response.led else {
                    return;
                };
                CubeUpdate {
                    led: Some(LedUpdate {
                        r: led.r,
                        g: led.g,
                        b: led.b,
                    }),
                    ..CubeUpdate::new(response.target.clone(), now)
                }
            }
            other => {
                debug!(
                    target: "control_server::relay",
                    relay_id,
                    info = other,
                    "ignoring relay response"
                );
                return;
            }
        };
        self.apply_and_publish(vec![update]);
    }

    fn handle_system(&self, relay_id: &str, system: RelaySystem) {
        let _ = self.events_tx.send(ManagerEvent::Log {
            level: "info".to_string(),
            message: "relay system message".to_string(),
            context: json!({"relay_id": relay_id, "message": system.as_log_value()}),
        });

        // Per-cube connectivity flips ride on system envelopes. Last-known
        // observables survive a disconnect until fresh telemetry arrives.
        if let (Some(target), Some(status)) = (&system.target, &system.status) {
            let connected = match status.as_str() {
                "connected" => Some(true),
                "disconnected" => Some(false),
                _ => None,
            };
            if let Some(connected) = connected {
                self.apply_and_publish(vec![CubeUpdate {
                    connected: Some(connected),
                    ..CubeUpdate::new(target.clone(), Utc::now())
                }]);
            }
        }
    }
}

/// The ordered bootstrap trio for every cube on a freshly connected relay:
/// connect, position query with notify, battery query.
pub fn bootstrap_frames(cubes: &[String]) -> Vec<RelayOutbound> {
    let mut frames = Vec::with_capacity(cubes.len() * 3);
    for cube in cubes {
        frames.push(RelayOutbound::connect(cube.clone()));
        frames.push(RelayOutbound::query_position_notify(cube.clone()));
        frames.push(RelayOutbound::query_battery(cube.clone()));
    }
    frames
}
