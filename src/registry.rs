//! Authoritative in-memory store for every cube's observable state.
//!
//! The registry is the single source of truth for cube observables; no
//! other component caches them. `apply_updates` returns only the cubes
//! whose state actually changed, which is what keeps re-sent telemetry
//! from turning into UI broadcast storms.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::config::ControlServerConfig;

/// Number of change events retained for `snapshot` with `include_history`.
pub const HISTORY_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl LedColor {
    pub const OFF: LedColor = LedColor { r: 0, g: 0, b: 0 };
}

/// Last reported pose on the mat. `deg` is kept in [0, 360).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub deg: f64,
    pub on_mat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CubeActivity {
    Idle,
    Moving,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CubeState {
    pub cube_id: String,
    pub relay_id: String,
    pub connected: bool,
    pub battery: Option<u8>,
    pub position: Option<Pose>,
    pub led: LedColor,
    pub state: CubeActivity,
    pub goal_id: Option<String>,
    pub last_update: DateTime<Utc>,
}

/// Partial update against one cube. Absent fields leave the stored value
/// untouched.
#[derive(Debug, Clone)]
pub struct CubeUpdate {
    pub cube_id: String,
    pub timestamp: DateTime<Utc>,
    pub connected: Option<bool>,
    pub battery: Option<u8>,
    pub position: Option<PoseUpdate>,
    pub led: Option<LedUpdate>,
    pub state: Option<CubeActivity>,
    pub goal_id: Option<String>,
}

impl CubeUpdate {
    pub fn new(cube_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            cube_id: cube_id.into(),
            timestamp,
            connected: None,
            battery: None,
            position: None,
            led: None,
            state: None,
            goal_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoseUpdate {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub deg: Option<f64>,
    pub on_mat: Option<bool>,
}

impl PoseUpdate {
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.deg.is_none() && self.on_mat.is_none()
    }
}

/// LED channels as received off the wire; clamped to 0..=255 on apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedUpdate {
    pub r: Option<i64>,
    pub g: Option<i64>,
    pub b: Option<i64>,
}

/// One entry of the bounded change history.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub state: CubeState,
    pub timestamp: DateTime<Utc>,
}

pub struct CubeRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    cubes: HashMap<String, CubeState>,
    history: VecDeque<ChangeEvent>,
}

impl CubeRegistry {
    /// Seed one entry per configured cube. Cubes start disconnected with
    /// the LED off and no pose; telemetry fills the rest in.
    pub fn new(config: &ControlServerConfig) -> Self {
        let now = Utc::now();
        let mut cubes = HashMap::new();
        for relay in &config.relays {
            for cube_id in &relay.cubes {
                cubes.insert(
                    cube_id.clone(),
                    CubeState {
                        cube_id: cube_id.clone(),
                        relay_id: relay.id.clone(),
                        connected: false,
                        battery: None,
                        position: None,
                        led: LedColor::OFF,
                        state: CubeActivity::Unknown,
                        goal_id: None,
                        last_update: now,
                    },
                );
            }
        }
        Self {
            inner: Mutex::new(Inner {
                cubes,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            }),
        }
    }

    /// Apply one update; returns the post-update snapshot iff any
    /// observable actually changed.
    pub fn apply_update(&self, update: CubeUpdate) -> Option<CubeState> {
        let mut inner = self.inner.lock();
        apply_locked(&mut inner, update)
    }

    /// Apply a batch; returns the changed cubes in stable cube-id order.
    pub fn apply_updates(&self, updates: Vec<CubeUpdate>) -> Vec<CubeState> {
        let mut inner = self.inner.lock();
        let mut changed: Vec<CubeState> = Vec::new();
        for update in updates {
            if let Some(state) = apply_locked(&mut inner, update) {
                changed.retain(|existing| existing.cube_id != state.cube_id);
                changed.push(state);
            }
        }
        changed.sort_by(|a, b| a.cube_id.cmp(&b.cube_id));
        changed
    }

    /// Full current state, sorted by cube id.
    pub fn snapshot(&self) -> Vec<CubeState> {
        let inner = self.inner.lock();
        let mut cubes: Vec<CubeState> = inner.cubes.values().cloned().collect();
        cubes.sort_by(|a, b| a.cube_id.cmp(&b.cube_id));
        cubes
    }

    /// The most recent change events, oldest first, at most `limit`.
    pub fn history(&self, limit: usize) -> Vec<ChangeEvent> {
        let inner = self.inner.lock();
        let skip = inner.history.len().saturating_sub(limit);
        inner.history.iter().skip(skip).cloned().collect()
    }

    pub fn get(&self, cube_id: &str) -> Option<CubeState> {
        self.inner.lock().cubes.get(cube_id).cloned()
    }
}

fn apply_locked(inner: &mut Inner, update: CubeUpdate) -> Option<CubeState> {
    let Some(cube) = inner.cubes.get_mut(&update.cube_id) else {
        warn!(
            target: "control_server::registry",
            cube_id = %update.cube_id,
            "dropping update for unregistered cube"
        );
        return None;
    };

    let before = cube.clone();

    if let Some(connected) = update.connected {
        cube.connected = connected;
    }
    if let Some(battery) = update.battery {
        cube.battery = Some(battery.min(100));
    }
    if let Some(pose_update) = update.position {
        if !pose_update.is_empty() {
            let mut pose = cube.position.unwrap_or(Pose {
                x: 0.0,
                y: 0.0,
                deg: 0.0,
                on_mat: false,
            });
            if let Some(x) = pose_update.x {
                pose.x = x;
            }
            if let Some(y) = pose_update.y {
                pose.y = y;
            }
            if let Some(deg) = pose_update.deg {
                pose.deg = deg.rem_euclid(360.0);
            }
            if let Some(on_mat) = pose_update.on_mat {
                pose.on_mat = on_mat;
            }
            cube.position = Some(pose);
        }
    }
    if let Some(led) = update.led {
        if let Some(r) = led.r {
            cube.led.r = clamp_channel(r);
        }
        if let Some(g) = led.g {
            cube.led.g = clamp_channel(g);
        }
        if let Some(b) = led.b {
            cube.led.b = clamp_channel(b);
        }
    }
    if let Some(state) = update.state {
        cube.state = state;
    }
    if let Some(goal_id) = update.goal_id {
        cube.goal_id = Some(goal_id);
    }

    if observables_eq(&before, cube) {
        return None;
    }

    cube.last_update = cube.last_update.max(update.timestamp);
    let snapshot = cube.clone();
    if inner.history.len() >= HISTORY_CAPACITY {
        inner.history.pop_front();
    }
    inner.history.push_back(ChangeEvent {
        state: snapshot.clone(),
        timestamp: snapshot.last_update,
    });
    Some(snapshot)
}

fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

/// Everything except `last_update` counts as an observable.
fn observables_eq(a: &CubeState, b: &CubeState) -> bool {
    a.connected == b.connected
        && a.battery == b.battery
        && a.position == b.position
        && a.led == b.led
        && a.state == b.state
        && a.goal_id == b.goal_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn registry() -> CubeRegistry {
        let config: ControlServerConfig = serde_json::from_value(json!({
            "ui": {"port": 8765},
            "relays": [
                {"id": "r1", "uri": "ws://127.0.0.1:9000/ws", "cubes": ["abc", "def"]},
                {"id": "r2", "uri": "ws://127.0.0.1:9001/ws", "cubes": ["ghi"]}
            ]
        }))
        .unwrap();
        CubeRegistry::new(&config)
    }

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn seeds_every_configured_cube() {
        let registry = registry();
        let snapshot = registry.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|c| c.cube_id.as_str()).collect();
        assert_eq!(ids, vec!["abc", "def", "ghi"]);
        for cube in &snapshot {
            assert!(!cube.connected);
            assert_eq!(cube.led, LedColor::OFF);
            assert_eq!(cube.state, CubeActivity::Unknown);
            assert!(cube.position.is_none());
            assert!(cube.battery.is_none());
        }
        assert_eq!(registry.get("abc").unwrap().relay_id, "r1");
        assert_eq!(registry.get("ghi").unwrap().relay_id, "r2");
    }

    #[test]
    fn identical_updates_emit_one_diff() {
        let registry = registry();
        let update = CubeUpdate {
            battery: Some(80),
            ..CubeUpdate::new("abc", ts(1))
        };
        assert!(registry.apply_update(update.clone()).is_some());
        assert!(registry.apply_update(update.clone()).is_none());
        assert!(registry.apply_update(update).is_none());
    }

    #[test]
    fn led_channels_are_clamped() {
        let registry = registry();
        let changed = registry.apply_update(CubeUpdate {
            led: Some(LedUpdate {
                r: Some(300),
                g: Some(-5),
                b: Some(128),
            }),
            ..CubeUpdate::new("abc", ts(1))
        });
        let led = changed.unwrap().led;
        assert_eq!(led, LedColor { r: 255, g: 0, b: 128 });
    }

    #[test]
    fn battery_is_clamped_to_percent() {
        let registry = registry();
        let changed = registry.apply_update(CubeUpdate {
            battery: Some(250),
            ..CubeUpdate::new("abc", ts(1))
        });
        assert_eq!(changed.unwrap().battery, Some(100));
    }

    #[test]
    fn angle_is_normalized() {
        let registry = registry();
        let changed = registry.apply_update(CubeUpdate {
            position: Some(PoseUpdate {
                x: Some(100.0),
                y: Some(120.0),
                deg: Some(450.0),
                on_mat: Some(true),
            }),
            ..CubeUpdate::new("abc", ts(1))
        });
        assert_eq!(changed.unwrap().position.unwrap().deg, 90.0);

        let changed = registry.apply_update(CubeUpdate {
            position: Some(PoseUpdate {
                deg: Some(-90.0),
                ..PoseUpdate::default()
            }),
            ..CubeUpdate::new("abc", ts(2))
        });
        assert_eq!(changed.unwrap().position.unwrap().deg, 270.0);
    }

    #[test]
    fn partial_pose_merges_with_last_known() {
        let registry = registry();
        registry.apply_update(CubeUpdate {
            position: Some(PoseUpdate {
                x: Some(10.0),
                y: Some(20.0),
                deg: Some(45.0),
                on_mat: Some(true),
            }),
            ..CubeUpdate::new("abc", ts(1))
        });
        let changed = registry.apply_update(CubeUpdate {
            position: Some(PoseUpdate {
                x: Some(11.0),
                ..PoseUpdate::default()
            }),
            ..CubeUpdate::new("abc", ts(2))
        });
        let pose = changed.unwrap().position.unwrap();
        assert_eq!(pose.x, 11.0);
        assert_eq!(pose.y, 20.0);
        assert_eq!(pose.deg, 45.0);
        assert!(pose.on_mat);
    }

    #[test]
    fn empty_pose_update_is_ignored() {
        let registry = registry();
        let changed = registry.apply_update(CubeUpdate {
            position: Some(PoseUpdate::default()),
            ..CubeUpdate::new("abc", ts(1))
        });
        assert!(changed.is_none());
        assert!(registry.get("abc").unwrap().position.is_none());
    }

    #[test]
    fn batch_diff_is_sorted_and_deduplicated() {
        let registry = registry();
        let changed = registry.apply_updates(vec![
            CubeUpdate {
                battery: Some(50),
                ..CubeUpdate::new("ghi", ts(1))
            },
            CubeUpdate {
                battery: Some(60),
                ..CubeUpdate::new("abc", ts(1))
            },
            CubeUpdate {
                battery: Some(61),
                ..CubeUpdate::new("abc", ts(2))
            },
        ]);
        let ids: Vec<&str> = changed.iter().map(|c| c.cube_id.as_str()).collect();
        assert_eq!(ids, vec!["abc", "ghi"]);
        assert_eq!(changed[0].battery, Some(61));
    }

    #[test]
    fn last_update_never_regresses() {
        let registry = registry();
        registry.apply_update(CubeUpdate {
            battery: Some(50),
            ..CubeUpdate::new("abc", ts(10))
        });
        registry.apply_update(CubeUpdate {
            battery: Some(51),
            ..CubeUpdate::new("abc", ts(5))
        });
        assert_eq!(registry.get("abc").unwrap().last_update, ts(10));
    }

    #[test]
    fn unregistered_cube_is_dropped() {
        let registry = registry();
        let changed = registry.apply_update(CubeUpdate {
            battery: Some(50),
            ..CubeUpdate::new("zzz", ts(1))
        });
        assert!(changed.is_none());
    }

    #[test]
    fn history_is_bounded_and_oldest_first() {
        let registry = registry();
        for i in 0..(HISTORY_CAPACITY as i64 + 10) {
            registry.apply_update(CubeUpdate {
                battery: Some((i % 100) as u8),
                ..CubeUpdate::new("abc", ts(i))
            });
        }
        let history = registry.history(HISTORY_CAPACITY);
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert!(history
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));

        let tail = registry.history(4);
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[3].timestamp, ts(HISTORY_CAPACITY as i64 + 9));
    }

    #[test]
    fn disconnect_keeps_last_known_observables() {
        let registry = registry();
        registry.apply_update(CubeUpdate {
            connected: Some(true),
            battery: Some(90),
            position: Some(PoseUpdate {
                x: Some(10.0),
                y: Some(10.0),
                deg: Some(0.0),
                on_mat: Some(true),
            }),
            ..CubeUpdate::new("abc", ts(1))
        });
        let changed = registry.apply_update(CubeUpdate {
            connected: Some(false),
            ..CubeUpdate::new("abc", ts(2))
        });
        let cube = changed.unwrap();
        assert!(!cube.connected);
        assert_eq!(cube.battery, Some(90));
        assert!(cube.position.is_some());
    }
}
