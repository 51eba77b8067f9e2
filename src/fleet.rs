//! Goal assignment and fleet-level snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::registry::CubeRegistry;

/// Bound on the goal history ring kept when `keep_history` is requested.
pub const GOAL_HISTORY_CAPACITY: usize = 64;

/// Nominal control tick rate reported to the UI.
const DEFAULT_TICK_HZ: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoalPose {
    pub x: f64,
    pub y: f64,
    pub angle: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct GoalRequest {
    pub targets: Vec<String>,
    pub pose: GoalPose,
    pub priority: i32,
    pub keep_history: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GoalAssignment {
    pub goal_id: String,
    pub cube_id: String,
    pub pose: GoalPose,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FleetState {
    pub tick_hz: f64,
    pub tasks_in_queue: usize,
    pub warnings: Vec<String>,
    pub active_goals: Vec<GoalAssignment>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GoalError {
    #[error("goal request targets must not be empty")]
    NoTargets,
}

pub struct FleetOrchestrator {
    registry: Arc<CubeRegistry>,
    goal_counter: AtomicU64,
    inner: Mutex<FleetInner>,
}

struct FleetInner {
    active: HashMap<String, GoalAssignment>,
    history: VecDeque<GoalAssignment>,
}

impl FleetOrchestrator {
    pub fn new(registry: Arc<CubeRegistry>) -> Self {
        Self {
            registry,
            goal_counter: AtomicU64::new(0),
            inner: Mutex::new(FleetInner {
                active: HashMap::new(),
                history: VecDeque::with_capacity(GOAL_HISTORY_CAPACITY),
            }),
        }
    }

    /// Mint a goal id and bind it to the first target. Only the first
    /// target receives the goal; additional targets are ignored and logged.
    /// The counter does not advance on rejection.
    pub fn assign_goal(&self, request: GoalRequest) -> Result<String, GoalError> {
        if request.targets.is_empty() {
            return Err(GoalError::NoTargets);
        }
        if request.targets.len() > 1 {
            warn!(
                target: "control_server::fleet",
                dropped = ?&request.targets[1..],
                "multi-cube goals are not supported, assigning to first target only"
            );
        }

        let counter = self.goal_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let goal_id = format!("goal-{counter}");
        let assignment = GoalAssignment {
            goal_id: goal_id.clone(),
            cube_id: request.targets[0].clone(),
            pose: request.pose,
            priority: request.priority,
            created_at: Utc::now(),
        };

        {
            let mut inner = self.inner.lock();
            inner
                .active
                .insert(assignment.cube_id.clone(), assignment.clone());
            if request.keep_history {
                if inner.history.len() >= GOAL_HISTORY_CAPACITY {
                    inner.history.pop_front();
                }
                inner.history.push_back(assignment.clone());
            }
        }

        info!(
            target: "control_server::fleet",
            goal_id = %goal_id,
            cube_id = %assignment.cube_id,
            "assigned goal"
        );
        Ok(goal_id)
    }

    /// Drop the active goal for a cube, if any.
    pub fn clear_goal(&self, cube_id: &str) {
        self.inner.lock().active.remove(cube_id);
    }

    pub fn active_goal(&self, cube_id: &str) -> Option<GoalAssignment> {
        self.inner.lock().active.get(cube_id).cloned()
    }

    pub fn history(&self) -> Vec<GoalAssignment> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Current fleet state. Warnings name every cube with no known
    /// position.
    pub fn snapshot(&self) -> FleetState {
        let active_goals = {
            let inner = self.inner.lock();
            let mut goals: Vec<GoalAssignment> = inner.active.values().cloned().collect();
            goals.sort_by(|a, b| a.cube_id.cmp(&b.cube_id));
            goals
        };

        let warnings = self
            .registry
            .snapshot()
            .iter()
            .filter(|cube| cube.position.is_none())
            .map(|cube| format!("Cube {} position unknown", cube.cube_id))
            .collect();

        FleetState {
            tick_hz: DEFAULT_TICK_HZ,
            tasks_in_queue: active_goals.len(),
            warnings,
            active_goals,
        }
    }
}
