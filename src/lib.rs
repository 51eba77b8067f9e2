//! Swarm control server for toio cube fleets.
//!
//! Multiplexes up to five upstream relay WebSocket connections (each
//! fronting a handful of cubes over BLE) and exposes a downstream UI
//! WebSocket protocol to browser operators. The library is split along the
//! component seams of the server:
//!
//! - [`relay::connection`] — one resilient WebSocket client per relay
//! - [`relay::manager`] — command routing and telemetry ingestion
//! - [`registry`] — the authoritative in-memory cube state store
//! - [`fleet`] — goal assignment and fleet snapshots
//! - [`gateway`] — the UI-facing WebSocket server
//!
//! The binary in `main.rs` wires these together; integration tests drive
//! the same components through this library surface.

pub mod config;
pub mod error;
pub mod fleet;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod relay;

use chrono::Utc;

/// Milliseconds since the Unix epoch, the timestamp unit of every UI
/// envelope and goal record.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
