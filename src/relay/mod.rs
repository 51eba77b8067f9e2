//! Upstream relay plumbing: one WebSocket client per relay plus the
//! manager that routes commands and ingests telemetry.

pub mod connection;
pub mod manager;
