//! Typed configuration schema and startup validation.
//!
//! The config file is JSON (see `config/control_server.example.json`).
//! Everything is validated up front; any violation aborts startup with a
//! message naming the file and the offending field.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::relay::connection::RelayUri;

/// Default config path when no positional argument is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/control_server.json";
/// Fallback when the default path does not exist either.
pub const EXAMPLE_CONFIG_PATH: &str = "config/control_server.example.json";

const DEFAULT_RECONNECT_MS: u32 = 2000;

#[derive(Debug, Parser)]
#[command(name = "control-server")]
#[command(about = "Swarm control server bridging toio relays to UI operators")]
pub struct Cli {
    /// Path to the JSON config file
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlServerConfig {
    pub ui: UiConfig,
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub field: FieldConfig,
    #[serde(default = "default_reconnect_ms")]
    pub relay_reconnect_ms: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_ui_host")]
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub id: String,
    pub uri: String,
    pub cubes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldPoint {
    pub x: f64,
    pub y: f64,
}

/// Playable area in millimetres. Defaults to the standard toio mat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub top_left: FieldPoint,
    pub bottom_right: FieldPoint,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            top_left: FieldPoint { x: 45.0, y: 45.0 },
            bottom_right: FieldPoint { x: 455.0, y: 455.0 },
        }
    }
}

fn default_ui_host() -> String {
    "0.0.0.0".to_string()
}

fn default_reconnect_ms() -> u32 {
    DEFAULT_RECONNECT_MS
}

/// Resolve the effective config path: explicit argument wins, then the
/// default path, then the shipped example.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    resolve_config_path_in(Path::new("."), explicit)
}

fn resolve_config_path_in(root: &Path, explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let default = root.join(DEFAULT_CONFIG_PATH);
    if default.exists() {
        default
    } else {
        root.join(EXAMPLE_CONFIG_PATH)
    }
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<ControlServerConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ControlServerConfig =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    validate(&config, path)?;
    Ok(config)
}

fn validate(config: &ControlServerConfig, path: &Path) -> Result<(), ConfigError> {
    if config.ui.port == 0 {
        return Err(ConfigError::invalid(path, "ui.port must be > 0"));
    }
    if config.relays.is_empty() {
        return Err(ConfigError::invalid(path, "relays must be a non-empty array"));
    }

    let mut relay_ids = HashSet::new();
    let mut cube_ids = HashSet::new();

    for relay in &config.relays {
        if relay.id.is_empty() {
            return Err(ConfigError::invalid(path, "relay entry missing id"));
        }
        if !relay_ids.insert(relay.id.as_str()) {
            return Err(ConfigError::invalid(
                path,
                format!("duplicate relay id {}", relay.id),
            ));
        }
        if relay.uri.is_empty() {
            return Err(ConfigError::invalid(
                path,
                format!("relay {} missing uri", relay.id),
            ));
        }
        if let Err(err) = RelayUri::parse(&relay.uri) {
            return Err(ConfigError::invalid(
                path,
                format!("relay {} has an invalid uri: {err}", relay.id),
            ));
        }
        if relay.cubes.is_empty() {
            return Err(ConfigError::invalid(
                path,
                format!("relay {} must define at least one cube", relay.id),
            ));
        }
        for cube in &relay.cubes {
            if cube.len() != 3 || !cube.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::invalid(
                    path,
                    format!("cube id {cube} must be 3 alphanumeric characters"),
                ));
            }
            if !cube_ids.insert(cube.as_str()) {
                return Err(ConfigError::invalid(
                    path,
                    format!("cube id {cube} assigned to multiple relays"),
                ));
            }
        }
    }

    if config.field.bottom_right.x <= config.field.top_left.x
        || config.field.bottom_right.y <= config.field.top_left.y
    {
        return Err(ConfigError::invalid(
            path,
            "field.bottom_right must be greater than top_left",
        ));
    }

    Ok(())
}
