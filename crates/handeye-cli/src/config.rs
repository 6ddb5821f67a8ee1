//! Configuration Vault – reads/writes `~/.handeye/config.toml`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use handeye_hal::LinkConfig;
use handeye_kernel::{ReconnectPolicy, WindowPolicy};
use handeye_runtime::{DEFAULT_FRAME_QUEUE, PipelineConfig};
use handeye_types::{
    DEFAULT_CHARACTERISTIC_UUID, DEFAULT_PERIPHERAL_NAME, DEFAULT_SERVICE_UUID, HandEyeError,
    PeripheralTarget, WriteMode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Radio stack the link runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process simulated peripheral.
    #[default]
    Sim,
    /// Host Bluetooth adapter (needs the `ble` build feature).
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Sim => "sim",
            TransportKind::Ble => "ble",
        })
    }
}

impl FromStr for TransportKind {
    type Err = HandEyeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sim" => Ok(TransportKind::Sim),
            "ble" => Ok(TransportKind::Ble),
            other => Err(HandEyeError::Config(format!(
                "unknown transport '{other}' (expected sim or ble)"
            ))),
        }
    }
}

/// Persisted user configuration stored in `~/.handeye/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportKind,

    /// Advertised name to connect to.  Empty scans by service instead.
    #[serde(default = "default_peripheral_name")]
    pub peripheral_name: String,

    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,

    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: String,

    #[serde(default)]
    pub write_mode: WriteMode,

    /// Minimum spacing between two telemetry writes.
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,

    #[serde(default)]
    pub window_policy: WindowPolicy,

    /// Deadline for each connection step.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Consecutive reconnect attempts before waiting for traffic; 0 retries
    /// forever.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Frame rate of the simulated depth sensor.
    #[serde(default = "default_sensor_fps")]
    pub sensor_fps: f64,

    #[serde(default = "default_sensor_width")]
    pub sensor_width: usize,

    #[serde(default = "default_sensor_height")]
    pub sensor_height: usize,
}

fn default_peripheral_name() -> String {
    DEFAULT_PERIPHERAL_NAME.to_string()
}
fn default_service_uuid() -> String {
    DEFAULT_SERVICE_UUID.to_string()
}
fn default_characteristic_uuid() -> String {
    DEFAULT_CHARACTERISTIC_UUID.to_string()
}
fn default_send_interval_ms() -> u64 {
    1000
}
fn default_step_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    8000
}
fn default_reconnect_max_attempts() -> u32 {
    10
}
fn default_sensor_fps() -> f64 {
    30.0
}
fn default_sensor_width() -> usize {
    64
}
fn default_sensor_height() -> usize {
    48
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            peripheral_name: default_peripheral_name(),
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            write_mode: WriteMode::default(),
            send_interval_ms: default_send_interval_ms(),
            window_policy: WindowPolicy::default(),
            step_timeout_ms: default_step_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            sensor_fps: default_sensor_fps(),
            sensor_width: default_sensor_width(),
            sensor_height: default_sensor_height(),
        }
    }
}

impl Config {
    /// The peripheral this config points at.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::Config`] when a UUID does not parse.
    pub fn target(&self) -> Result<PeripheralTarget, HandEyeError> {
        let name = self.peripheral_name.trim();
        Ok(PeripheralTarget {
            service: parse_uuid("service_uuid", &self.service_uuid)?,
            characteristic: parse_uuid("characteristic_uuid", &self.characteristic_uuid)?,
            name: (!name.is_empty()).then(|| name.to_string()),
        })
    }

    /// Translate into the runtime's [`PipelineConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::Config`] for unparsable UUIDs or zero
    /// durations where a positive one is required.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, HandEyeError> {
        if self.step_timeout_ms == 0 {
            return Err(HandEyeError::Config("step_timeout_ms must be positive".to_string()));
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(HandEyeError::Config(format!(
                "reconnect delays must satisfy 0 < initial ({}) <= max ({})",
                self.reconnect_initial_ms, self.reconnect_max_ms
            )));
        }

        let link = LinkConfig {
            target: self.target()?,
            write_mode: self.write_mode,
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(self.reconnect_initial_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms),
                max_attempts: (self.reconnect_max_attempts > 0).then_some(self.reconnect_max_attempts),
            },
            ..LinkConfig::default()
        };
        Ok(PipelineConfig {
            min_send_interval: Duration::from_millis(self.send_interval_ms),
            window_policy: self.window_policy,
            frame_queue: DEFAULT_FRAME_QUEUE,
            link,
        })
    }
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, HandEyeError> {
    Uuid::parse_str(value.trim())
        .map_err(|e| HandEyeError::Config(format!("{field} '{value}' is not a UUID: {e}")))
}

/// Return the path to `~/.handeye/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".handeye").join("config.toml")
}

/// Load the config file.  Returns `None` if it does not exist.
///
/// Environment overrides are not applied here; see [`apply_overrides`].
pub fn load() -> Result<Option<Config>, HandEyeError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, HandEyeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        HandEyeError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| HandEyeError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Environment variables that override the file.
pub const OVERRIDE_VARS: [&str; 6] = [
    "HANDEYE_TRANSPORT",
    "HANDEYE_PERIPHERAL_NAME",
    "HANDEYE_SERVICE_UUID",
    "HANDEYE_CHARACTERISTIC_UUID",
    "HANDEYE_SEND_INTERVAL_MS",
    "HANDEYE_WRITE_MODE",
];

/// Apply `HANDEYE_*` overrides looked up through `var`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HANDEYE_TRANSPORT` | `transport` (`sim` / `ble`) |
/// | `HANDEYE_PERIPHERAL_NAME` | `peripheral_name` |
/// | `HANDEYE_SERVICE_UUID` | `service_uuid` |
/// | `HANDEYE_CHARACTERISTIC_UUID` | `characteristic_uuid` |
/// | `HANDEYE_SEND_INTERVAL_MS` | `send_interval_ms` |
/// | `HANDEYE_WRITE_MODE` | `write_mode` (`with_response` / `without_response`) |
///
/// An override that does not parse leaves its field untouched and is
/// returned as a [`HandEyeError::Config`]; the remaining overrides still
/// apply.
pub fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) -> Vec<HandEyeError> {
    let mut skipped = Vec::new();
    if let Some(v) = var("HANDEYE_TRANSPORT") {
        match v.parse() {
            Ok(kind) => cfg.transport = kind,
            Err(e) => skipped.push(e),
        }
    }
    if let Some(v) = var("HANDEYE_PERIPHERAL_NAME") {
        cfg.peripheral_name = v;
    }
    if let Some(v) = var("HANDEYE_SERVICE_UUID") {
        cfg.service_uuid = v;
    }
    if let Some(v) = var("HANDEYE_CHARACTERISTIC_UUID") {
        cfg.characteristic_uuid = v;
    }
    if let Some(v) = var("HANDEYE_SEND_INTERVAL_MS") {
        match v.trim().parse() {
            Ok(ms) => cfg.send_interval_ms = ms,
            Err(_) => skipped.push(HandEyeError::Config(format!(
                "HANDEYE_SEND_INTERVAL_MS '{v}' is not a number"
            ))),
        }
    }
    if let Some(v) = var("HANDEYE_WRITE_MODE") {
        match v.trim().parse() {
            Ok(mode) => cfg.write_mode = mode,
            Err(e) => skipped.push(e),
        }
    }
    skipped
}

/// Save the config to disk, creating `~/.handeye/` if necessary.
pub fn save(cfg: &Config) -> Result<(), HandEyeError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), HandEyeError> {
    let io_err = |what: &str, e: std::io::Error| HandEyeError::Config(format!("{what}: {e}"));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("failed to create config directory", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err("failed to set config directory permissions", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| HandEyeError::Config(format!("failed to serialize config: {e}")))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| io_err(&format!("failed to write config at {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| io_err(&format!("failed to write config at {}", path.display()), e))?;
    Ok(())
}
