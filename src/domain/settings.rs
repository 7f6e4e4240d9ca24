use crate::domain::models::DeviceId;
use crate::domain::stimulation::SafetyBounds;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "roboroach".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// GATT identifiers of the stimulation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub command_char_uuid: String,
    #[serde(default = "default_status_uuid")]
    pub status_char_uuid: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Accept any advertiser instead of only stimulation devices.
    #[serde(default = "default_false")]
    pub debug_show_all_devices: bool,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            command_char_uuid: default_command_uuid(),
            status_char_uuid: default_status_uuid(),
            name_prefix: default_name_prefix(),
            debug_show_all_devices: false,
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_command_uuid() -> String {
    protocol::COMMAND_CHAR_UUID.to_string()
}
fn default_status_uuid() -> String {
    protocol::STATUS_CHAR_UUID.to_string()
}
fn default_name_prefix() -> String {
    protocol::DEVICE_NAME_PREFIX.to_string()
}

/// Session timers, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_ms: u64,
    /// Covers both Connecting and DiscoveringServices.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            scan_ms: default_scan_timeout_ms(),
            connect_ms: default_connect_timeout_ms(),
            operation_ms: default_operation_timeout_ms(),
            disconnect_ms: default_disconnect_timeout_ms(),
        }
    }
}

fn default_scan_timeout_ms() -> u64 {
    4_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_operation_timeout_ms() -> u64 {
    2_000
}
fn default_disconnect_timeout_ms() -> u64 {
    2_000
}

/// Drag-to-steer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GestureSettings {
    #[serde(default = "default_dead_zone_px")]
    pub dead_zone_px: f64,
    #[serde(default = "default_retrigger_interval_ms")]
    pub retrigger_interval_ms: u64,
    #[serde(default = "default_full_scale_px")]
    pub full_scale_px: f64,
    #[serde(default = "default_min_duration_ms")]
    pub min_duration_ms: u16,
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u16,
}

impl GestureSettings {
    pub fn retrigger_interval(&self) -> Duration {
        Duration::from_millis(self.retrigger_interval_ms)
    }
}

impl Default for GestureSettings {
    fn default() -> Self {
        Self {
            dead_zone_px: default_dead_zone_px(),
            retrigger_interval_ms: default_retrigger_interval_ms(),
            full_scale_px: default_full_scale_px(),
            min_duration_ms: default_min_duration_ms(),
            max_duration_ms: default_max_duration_ms(),
        }
    }
}

fn default_dead_zone_px() -> f64 {
    60.0
}
fn default_retrigger_interval_ms() -> u64 {
    400
}
fn default_full_scale_px() -> f64 {
    300.0
}
fn default_min_duration_ms() -> u16 {
    100
}
fn default_max_duration_ms() -> u16 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    // Stimulation Settings
    #[serde(default)]
    pub safety_bounds: SafetyBounds,
    #[serde(default)]
    pub gesture: GestureSettings,

    // Session Settings
    #[serde(default = "default_max_queued_operations")]
    pub max_queued_operations: usize,
    #[serde(default = "default_malformed_frame_limit")]
    pub malformed_frame_limit: u32,

    // Pairing Settings
    #[serde(default)]
    pub last_connected_device: Option<DeviceId>,
    #[serde(default)]
    pub known_devices: Vec<DeviceId>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble: BleSettings::default(),
            timeouts: TimeoutSettings::default(),
            safety_bounds: SafetyBounds::default(),
            gesture: GestureSettings::default(),
            max_queued_operations: default_max_queued_operations(),
            malformed_frame_limit: default_malformed_frame_limit(),
            last_connected_device: None,
            known_devices: Vec::new(),
        }
    }
}

fn default_max_queued_operations() -> usize {
    1
}
fn default_malformed_frame_limit() -> u32 {
    3
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::at_path(settings_path))
    }

    /// Use an explicit settings file. Missing or unreadable files fall back
    /// to defaults.
    pub fn at_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RoboRoach");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Record a device the session reached `Ready` with.
    pub fn remember_device(&mut self, id: &DeviceId) -> anyhow::Result<()> {
        let is_new = !self.settings.known_devices.contains(id);
        let is_last = self.settings.last_connected_device.as_ref() == Some(id);
        if is_new {
            self.settings.known_devices.push(id.clone());
        }
        if is_new || !is_last {
            self.settings.last_connected_device = Some(id.clone());
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("roboroach-settings-{}-{}", name, std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "max_queued_operations": 8 }"#).unwrap();
        assert_eq!(settings.max_queued_operations, 8);
        assert_eq!(settings.malformed_frame_limit, 3);
        assert_eq!(settings.timeouts.scan_ms, 4_000);
        assert_eq!(settings.ble.service_uuid, protocol::SERVICE_UUID);
        assert_eq!(settings.safety_bounds, SafetyBounds::default());
        assert_eq!(settings.gesture.dead_zone_px, 60.0);
    }

    #[test]
    fn test_partial_nested_section() {
        let settings: Settings = serde_json::from_str(
            r#"{ "safety_bounds": { "frequency_hz": { "min": 5, "max": 100 } } }"#,
        )
        .unwrap();
        assert_eq!(settings.safety_bounds.frequency_hz.max, 100);
        assert_eq!(settings.safety_bounds.duration_ms.max, 1_000);
    }

    #[test]
    fn test_remember_device_persists() {
        let path = temp_path("remember");
        let mut service = SettingsService::at_path(path.clone());
        let id = DeviceId::new("sim-0001");

        service.remember_device(&id).unwrap();
        service.remember_device(&id).unwrap();
        assert_eq!(service.get().known_devices, vec![id.clone()]);

        let reloaded = SettingsService::load_from_file(&path).unwrap();
        assert_eq!(reloaded.last_connected_device, Some(id));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_unreadable_file_uses_defaults() {
        let path = temp_path("garbage");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();

        let service = SettingsService::at_path(path.clone());
        assert_eq!(service.get().max_queued_operations, 1);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
