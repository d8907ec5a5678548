//! Daemon Settings
//!
//! Serde-backed configuration for bus names, adapter selection, advertising
//! parameters and logging. Everything has a default so the daemon runs with
//! no settings file at all.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            rotation: default_rotation(),
            ansi_colors: default_true(),
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
    "bluetooth-services".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Well-known name this process owns on the system bus.
    #[serde(default = "default_application_bus_name")]
    pub application_bus_name: String,
    /// Well-known name of the Bluetooth daemon to watch.
    #[serde(default = "default_daemon_bus_name")]
    pub daemon_bus_name: String,
    /// Root path under which the GATT object tree is published.
    #[serde(default = "default_object_root")]
    pub object_root: String,
    /// Adapter to use, e.g. "hci0". `None` selects the first adapter found.
    #[serde(default)]
    pub adapter: Option<String>,

    // Advertisement
    #[serde(default = "default_local_name")]
    pub local_name: String,
    #[serde(default = "default_appearance")]
    pub appearance: u16,
    /// Advertising timeout in seconds; 0 means never time out.
    #[serde(default)]
    pub advertising_timeout: u16,

    // Battery service
    #[serde(default = "default_battery_poll_secs")]
    pub battery_poll_secs: u64,

    // Modem identity service. When unset the characteristics report "unknown".
    #[serde(default)]
    pub modem_serial: Option<String>,
    #[serde(default)]
    pub modem_imei: Option<String>,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application_bus_name: default_application_bus_name(),
            daemon_bus_name: default_daemon_bus_name(),
            object_root: default_object_root(),
            adapter: None,
            local_name: default_local_name(),
            appearance: default_appearance(),
            advertising_timeout: 0,
            battery_poll_secs: default_battery_poll_secs(),
            modem_serial: None,
            modem_imei: None,
            log_settings: LogSettings::default(),
        }
    }
}

fn default_application_bus_name() -> String {
    "io.mangoh".to_string()
}
fn default_daemon_bus_name() -> String {
    "org.bluez".to_string()
}
fn default_object_root() -> String {
    "/io/mangoh".to_string()
}
fn default_local_name() -> String {
    "mangOH".to_string()
}
fn default_appearance() -> u16 {
    // GAP appearance "Generic Computer"
    128
}
fn default_battery_poll_secs() -> u64 {
    30
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from `override_path` when given, otherwise from the
    /// platform config directory. A missing or unreadable file falls back to
    /// defaults; a present but malformed file is an error.
    pub fn new(override_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let settings_path = match override_path {
            Some(path) => path,
            None => Self::default_settings_path()?,
        };
        let settings = if settings_path.exists() {
            Self::load_from_file(&settings_path)?
        } else {
            Settings::default()
        };

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn default_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("bluetooth-services");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &PathBuf {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_field() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.application_bus_name, "io.mangoh");
        assert_eq!(settings.daemon_bus_name, "org.bluez");
        assert_eq!(settings.object_root, "/io/mangoh");
        assert_eq!(settings.adapter, None);
        assert_eq!(settings.advertising_timeout, 0);
        assert_eq!(settings.battery_poll_secs, 30);
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let settings: Settings =
            serde_json::from_str(r#"{"adapter": "hci1", "local_name": "bench-rig"}"#).unwrap();
        assert_eq!(settings.adapter.as_deref(), Some("hci1"));
        assert_eq!(settings.local_name, "bench-rig");
        assert_eq!(settings.appearance, 128);
    }
}
