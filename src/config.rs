//! Persisted application settings.

use crate::error::Result;
use crate::fade::FadeSettings;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "cueflow_config.json";
/// Upper bound for the loop timings, in seconds.
pub const MAX_LOOP_SECS: f32 = 600.0;
const APP_DIR: &str = "cueflow";

/// Default directory for the config file: `<config dir>/cueflow`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Folder the message files are played from.
    pub messages_dir: PathBuf,
    /// Queue snapshot; the session marker sits next to it.
    pub queue_file: PathBuf,
    /// Looped background program, if any.
    pub background_file: Option<PathBuf>,
    pub fade: FadeSettings,
    pub tick_secs: f32,
    pub error_cooldown_secs: f32,
    pub shutdown_timeout_secs: f32,
}

impl Default for Settings {
    fn default() -> Self {
        let data = default_data_dir();
        Settings {
            messages_dir: data.join("messages"),
            queue_file: data.join("queue_state.json"),
            background_file: None,
            fade: FadeSettings::default(),
            tick_secs: 1.0,
            error_cooldown_secs: 5.0,
            shutdown_timeout_secs: 2.0,
        }
    }
}

impl Settings {
    pub fn path_in(config_dir: &Path) -> PathBuf {
        config_dir.join(CONFIG_FILE)
    }

    /// Load settings from `config_dir`, or defaults if the file is missing
    /// or unreadable.
    pub fn load(config_dir: &Path) -> Self {
        let path = Self::path_in(config_dir);
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(data) => match serde_json::from_str(&data) {
                    Ok(settings) => return Settings::sanitized(settings),
                    Err(e) => warn!("Corrupt config file, using defaults: {}", e),
                },
                Err(e) => warn!("Could not read config file: {}", e),
            }
        }
        Settings::default()
    }

    /// Keep hand-edited timings usable: loop waits within 0-600 s, fade
    /// values per `FadeSettings::sanitized`.
    pub fn sanitized(self) -> Self {
        let bounded = |value: f32, default: f32| {
            if value.is_finite() { value.clamp(0.0, MAX_LOOP_SECS) } else { default }
        };
        let defaults = Settings::default();
        Settings {
            tick_secs: bounded(self.tick_secs, defaults.tick_secs),
            error_cooldown_secs: bounded(self.error_cooldown_secs, defaults.error_cooldown_secs),
            shutdown_timeout_secs: bounded(self.shutdown_timeout_secs, defaults.shutdown_timeout_secs),
            fade: self.fade.sanitized(),
            ..self
        }
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        fs::create_dir_all(config_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(Self::path_in(config_dir), json)?;
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        secs(self.tick_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        secs(self.error_cooldown_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout_secs)
    }
}

fn secs(value: f32) -> Duration {
    if !value.is_finite() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f32(value.min(MAX_LOOP_SECS)).unwrap_or(Duration::ZERO)
}
