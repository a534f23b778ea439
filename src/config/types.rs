use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::priority::PreferenceRecord;

/// UID of the virtual device shipped with the driver
pub const DEFAULT_VIRTUAL_DEVICE_UID: &str = "AudioOutputCoordinatorDevice_UID";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub virtual_device: VirtualDeviceConfig,

    /// The persisted Preference Record
    #[serde(default)]
    pub preferences: PreferenceRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_true")]
    pub file_output: bool,

    #[serde(default)]
    pub json_format: bool,

    /// Defaults to ~/.local/share/audio-output-coordinator/logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_keep_days")]
    pub keep_days: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualDeviceConfig {
    #[serde(default = "default_virtual_device_uid")]
    pub uid: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keep_days() -> u64 {
    7
}

fn default_virtual_device_uid() -> String {
    DEFAULT_VIRTUAL_DEVICE_UID.to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            file_output: true,
            json_format: false,
            log_dir: None,
            keep_days: default_keep_days(),
        }
    }
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            uid: default_virtual_device_uid(),
        }
    }
}

impl Config {
    /// Problems that would stop the service from starting, one message each
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.general.log_level.parse::<tracing::Level>().is_err() {
            problems.push(format!("Unknown log level '{}'", self.general.log_level));
        }
        if self.virtual_device.uid.trim().is_empty() {
            problems.push("Virtual device UID is empty".to_string());
        }
        if self
            .preferences
            .preferred_output_uid
            .as_deref()
            .is_some_and(|uid| uid.trim().is_empty())
        {
            problems.push("Preferred output UID is empty".to_string());
        }
        if self.logging.keep_days == 0 {
            problems.push("Log retention must be at least one day".to_string());
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.preferences.most_recent_wins);
        assert_eq!(config.virtual_device.uid, DEFAULT_VIRTUAL_DEVICE_UID);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
[general]
log_level = "debug"

[preferences]
preferred_output_uid = "AppleUSBAudioEngine:Dock"
"#,
        )
        .unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(
            config.preferences.preferred_output_uid.as_deref(),
            Some("AppleUSBAudioEngine:Dock")
        );
        assert!(config.preferences.most_recent_wins);
        assert_eq!(config.logging.keep_days, 7);
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = Config::default();
        assert!(config.validate().is_empty());

        config.general.log_level = "loud".to_string();
        config.virtual_device.uid = " ".to_string();
        config.logging.keep_days = 0;
        assert_eq!(config.validate().len(), 3);
    }
}
