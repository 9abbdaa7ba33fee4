//! CLI configuration management

use anyhow::{Context, Result, anyhow};
use common::logging::{LOG_LEVELS, is_valid_level};
use common::parse_hex_u16;
use hidusb::SessionSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Defaults for commands that select a device
    #[serde(default)]
    pub device: DeviceSettings,
    /// Input queue depth and transfer timeouts
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Default device selection, IDs as hex strings (e.g. "0x046d")
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

impl DeviceSettings {
    pub fn vendor_id(&self) -> Result<Option<u16>> {
        parse_optional_id(self.vendor_id.as_deref(), "vendor_id")
    }

    pub fn product_id(&self) -> Result<Option<u16>> {
        parse_optional_id(self.product_id.as_deref(), "product_id")
    }
}

fn parse_optional_id(value: Option<&str>, name: &str) -> Result<Option<u16>> {
    value
        .map(|v| parse_hex_u16(v).with_context(|| format!("Invalid device.{} '{}'", name, v)))
        .transpose()
}

impl CliConfig {
    /// Load configuration from file
    ///
    /// Without an explicit path the user config directory is tried first,
    /// then `/etc/hidusb/config.toml`.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = [Self::default_path(), PathBuf::from("/etc/hidusb/config.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CliConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load from the standard locations, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hidusb").join("config.toml")
        } else {
            PathBuf::from(".config/hidusb/config.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        if !is_valid_level(&self.logging.level) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        self.device.vendor_id()?;
        self.device.product_id()?;

        self.session
            .validate()
            .map_err(|_| anyhow!("Invalid session.max_queued_reports, must be at least 1"))?;

        Ok(())
    }
}

/// Load a config from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<CliConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    CliConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.session.max_queued_reports, 30);
        assert!(config.device.vendor_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CliConfig::default();
        config.logging.level = "debug".to_string();
        config.device.vendor_id = Some("0x046d".to_string());
        config.session.output_timeout_ms = 250;
        config.save(&path).unwrap();

        let loaded = CliConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.device.vendor_id().unwrap(), Some(0x046d));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[device]\nproduct_id = \"c52b\"\n").unwrap();

        let config = CliConfig::load(Some(path)).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.device.product_id().unwrap(), Some(0xc52b));
        assert_eq!(config.session, SessionSettings::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();

        let path = dir.path().join("level.toml");
        fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();
        assert!(CliConfig::load(Some(path)).is_err());

        let path = dir.path().join("vid.toml");
        fs::write(&path, "[device]\nvendor_id = \"0xZZZZ\"\n").unwrap();
        assert!(CliConfig::load(Some(path)).is_err());

        let path = dir.path().join("queue.toml");
        fs::write(&path, "[session]\nmax_queued_reports = 0\n").unwrap();
        assert!(CliConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        assert!(CliConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}
