//! Host-side settings for the bridge binary, stored as JSON.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adapter::AdapterConfig;
use crate::bgb::{DEFAULT_HOST, DEFAULT_PORT};
use crate::board::NetworkTimeouts;
use crate::tunnel::DEFAULT_BAUD_RATE;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub adapter: AdapterConfig,
    /// Backing file for the adapter's configuration region
    pub config_file: PathBuf,
    pub timeouts: NetworkTimeouts,
    pub bgb_host: String,
    pub bgb_port: u16,
    pub baud_rate: u32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            config_file: PathBuf::from("config.bin"),
            timeouts: NetworkTimeouts::default(),
            bgb_host: DEFAULT_HOST.to_string(),
            bgb_port: DEFAULT_PORT,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl BridgeSettings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> SettingsResult<Self> {
        if !path.exists() {
            log::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&text)?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> SettingsResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        log::debug!("Saved settings to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterDevice;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BridgeSettings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, BridgeSettings::default());
        assert_eq!(settings.bgb_port, DEFAULT_PORT);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = BridgeSettings::default();
        settings.adapter.device = AdapterDevice::Red;
        settings.adapter.unmetered = true;
        settings.timeouts.connect_ms = 250;
        settings.save(&path).unwrap();

        assert_eq!(BridgeSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"bgb_port": 9000, "adapter": {"device": "yellow"}}"#).unwrap();

        let settings = BridgeSettings::load(&path).unwrap();
        assert_eq!(settings.bgb_port, 9000);
        assert_eq!(settings.adapter.device, AdapterDevice::Yellow);
        assert_eq!(settings.adapter.p2p_port, crate::adapter::DEFAULT_P2P_PORT);
        assert_eq!(settings.timeouts, NetworkTimeouts::default());
    }

    #[test]
    fn test_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            BridgeSettings::load(&path),
            Err(SettingsError::Json(_))
        ));
    }
}
