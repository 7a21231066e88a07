use crate::error::{EngineError, Result};
use crate::netif::InterfaceFilters;
use crate::protocol::{DEFAULT_PORT, validate_port};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Process-wide engine settings. Replaced wholesale on save, never patched
/// field-by-field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Device name shown to peers
    pub device_name: String,
    /// Port for the transfer server
    pub port: u16,
    /// Where received files land
    pub download_dir: PathBuf,
    /// Refuse outbound sends
    pub receive_only: bool,
    pub notifications_enabled: bool,
    /// "dark", "light" or "system"
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Outbound throughput cap in bytes per second; None means unlimited
    #[serde(default)]
    pub bandwidth_limit_bps: Option<u64>,
    #[serde(default)]
    pub interface_filters: InterfaceFilters,
    /// Source IPs whose inbound offers are accepted without asking
    #[serde(default)]
    pub trusted_hosts: Vec<String>,
}

fn default_theme() -> String {
    "system".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        let download_dir = directories::UserDirs::new()
            .and_then(|d| d.download_dir().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            device_name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "Beamdrop Device".to_string()),
            port: DEFAULT_PORT,
            download_dir,
            receive_only: false,
            notifications_enabled: true,
            theme: default_theme(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            bandwidth_limit_bps: None,
            interface_filters: InterfaceFilters::default(),
            trusted_hosts: Vec::new(),
        }
    }
}

impl Settings {
    /// Reject malformed settings before they replace the active record
    pub fn validate(&self) -> Result<()> {
        validate_port(self.port)?;

        if self.device_name.trim().is_empty() {
            return Err(EngineError::config("Device name cannot be empty"));
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(EngineError::config("Download directory cannot be empty"));
        }
        if !matches!(self.theme.as_str(), "dark" | "light" | "system") {
            return Err(EngineError::config(format!(
                "Unknown theme: {}",
                self.theme
            )));
        }
        if self.bandwidth_limit_bps == Some(0) {
            return Err(EngineError::config(
                "Bandwidth limit must be positive; omit it for unlimited",
            ));
        }
        Ok(())
    }
}

/// In-memory settings cache persisted to a JSON file on change
pub struct SettingsStore {
    settings: RwLock<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    /// Open (or initialize) the store under `config_dir`
    pub fn open(config_dir: &Path) -> Result<Self> {
        fs::create_dir_all(config_dir)?;
        let file_path = config_dir.join("settings.json");

        let settings = if file_path.exists() {
            let content = fs::read_to_string(&file_path)?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse settings, using defaults: {}", e);
                Settings::default()
            })
        } else {
            Settings::default()
        };

        let store = Self {
            settings: RwLock::new(settings),
            file_path,
        };

        if !store.file_path.exists() {
            store.persist()?;
        }

        Ok(store)
    }

    fn persist(&self) -> Result<()> {
        let content = {
            let settings = self.settings.read();
            serde_json::to_string_pretty(&*settings)?
        };
        fs::write(&self.file_path, content)?;
        Ok(())
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Validate, replace wholesale, and persist
    pub fn update(&self, new_settings: Settings) -> Result<()> {
        new_settings.validate()?;
        {
            let mut settings = self.settings.write();
            *settings = new_settings;
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retry_delay_ms, 1000);
        assert!(settings.bandwidth_limit_bps.is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();

        settings.port = 0;
        assert!(settings.validate().is_err());
        settings.port = DEFAULT_PORT;

        settings.device_name = "  ".to_string();
        assert!(settings.validate().is_err());
        settings.device_name = "laptop".to_string();

        settings.theme = "solarized".to_string();
        assert!(settings.validate().is_err());
        settings.theme = "dark".to_string();

        settings.bandwidth_limit_bps = Some(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).unwrap();

        let mut settings = store.get();
        settings.device_name = "workstation".to_string();
        settings.port = 9000;
        store.update(settings.clone()).unwrap();

        // Fresh store reads back the persisted record
        let reopened = SettingsStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(), settings);
    }

    #[test]
    fn test_invalid_update_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).unwrap();
        let before = store.get();

        let mut bad = before.clone();
        bad.port = 0;
        assert!(store.update(bad).is_err());
        assert_eq!(store.get(), before);
    }
}
