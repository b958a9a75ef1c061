//! Configuration management.
//!
//! The configuration names the identity service endpoints, the lifecycle
//! timings and where credentials are persisted. It is stored at
//! `~/.config/tokenwarden/config.json`; a missing file yields defaults.
//!
//! `TOKENWARDEN_BASE_URL` overrides the configured base URL and
//! `TOKENWARDEN_PASSPHRASE` supplies the key for an encrypted credential file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::grant::MAX_EXPIRES_IN_SECS;
use crate::auth::manager::{DEFAULT_MONITOR_INTERVAL_SECS, DEFAULT_RENEWAL_LEAD_SECS};
use crate::auth::LifecycleSettings;
use crate::APP_NAME;

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const BASE_URL_ENV: &str = "TOKENWARDEN_BASE_URL";
pub const PASSPHRASE_ENV: &str = "TOKENWARDEN_PASSPHRASE";

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Longest monitor interval accepted (one day)
const MAX_MONITOR_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Where the identity service lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityEndpoints {
    pub base_url: String,
    pub login_path: String,
    pub register_path: String,
    pub refresh_path: String,
}

impl Default for IdentityEndpoints {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: "/auth/login".to_string(),
            register_path: "/auth/register".to_string(),
            refresh_path: "/auth/refresh".to_string(),
        }
    }
}

/// Credential persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Kept in memory only; sessions do not survive a restart
    Memory,
    File {
        /// Defaults to the platform data directory
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        encrypted: bool,
    },
    Keyring {
        #[serde(default = "default_keyring_service")]
        service: String,
    },
}

fn default_keyring_service() -> String {
    APP_NAME.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File {
            path: None,
            encrypted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(flatten)]
    pub endpoints: IdentityEndpoints,
    pub monitor_interval_secs: u64,
    pub renewal_lead_secs: i64,
    pub request_timeout_secs: u64,
    pub storage: StorageConfig,
    /// Write logs here instead of stderr
    pub log_dir: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            endpoints: IdentityEndpoints::default(),
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            renewal_lead_secs: DEFAULT_RENEWAL_LEAD_SECS,
            request_timeout_secs: crate::api::transport::REQUEST_TIMEOUT_SECS,
            storage: StorageConfig::default(),
            log_dir: None,
        }
    }
}

impl AuthConfig {
    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Self = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config
                .validate()
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn apply_env(&mut self) {
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.trim().is_empty() {
                self.endpoints.base_url = base_url;
            }
        }
    }

    /// Passphrase for an encrypted credential file, if one is set
    pub fn passphrase_from_env() -> Option<String> {
        std::env::var(PASSPHRASE_ENV).ok().filter(|p| !p.is_empty())
    }

    /// Reject timings the lifecycle cannot represent
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0..=MAX_EXPIRES_IN_SECS).contains(&self.renewal_lead_secs),
            "renewal_lead_secs must be between 0 and {}",
            MAX_EXPIRES_IN_SECS
        );
        ensure!(
            (1..=MAX_MONITOR_INTERVAL_SECS).contains(&self.monitor_interval_secs),
            "monitor_interval_secs must be between 1 and {}",
            MAX_MONITOR_INTERVAL_SECS
        );
        Ok(())
    }

    /// Out-of-range timings are clamped into range
    pub fn settings(&self) -> LifecycleSettings {
        let interval = self.monitor_interval_secs.clamp(1, MAX_MONITOR_INTERVAL_SECS);
        let lead = self.renewal_lead_secs.clamp(0, MAX_EXPIRES_IN_SECS);
        LifecycleSettings {
            monitor_interval: Duration::from_secs(interval),
            lead_time: chrono::Duration::seconds(lead),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
