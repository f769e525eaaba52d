//! Configuration management.
//!
//! `Config` is the persisted application configuration (remote base URL,
//! optional store directory override and sync tuning). It lives at
//! `~/.config/assistsync/config.json`; a missing file means defaults.
//!
//! `SyncConfig` carries the sync engine's tunables. Every field has a
//! default, and durations are written as (fractional) seconds.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "assistsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment overrides
pub const BASE_URL_ENV: &str = "ASSISTSYNC_BASE_URL";
pub const TOKEN_ENV: &str = "ASSISTSYNC_TOKEN";

const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// First retry delay; doubles after every failed push
    #[serde(serialize_with = "duration_secs::serialize", deserialize_with = "duration_secs::nonzero")]
    pub retry_base: Duration,
    /// Upper bound for a single retry delay
    #[serde(with = "duration_secs")]
    pub retry_cap: Duration,
    /// Retries after the initial push before a mutation is given up
    pub max_attempts: u32,
    /// Fraction (0.0-1.0) by which a retry delay may be randomly shortened
    pub retry_jitter: f64,
    /// Cached entities older than this are refreshed before being served
    #[serde(with = "duration_secs")]
    pub staleness_threshold: Duration,
    #[serde(serialize_with = "duration_secs::serialize", deserialize_with = "duration_secs::nonzero")]
    pub sweep_interval: Duration,
    /// How long `fetch` waits for the server before falling back
    #[serde(with = "duration_secs")]
    pub fetch_timeout: Duration,
    /// How long shutdown waits for in-flight reconciliations
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(5 * 60),
            max_attempts: 8,
            retry_jitter: 0.2,
            staleness_threshold: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            fetch_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub base_url: Option<String>,
    pub store_dir: Option<PathBuf>,
    pub sync: SyncConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Environment first, then the config file, then the local default.
    pub fn base_url(&self) -> String {
        std::env::var(BASE_URL_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Directory holding the durable cache records.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.store_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }

    pub fn nonzero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = deserialize(deserializer)?;
        if value.is_zero() {
            return Err(serde::de::Error::custom("duration must be greater than zero"));
        }
        Ok(value)
    }
}
