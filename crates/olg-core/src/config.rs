//! Configuration resolution for the federation service.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/olg-federation/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`OLG_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete federation service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub inbound: InboundConfig,
}

/// Identity and process settings of the local instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Public domain of this instance, as peers know it.
    pub domain: String,
    pub listen_addr: SocketAddr,
    pub database_path: Option<PathBuf>,
    /// File holding the 32-byte Ed25519 signing seed.
    pub signing_key_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            database_path: None,
            signing_key_path: None,
            log_level: "info".to_string(),
        }
    }
}

/// Outbound delivery and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// First retry delay; doubles on every further attempt.
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Attempts after which a message is dead-lettered.
    pub max_attempts: u32,
    /// Per-call transport timeout.
    pub send_timeout_secs: u64,
    /// How often the background engine looks for due messages.
    pub tick_interval_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            base_backoff_secs: 30,
            max_backoff_secs: 60 * 60, // 1 hour
            max_attempts: 8,
            send_timeout_secs: 30,
            tick_interval_secs: 5,
        }
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    /// Maximum number of changes requested per batch.
    pub batch_limit: u32,
    pub fetch_timeout_secs: u64,
    /// Resource types reconciled with every active peer.
    pub resource_types: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            batch_limit: 500,
            fetch_timeout_secs: 30,
            resource_types: vec![
                "course".to_string(),
                "material".to_string(),
                "moderation".to_string(),
            ],
        }
    }
}

/// Inbound message acceptance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// Largest accepted difference between an envelope timestamp and local time.
    pub max_clock_skew_secs: i64,
    pub max_payload_bytes: usize,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 300,
            max_payload_bytes: 2 * 1024 * 1024, // 2 MB
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        let overlay = load_config_file(path)?;
        merge_config(&mut config, overlay);
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Get the default database path.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("federation.db"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/olg-federation"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("olg-federation"))
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.instance.database_path.is_some() {
        base.instance.database_path = overlay.instance.database_path;
    }
    if overlay.instance.signing_key_path.is_some() {
        base.instance.signing_key_path = overlay.instance.signing_key_path;
    }
    base.instance.domain = overlay.instance.domain;
    base.instance.listen_addr = overlay.instance.listen_addr;
    base.instance.log_level = overlay.instance.log_level;

    base.delivery = overlay.delivery;
    base.sync = overlay.sync;
    base.inbound = overlay.inbound;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("OLG_DOMAIN") {
        config.instance.domain = val;
    }
    if let Ok(val) = std::env::var("OLG_LISTEN_ADDR") {
        if let Ok(addr) = val.parse() {
            config.instance.listen_addr = addr;
        }
    }
    if let Ok(val) = std::env::var("OLG_DATABASE_PATH") {
        config.instance.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("OLG_SIGNING_KEY_PATH") {
        config.instance.signing_key_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("OLG_LOG_LEVEL") {
        config.instance.log_level = val;
    }
    if let Ok(val) = std::env::var("OLG_MAX_ATTEMPTS") {
        if let Ok(n) = val.parse() {
            config.delivery.max_attempts = n;
        }
    }
    if let Ok(val) = std::env::var("OLG_SEND_TIMEOUT_SECS") {
        if let Ok(n) = val.parse() {
            config.delivery.send_timeout_secs = n;
        }
    }
}
