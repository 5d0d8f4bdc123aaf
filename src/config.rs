use anyhow::{anyhow, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "ws://localhost:8080/ws";

/// Tunables for the transport connection. All times in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    pub initial_delay_ms: u64,
    pub growth_factor: f64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    pub max_retries: u32,
    pub max_failures: u32,
    pub circuit_reset_delay_ms: u64,
    pub ack_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            initial_delay_ms: 1000,
            growth_factor: 1.5,
            max_delay_ms: 30_000,
            jitter_ratio: 0.3,
            max_retries: 5,
            max_failures: 3,
            circuit_reset_delay_ms: 30_000,
            ack_timeout_ms: 5000,
            ping_interval_ms: 25_000,
            ping_timeout_ms: 20_000,
        }
    }
}

impl TransportConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn circuit_reset_delay(&self) -> Duration {
        Duration::from_millis(self.circuit_reset_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub server_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub transport: TransportConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            server_url: DEFAULT_SERVER_URL.to_string(),
            user_id: None,
            transport: TransportConfig::default(),
        }
    }
}

impl AppConfig {
    /// Apply `LEASECHAT_SERVER_URL` / `LEASECHAT_USER_ID` on top of the file values
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = env::var("LEASECHAT_SERVER_URL") {
            if !url.trim().is_empty() {
                self.server_url = url.trim().to_string();
            }
        }
        if let Ok(user) = env::var("LEASECHAT_USER_ID") {
            if !user.trim().is_empty() {
                self.user_id = Some(user.trim().to_string());
            }
        }
        self
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

pub fn set_config_path_override(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("leasechat");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

/// Load the config from the default (or overridden) location.
/// A missing file yields the defaults.
pub fn load_config() -> Result<AppConfig> {
    let path = get_config_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        info!("No config file at {}, using defaults", path.display());
        return Ok(AppConfig::default());
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: AppConfig = serde_json::from_str(&contents)
        .map_err(|e| anyhow!("Invalid config file {}: {}", path.display(), e))?;
    info!("Loaded config from {}", path.display());

    Ok(config)
}

pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Config saved to {}", path.display());
    Ok(())
}
