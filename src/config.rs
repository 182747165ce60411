use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::storage::DEFAULT_ALLOWED_CAPACITIES_MB;
use crate::vault::DEFAULT_KDF_ROUNDS;
use crate::watcher::{WatchMode, WatchOptions};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BinderConfig {
    pub log_level: String,
    pub state: StateConfig,
    pub storage: StorageConfig,
    pub vault: VaultConfig,
    pub server: ServerConfig,
    pub watch: WatchConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StateConfig {
    pub data_dir: String,
    pub state_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Sizes (MB) accepted when the user points at an existing file.
    pub allowed_capacities_mb: Vec<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VaultConfig {
    pub kdf_rounds: u32,
    pub kdf_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WatchConfig {
    pub interval_ms: u64,
    pub grace_ms: u64,
    pub mode: WatchMode,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            state: StateConfig::default(),
            storage: StorageConfig::default(),
            vault: VaultConfig::default(),
            server: ServerConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            state_file: "state.json".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            allowed_capacities_mb: DEFAULT_ALLOWED_CAPACITIES_MB.to_vec(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf_rounds: DEFAULT_KDF_ROUNDS,
            kdf_timeout_ms: 30_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:8080".to_string(),
            timeout_ms: 5000,
            heartbeat_interval_ms: 5000,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            grace_ms: 2000,
            mode: WatchMode::OneShot,
        }
    }
}

impl BinderConfig {
    pub fn load_or_default(path: &str) -> Self {
        if std::path::Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => {
                        info!("Config loaded from {}", path);
                        c
                    }
                    Err(e) => {
                        warn!("Error parsing config: {}. Using defaults.", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("Error reading config: {}. Using defaults.", e);
                    Self::default()
                }
            }
        } else {
            info!("Config file not found at '{}'. Creating default.", path);
            let config = Self::default();
            if let Ok(s) = toml::to_string_pretty(&config) {
                if let Err(e) = std::fs::write(path, s) {
                    warn!("Could not write default config to {}: {}", path, e);
                }
            }
            config
        }
    }

    /// [`load_or_default`](Self::load_or_default) before the global subscriber
    /// exists (its level comes from this file). Messages go to `writer`
    /// through a subscriber scoped to the load, filtered by RUST_LOG or `info`.
    pub fn load_logged<W>(path: &str, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let bootstrap = tracing_subscriber::fmt()
            .with_env_filter(env_filter_or("info"))
            .with_writer(writer)
            .finish();
        tracing::subscriber::with_default(bootstrap, || Self::load_or_default(path))
    }

    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(&self.state.data_dir).join(&self.state.state_file)
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            interval: Duration::from_millis(self.watch.interval_ms.max(1)),
            grace: Duration::from_millis(self.watch.grace_ms),
            mode: self.watch.mode,
        }
    }

    pub fn log_filter(&self) -> &str {
        if self.log_level.is_empty() {
            "info"
        } else {
            &self.log_level
        }
    }
}

/// RUST_LOG wins over the configured level.
pub fn env_filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}
