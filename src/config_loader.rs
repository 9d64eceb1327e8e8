use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::models::UploadOptions;

/// Host the upload pipeline addresses images under when nothing else is configured
pub const DEFAULT_PUBLIC_BASE_URL: &str = "https://image.vastsea.cc";

const CONFIG_FILE: &str = "config.toml";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),

    #[error("Failed to acquire lock: {0}")]
    LockError(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Paths {
    pub data_directory: String,
    pub database_file: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Api {
    /// Image API root. Empty means uploads are simulated locally
    pub base_url: String,
    /// Host that hash-addressed image URLs are built on
    pub public_base_url: String,
    /// Account whose images the API operates on
    pub owner: String,
    pub timeout_seconds: u64,
    pub user_agent: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Upload {
    pub defaults: UploadOptions,
    /// Minimum progress increase (percent) between two reported transfer events
    pub progress_step: u8,
    pub simulated_latency_ms: u64,
    pub simulated_tick_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Hashing {
    pub use_worker: bool,
    pub persist_cache: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    pub paths: Paths,
    pub api: Api,
    pub upload: Upload,
    pub hashing: Hashing,
    pub logging: Logging,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: Paths {
                data_directory: "./data".to_string(),
                database_file: "./data/imghost.sqlite".to_string(),
                log_directory: "./logs".to_string(),
            },
            api: Api {
                base_url: String::new(),
                public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
                owner: String::new(),
                timeout_seconds: 30,
                user_agent: format!("imghost/{}", env!("CARGO_PKG_VERSION")),
            },
            upload: Upload {
                defaults: UploadOptions::default(),
                progress_step: 10,
                simulated_latency_ms: 1500,
                simulated_tick_ms: 200,
            },
            hashing: Hashing {
                use_worker: true,
                persist_cache: false,
            },
            logging: Logging {
                log_level: "info".to_string(),
                log_format: "json".to_string(),
                log_to_terminal: false,
                log_to_file: true,
            },
        }
    }
}

impl AppConfig {
    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.api.public_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api.public_base_url must not be empty".to_string()));
        }
        if !(1..=100).contains(&self.upload.progress_step) {
            return Err(ConfigError::Invalid(format!(
                "upload.progress_step must be between 1 and 100, got {}",
                self.upload.progress_step
            )));
        }
        if !self.api.base_url.is_empty() && self.api.owner.is_empty() {
            return Err(ConfigError::Invalid(
                "api.owner is required when api.base_url is set".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether uploads go to a real API rather than the local simulation
    pub fn uses_remote_api(&self) -> bool {
        !self.api.base_url.trim().is_empty()
    }
}

// Config manager for config.toml
pub struct ConfigManager {
    app_config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
}

impl ConfigManager {
    // Load (or create) the configuration in `config_dir`
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir)?;

        let manager = Self {
            app_config: Arc::new(RwLock::new(app_config)),
            config_dir,
        };
        manager.create_default_config()?;

        Ok(manager)
    }

    // Load app config from config.toml
    fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            warn!("Config file not found: {}", config_path.display());
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse config.toml: {}", e);
                info!("Backing up old config and creating new one with default values");

                if let Err(backup_err) = fs::rename(&config_path, config_path.with_extension("toml.backup")) {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(toml_string) => match fs::write(&config_path, toml_string) {
                        Ok(()) => info!("Created new config.toml with default values"),
                        Err(write_err) => error!("Failed to write new config file: {}", write_err),
                    },
                    Err(ser_err) => error!("Failed to serialize default config: {}", ser_err),
                }

                Ok(default_config)
            }
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    // Get app config
    pub fn get_app_config(&self) -> ConfigResult<AppConfig> {
        self.app_config
            .read()
            .map_err(|e| ConfigError::LockError(e.to_string()))
            .map(|config| config.clone())
    }

    // Save app config to file
    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        config.validate()?;

        let config_path = self.config_dir.join(CONFIG_FILE);
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(&config_path, toml_string)?;

        let mut app_config = self
            .app_config
            .write()
            .map_err(|e| ConfigError::LockError(e.to_string()))?;
        *app_config = config.clone();

        Ok(())
    }

    // Create config.toml if it doesn't exist
    pub fn create_default_config(&self) -> ConfigResult<()> {
        let config_path = self.config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            return Ok(());
        }

        let default_config = AppConfig::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(&config_path, toml_string)?;
        info!("Wrote default config to {}", config_path.display());

        let mut app_config = self
            .app_config
            .write()
            .map_err(|e| ConfigError::LockError(e.to_string()))?;
        *app_config = default_config;

        Ok(())
    }
}

// Helper function to create a shared ConfigManager
pub fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
    Ok(Arc::new(ConfigManager::new(config_dir)?))
}
