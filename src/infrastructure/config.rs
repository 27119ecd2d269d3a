//! Configuration infrastructure
//!
//! One JSON config file with a section per component, all optional with
//! sensible defaults. A missing file is written out with the defaults on
//! first start so operators have something concrete to edit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use crate::application::pool::PoolConfig;
use crate::application::rate_governor::RateConfig;
use crate::application::scheduler::SchedulerConfig;
use crate::infrastructure::driver::DriverConfig;

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub rate: RateConfig,
    pub scheduler: SchedulerConfig,
    pub driver: DriverConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:data/bookdelta.db".to_string(),
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output (daily rotation)
    pub file_output: bool,

    /// Log directory; defaults to ./logs next to the working directory
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: false,
            log_dir: None,
        }
    }
}

/// Loads and persists the application configuration.
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default location under the user's config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bookdelta")
            .join("config.json")
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the config file, creating it with defaults when absent.
    pub async fn load_or_default(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            let config = AppConfig::default();
            self.save(&config).await?;
            info!("created default configuration at {}", self.path.display());
            return Ok(config);
        }

        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read config file {}", self.path.display()))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", self.path.display()))?;
        Ok(config)
    }

    pub async fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        tokio::fs::write(&self.path, raw)
            .await
            .with_context(|| format!("failed to write config file {}", self.path.display()))?;
        Ok(())
    }
}
