/*!
 * Configuration management for MeshFlow.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for MeshFlow components.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for MeshFlow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Driver configuration
    #[serde(default)]
    pub driver: DriverConfig,

    /// Firmware upgrade configuration
    #[serde(default)]
    pub firmware: FirmwareConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_log_targets")]
    pub targets: bool,
}

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Seconds of silence before a device is declared in comm-fail (0 disables monitoring)
    #[serde(default)]
    pub comm_fail_timeout_secs: u64,

    /// How long a synchronous request waits for its asynchronous response
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

/// Firmware upgrade configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Directory firmware images are downloaded into
    #[serde(default = "default_firmware_dir")]
    pub directory: String,

    /// Base URL firmware images are fetched from
    #[serde(default = "default_firmware_base_url")]
    pub base_url: String,

    /// Delay between deciding a device needs an upgrade and starting the download
    #[serde(default = "default_upgrade_delay_secs")]
    pub upgrade_delay_secs: u64,

    /// Delay before retrying a failed download
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl DriverConfig {
    /// Comm-fail timeout, `None` when monitoring is disabled
    pub fn comm_fail_timeout(&self) -> Option<Duration> {
        match self.comm_fail_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Response timeout as a duration
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl FirmwareConfig {
    /// Upgrade delay as a duration
    pub fn upgrade_delay(&self) -> Duration {
        Duration::from_secs(self.upgrade_delay_secs)
    }

    /// Retry delay as a duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            targets: default_log_targets(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            comm_fail_timeout_secs: 0,
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            directory: default_firmware_dir(),
            base_url: default_firmware_base_url(),
            upgrade_delay_secs: default_upgrade_delay_secs(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

fn default_app_name() -> String {
    "meshflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_targets() -> bool {
    true
}

fn default_response_timeout_ms() -> u64 {
    5000
}

fn default_firmware_dir() -> String {
    "./data/firmware".to_string()
}

fn default_firmware_base_url() -> String {
    "http://localhost/firmware".to_string()
}

fn default_upgrade_delay_secs() -> u64 {
    2 * 60 * 60
}

fn default_retry_delay_secs() -> u64 {
    60 * 60
}

impl Config {
    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize configuration: {}", e)))
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(override_config) = self.override_with {
            return Ok(override_config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        if config.driver.response_timeout_ms == 0 {
            return Err(Error::config("driver.response_timeout_ms must be greater than zero"));
        }

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "meshflow");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.driver.response_timeout(), Duration::from_secs(5));
        assert!(config.driver.comm_fail_timeout().is_none());
        assert_eq!(config.firmware.upgrade_delay(), Duration::from_secs(7200));
        assert_eq!(config.firmware.retry_delay(), Duration::from_secs(3600));
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "meshflow");
        assert_eq!(config.driver.response_timeout_ms, 5000);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("config.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [driver]
                comm_fail_timeout_secs = 3600

                [firmware]
                directory = "/var/lib/meshflow/firmware"
                upgrade_delay_secs = 1
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.driver.comm_fail_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.firmware.directory, "/var/lib/meshflow/firmware");
        assert_eq!(config.firmware.upgrade_delay(), Duration::from_secs(1));
        assert_eq!(config.firmware.retry_delay_secs, 3600);

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("MESHFLOWTEST__LOGGING__LEVEL", "trace");
        env::set_var("MESHFLOWTEST__FIRMWARE__RETRY_DELAY_SECS", "5");

        let config = ConfigBuilder::new()
            .with_environment_prefix("meshflowtest")
            .build()?;

        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.firmware.retry_delay_secs, 5);

        env::remove_var("MESHFLOWTEST__LOGGING__LEVEL");
        env::remove_var("MESHFLOWTEST__FIRMWARE__RETRY_DELAY_SECS");

        Ok(())
    }

    #[test]
    fn test_zero_response_timeout_rejected() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("config.toml");
        std::fs::write(&file_path, "[driver]\nresponse_timeout_ms = 0\n")?;

        let result = ConfigBuilder::new().with_config_file(file_path).build();
        assert!(matches!(result, Err(Error::Config(_))));

        Ok(())
    }

    #[test]
    fn test_toml_rendering() {
        let rendered = Config::default().to_toml_string().unwrap();
        assert!(rendered.contains("[firmware]"));
        assert!(rendered.contains("upgrade_delay_secs = 7200"));
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "meshflow");
    }
}
