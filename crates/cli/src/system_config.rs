//! System configuration
//!
//! Optional TOML file at `<config dir>/fsw/config.toml`. A missing file means
//! defaults. `FSW_CONFIG` points at a different file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "FSW_CONFIG";

/// Upper bound for the coalescing latency
pub const MAX_LATENCY_MS: u64 = 60_000;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub watch: WatchConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Coalescing latency; unset delivers as soon as possible
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Re-walk a root after its changes were lost
    pub rescan_on_invalidate: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            latency_ms: None,
            rescan_on_invalidate: true,
        }
    }
}

impl WatchConfig {
    pub fn latency(&self) -> Option<Duration> {
        self.latency_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SystemConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(latency) = self.watch.latency_ms {
            validate_latency(latency)?;
        }
        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            anyhow::bail!(
                "log.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.log.level
            );
        }
        Ok(())
    }
}

pub fn validate_latency(latency_ms: u64) -> Result<()> {
    if latency_ms > MAX_LATENCY_MS {
        anyhow::bail!(
            "latency_ms must be between 0 and {}, got {}",
            MAX_LATENCY_MS,
            latency_ms
        );
    }
    Ok(())
}

/// Location of the config file
pub fn config_file_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("fsw").join("config.toml"))
}

/// Load the config file, or defaults when there is none
pub fn load() -> Result<SystemConfig> {
    match config_file_path() {
        Some(path) => load_from(&path),
        None => Ok(SystemConfig::default()),
    }
}

pub fn load_from(path: &Path) -> Result<SystemConfig> {
    if !path.exists() {
        return Ok(SystemConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: SystemConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok(config)
}

pub fn save(config: &SystemConfig) -> Result<()> {
    let path = config_file_path().context("Could not determine config file path")?;
    save_to(config, &path)
}

pub fn save_to(config: &SystemConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}

/// Write the example config if no config file exists yet
pub fn init_if_missing() -> Result<()> {
    let path = config_file_path().context("Could not determine config file path")?;
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, example_config())
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}

pub fn example_config() -> &'static str {
    r#"# fsw configuration

[watch]
# Coalescing latency in milliseconds (0-60000). Only the FSEvents backend
# batches changes; other platforms ignore it.
latency_ms = 100

# Re-walk a root when its changes were lost
rescan_on_invalidate = true

[log]
# trace | debug | info | warn | error
level = "info"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, SystemConfig::default());
        assert!(config.watch.rescan_on_invalidate);
        assert_eq!(config.watch.latency(), None);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[watch]\nlatency_ms = 250\n").unwrap();

        let config = load_from(&path).unwrap();
        assert_eq!(config.watch.latency(), Some(Duration::from_millis(250)));
        assert!(config.watch.rescan_on_invalidate);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: SystemConfig = toml::from_str(example_config()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.watch.latency_ms, Some(100));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = SystemConfig::default();
        config.watch.latency_ms = Some(MAX_LATENCY_MS + 1);
        assert!(config.validate().is_err());

        config.watch.latency_ms = Some(MAX_LATENCY_MS);
        config.validate().unwrap();

        config.log.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[watch]\nlatency_ms = 999999\n").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = SystemConfig::default();
        config.watch.rescan_on_invalidate = false;
        config.log.level = "debug".to_string();

        save_to(&config, &path).unwrap();
        assert_eq!(load_from(&path).unwrap(), config);
    }
}
