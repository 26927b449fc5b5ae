//! Configuration management command
//!
//! Provides CLI interface to view and edit the config file.

use crate::system_config::{self, SystemConfig, MAX_LATENCY_MS};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;

const KEYS: &[&str] = &["watch.latency_ms", "watch.rescan_on_invalidate", "log.level"];

/// List all configuration values
pub async fn run_list() -> Result<()> {
    let config = system_config::load()?;
    let config_path =
        system_config::config_file_path().context("Could not determine config file path")?;

    println!("{}", "Configuration".bold());
    println!("{}: {}\n", "Location".dimmed(), config_path.display().dimmed());

    println!("{}", "[watch]".yellow());
    println!(
        "  {} = {}",
        "latency_ms".cyan(),
        match config.watch.latency_ms {
            Some(ms) => ms.to_string(),
            None => "(unset, deliver immediately)".dimmed().to_string(),
        }
    );
    println!(
        "  {} = {}",
        "rescan_on_invalidate".cyan(),
        config.watch.rescan_on_invalidate
    );

    println!("\n{}", "[log]".yellow());
    println!("  {} = {}", "level".cyan(), config.log.level);

    println!("\n{}", "Valid Ranges:".bold());
    println!("  latency_ms: 0-{}", MAX_LATENCY_MS);
    println!("  level: trace, debug, info, warn, error");

    Ok(())
}

fn value_of(config: &SystemConfig, key: &str) -> Result<String> {
    let value = match key {
        "watch.latency_ms" => config
            .watch
            .latency_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "none".to_string()),
        "watch.rescan_on_invalidate" => config.watch.rescan_on_invalidate.to_string(),
        "log.level" => config.log.level.clone(),
        _ => anyhow::bail!(
            "Unknown config key: {}. Known keys: {}",
            key,
            KEYS.join(", ")
        ),
    };
    Ok(value)
}

fn apply(config: &mut SystemConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "watch.latency_ms" => {
            config.watch.latency_ms = if value == "none" {
                None
            } else {
                Some(
                    value
                        .parse()
                        .context("Invalid value: must be a non-negative integer or 'none'")?,
                )
            };
        }
        "watch.rescan_on_invalidate" => {
            config.watch.rescan_on_invalidate = value
                .parse()
                .context("Invalid value: must be 'true' or 'false'")?;
        }
        "log.level" => {
            config.log.level = value.to_ascii_lowercase();
        }
        _ => anyhow::bail!(
            "Unknown config key: {}. Known keys: {}",
            key,
            KEYS.join(", ")
        ),
    }
    Ok(())
}

/// Get a single configuration value
pub async fn run_get(key: &str) -> Result<()> {
    let config = system_config::load()?;
    println!("{}", value_of(&config, key)?);
    Ok(())
}

/// Set a configuration value
pub async fn run_set(key: &str, value: &str) -> Result<()> {
    let mut config = system_config::load()?;
    apply(&mut config, key, value)?;

    // Validate before saving
    config.validate().context("Invalid configuration value")?;
    system_config::save(&config)?;

    println!("{} {} = {}", "✓".green(), key.cyan(), value);
    Ok(())
}

/// Show the config file path and optionally create it
pub async fn run_path(create: bool) -> Result<()> {
    let config_path =
        system_config::config_file_path().context("Could not determine config file path")?;

    if create && !config_path.exists() {
        system_config::init_if_missing()?;
        println!("{} Created config file at: {}", "✓".green(), config_path.display());
    } else if config_path.exists() {
        println!("{}", config_path.display());
    } else {
        println!("{}", config_path.display());
        println!("{}", "File does not exist. Use --create to create it.".yellow());
    }

    Ok(())
}

/// Show example configuration
pub async fn run_example() -> Result<()> {
    print!("{}", system_config::example_config());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get_each_key() {
        let mut config = SystemConfig::default();

        apply(&mut config, "watch.latency_ms", "250").unwrap();
        assert_eq!(value_of(&config, "watch.latency_ms").unwrap(), "250");
        apply(&mut config, "watch.latency_ms", "none").unwrap();
        assert_eq!(value_of(&config, "watch.latency_ms").unwrap(), "none");

        apply(&mut config, "watch.rescan_on_invalidate", "false").unwrap();
        assert_eq!(value_of(&config, "watch.rescan_on_invalidate").unwrap(), "false");

        apply(&mut config, "log.level", "DEBUG").unwrap();
        assert_eq!(value_of(&config, "log.level").unwrap(), "debug");
    }

    #[test]
    fn test_bad_input_is_rejected() {
        let mut config = SystemConfig::default();
        assert!(apply(&mut config, "watch.latency_ms", "-1").is_err());
        assert!(apply(&mut config, "watch.rescan_on_invalidate", "maybe").is_err());
        assert!(apply(&mut config, "nope", "1").is_err());
        assert!(value_of(&config, "nope").is_err());
    }
}
