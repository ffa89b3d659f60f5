//! Main application configuration
//!
//! Engine settings loaded from environment variables or a TOML file, with
//! validation and default values.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub matchmaking: MatchmakingSettings,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Matchmaking-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingSettings {
    /// Tickets per independent matching run
    pub batch_size: usize,
    /// Orderings tried per assembly
    pub max_iterations: usize,
    /// How long the queueing layer locks the pool for one tick
    pub pool_lock_seconds: u64,
    /// Share of the pool lock a run may spend before it stops pivoting
    pub time_budget_fraction: f64,
    /// Capacity of the result channel
    pub result_buffer: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "alliance-matchmaker".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_iterations: 100,
            pool_lock_seconds: 60,
            time_budget_fraction: 0.5,
            result_buffer: 256,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load a TOML file; environment variables still override it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        // Service settings
        if let Ok(name) = env::var("SERVICE_NAME") {
            self.service.name = name;
        }

        if let Ok(log_level) = env::var("LOG_LEVEL") {
            self.service.log_level = log_level;
        }

        // Matchmaking settings
        if let Ok(batch_size) = env::var("MATCHMAKING_BATCH_SIZE") {
            self.matchmaking.batch_size = batch_size
                .parse()
                .map_err(|_| anyhow!("Invalid MATCHMAKING_BATCH_SIZE value: {}", batch_size))?;
        }

        if let Ok(iterations) = env::var("MATCHMAKING_MAX_ITERATIONS") {
            self.matchmaking.max_iterations = iterations.parse().map_err(|_| {
                anyhow!("Invalid MATCHMAKING_MAX_ITERATIONS value: {}", iterations)
            })?;
        }

        if let Ok(lock) = env::var("MATCHMAKING_POOL_LOCK_SECONDS") {
            self.matchmaking.pool_lock_seconds = lock
                .parse()
                .map_err(|_| anyhow!("Invalid MATCHMAKING_POOL_LOCK_SECONDS value: {}", lock))?;
        }

        if let Ok(fraction) = env::var("MATCHMAKING_TIME_BUDGET_FRACTION") {
            self.matchmaking.time_budget_fraction = fraction.parse().map_err(|_| {
                anyhow!("Invalid MATCHMAKING_TIME_BUDGET_FRACTION value: {}", fraction)
            })?;
        }

        if let Ok(buffer) = env::var("MATCHMAKING_RESULT_BUFFER") {
            self.matchmaking.result_buffer = buffer
                .parse()
                .map_err(|_| anyhow!("Invalid MATCHMAKING_RESULT_BUFFER value: {}", buffer))?;
        }

        Ok(())
    }

    /// Get pool lock as Duration
    pub fn pool_lock(&self) -> Duration {
        Duration::from_secs(self.matchmaking.pool_lock_seconds)
    }

    /// Wall-clock budget for one matching run
    pub fn time_budget(&self) -> Duration {
        self.pool_lock()
            .mul_f64(self.matchmaking.time_budget_fraction.clamp(0.0, 1.0))
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    if config.service.name.is_empty() {
        return Err(anyhow!("Service name cannot be empty"));
    }

    // Validate matchmaking settings
    if config.matchmaking.batch_size == 0 {
        return Err(anyhow!("Batch size must be greater than 0"));
    }

    if config.matchmaking.max_iterations == 0 {
        return Err(anyhow!("Max iterations must be greater than 0"));
    }

    if config.matchmaking.pool_lock_seconds == 0 {
        return Err(anyhow!("Pool lock must be greater than 0"));
    }

    let fraction = config.matchmaking.time_budget_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(anyhow!(
            "Time budget fraction must be in (0, 1], got {}",
            fraction
        ));
    }

    if config.matchmaking.result_buffer == 0 {
        return Err(anyhow!("Result buffer must be greater than 0"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.pool_lock(), Duration::from_secs(60));
        assert_eq!(config.time_budget(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.service.log_level = "loud".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.matchmaking.batch_size = 0;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.matchmaking.time_budget_fraction = 1.5;
        assert!(validate_config(&config).is_err());

        config.matchmaking.time_budget_fraction = 0.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [matchmaking]
            batch_size = 50
            time_budget_fraction = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.matchmaking.batch_size, 50);
        assert_eq!(config.matchmaking.max_iterations, 100);
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.time_budget(), Duration::from_secs(15));
    }
}
