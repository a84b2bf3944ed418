// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Size of the worker pool that runs task commands.
    pub max_workers: usize,
    /// Maximum concurrent in-flight executions for one task id; an over-limit
    /// firing is dropped as missed rather than queued.
    pub max_instances_per_task: usize,
    /// A late firing still executes inside this window; beyond it the firing
    /// counts as missed.
    pub misfire_grace_seconds: u64,
    /// How long `stop()` waits for in-flight executions to unwind before
    /// force-cancelling them.
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub default_timeout_seconds: u64,
    pub default_max_retries: u32,
    pub default_retry_interval_seconds: u64,
    /// Per-stream cap on captured stdout/stderr bytes.
    pub output_capture_bytes: usize,
    /// Interval of the child resource sampling tick.
    pub sample_interval_seconds: u64,
    pub cpu_warn_percent: f64,
    pub memory_warn_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
}

impl Settings {
    /// Load configuration with layered precedence: defaults file → local file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory. Built-in defaults sit at
    /// the bottom of the stack so partial files and env overrides stay valid.
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let config = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }
        if self.scheduler.max_workers == 0 {
            return Err("Scheduler max_workers must be greater than 0".to_string());
        }
        if self.scheduler.max_instances_per_task == 0 {
            return Err("Scheduler max_instances_per_task must be greater than 0".to_string());
        }
        if self.executor.output_capture_bytes == 0 {
            return Err("Executor output_capture_bytes must be greater than 0".to_string());
        }
        if self.executor.sample_interval_seconds == 0 {
            return Err("Executor sample_interval_seconds must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/cron_scheduler".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
            },
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 20,
            max_instances_per_task: 3,
            misfire_grace_seconds: 60,
            shutdown_grace_seconds: 5,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 300,
            default_max_retries: 3,
            default_retry_interval_seconds: 60,
            output_capture_bytes: 64 * 1024,
            sample_interval_seconds: 5,
            cpu_warn_percent: 90.0,
            memory_warn_mb: 1024.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_workers() {
        let mut settings = Settings::default();
        settings.scheduler.max_workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_default_limits() {
        let settings = Settings::default();
        assert_eq!(settings.scheduler.max_instances_per_task, 3);
        assert_eq!(settings.scheduler.misfire_grace_seconds, 60);
        assert_eq!(settings.scheduler.max_workers, 20);
        assert_eq!(settings.executor.default_timeout_seconds, 300);
    }

    #[test]
    fn test_load_from_missing_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from_path(dir.path().join("nope")).unwrap();
        assert_eq!(settings.scheduler.max_workers, 20);
    }
}
