use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::db::transaction::RetryPolicy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_PAYMENT_WINDOW_SECS: u64 = 3_600; // 1 hour
const DEFAULT_EXPIRY_JOB_INTERVAL_SECS: u64 = 300; // 5 minutes
const DEFAULT_AUTO_CONFIRM_JOB_INTERVAL_SECS: u64 = 3_600; // hourly
const DEFAULT_AUTO_CONFIRM_AFTER_SECS: u64 = 172_800; // 2 days

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 1000))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// How long a new order waits for payment before the expiry job may cancel it
    #[serde(default = "default_payment_window_secs")]
    #[validate(range(min = 60))]
    pub order_payment_window_secs: u64,

    /// Period of the payment expiry job
    #[serde(default = "default_expiry_job_interval_secs")]
    #[validate(range(min = 1))]
    pub expiry_job_interval_secs: u64,

    /// Period of the delivery auto-confirm job
    #[serde(default = "default_auto_confirm_job_interval_secs")]
    #[validate(range(min = 1))]
    pub auto_confirm_job_interval_secs: u64,

    /// Age after which a delivered order is confirmed automatically
    #[serde(default = "default_auto_confirm_after_secs")]
    #[validate(range(min = 1))]
    pub auto_confirm_after_secs: u64,

    /// Attempts for optimistic stock updates (first try included)
    #[serde(default = "default_stock_retry_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub stock_retry_attempts: u32,

    #[serde(default = "default_stock_retry_min_backoff_ms")]
    pub stock_retry_min_backoff_ms: u64,

    #[serde(default = "default_stock_retry_max_backoff_ms")]
    pub stock_retry_max_backoff_ms: u64,
}

impl AppConfig {
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            order_payment_window_secs: default_payment_window_secs(),
            expiry_job_interval_secs: default_expiry_job_interval_secs(),
            auto_confirm_job_interval_secs: default_auto_confirm_job_interval_secs(),
            auto_confirm_after_secs: default_auto_confirm_after_secs(),
            stock_retry_attempts: default_stock_retry_attempts(),
            stock_retry_min_backoff_ms: default_stock_retry_min_backoff_ms(),
            stock_retry_max_backoff_ms: default_stock_retry_max_backoff_ms(),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Retry policy for stock compare-and-swap updates.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.stock_retry_attempts,
            min_backoff: Duration::from_millis(self.stock_retry_min_backoff_ms),
            max_backoff: Duration::from_millis(self.stock_retry_max_backoff_ms),
        }
    }

    pub fn payment_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.order_payment_window_secs as i64)
    }

    pub fn auto_confirm_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auto_confirm_after_secs as i64)
    }

    pub fn expiry_job_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_job_interval_secs)
    }

    pub fn auto_confirm_job_interval(&self) -> Duration {
        Duration::from_secs(self.auto_confirm_job_interval_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.stock_retry_min_backoff_ms > self.stock_retry_max_backoff_ms {
            let mut err = ValidationError::new("stock_retry_backoff_range");
            err.message = Some(
                "stock_retry_min_backoff_ms must not exceed stock_retry_max_backoff_ms".into(),
            );
            errors.add("stock_retry_min_backoff_ms", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_pool_bounds");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_db_idle_timeout_secs() -> u64 {
    600
}

fn default_db_acquire_timeout_secs() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_payment_window_secs() -> u64 {
    DEFAULT_PAYMENT_WINDOW_SECS
}

fn default_expiry_job_interval_secs() -> u64 {
    DEFAULT_EXPIRY_JOB_INTERVAL_SECS
}

fn default_auto_confirm_job_interval_secs() -> u64 {
    DEFAULT_AUTO_CONFIRM_JOB_INTERVAL_SECS
}

fn default_auto_confirm_after_secs() -> u64 {
    DEFAULT_AUTO_CONFIRM_AFTER_SECS
}

fn default_stock_retry_attempts() -> u32 {
    3
}

fn default_stock_retry_min_backoff_ms() -> u64 {
    50
}

fn default_stock_retry_max_backoff_ms() -> u64 {
    100
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_core={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    // try_init: tests and the CLI may call this more than once
    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
