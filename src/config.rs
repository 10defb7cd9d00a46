use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::domain::models::PartialTradingParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    pub master_key: MasterKeyConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Floor of the spec §4.3 overlay chain: "global defaults ← subscriber
    /// defaults ← strategy-subscription overrides ← signal's explicit
    /// overrides". Any field a subscriber's own `TradingParams` already
    /// sets takes precedence, since the subscriber layer sits above this
    /// one; this only fills in fields nothing else provides.
    #[serde(default)]
    pub global_defaults: PartialTradingParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    /// Disable CORS restrictions (allows all origins) - use only in development!
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub additional_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable file logging
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,
    /// Directory for log files (relative to executable or absolute path)
    #[serde(default = "default_log_directory")]
    pub directory: String,
    /// Prefix for log file names
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
    /// Rotation strategy: "daily", "hourly", or "never"
    #[serde(default = "default_log_rotation")]
    pub rotation: String,
    /// Maximum number of log files to keep (0 = unlimited)
    #[serde(default = "default_max_files")]
    pub max_files: u32,
    /// Maximum age of log files in days (0 = unlimited)
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_logging_enabled() -> bool {
    true
}
fn default_log_directory() -> String {
    "logs".to_string()
}
fn default_log_file_prefix() -> String {
    "dispatch-engine".to_string()
}
fn default_log_rotation() -> String {
    "daily".to_string()
}
fn default_max_files() -> u32 {
    30
}
fn default_max_age_days() -> u32 {
    90
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            directory: default_log_directory(),
            file_prefix: default_log_file_prefix(),
            rotation: default_log_rotation(),
            max_files: default_max_files(),
            max_age_days: default_max_age_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Shared-secret and edge rate-limit parameters for the webhook endpoint.
/// See spec §4.1, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Overridden by the `WEBHOOK_PASSPHRASE` environment variable if set.
    pub passphrase: String,
    #[serde(default = "default_burst_limit_per_minute")]
    pub burst_limit_per_minute: u32,
}

fn default_burst_limit_per_minute() -> u32 {
    30
}

/// Per-exchange rate-limit bucket parameters, keyed by exchange id in the
/// `[exchanges.<id>]` TOML table. See spec §4.6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub base_url: String,
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: u32,
    #[serde(default = "default_rate_limit_refill_per_sec")]
    pub rate_limit_refill_per_sec: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_rate_limit_capacity() -> u32 {
    40
}
fn default_rate_limit_refill_per_sec() -> u32 {
    10
}
fn default_request_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_fan_out_concurrency")]
    pub fan_out_concurrency: usize,
}

fn default_worker_count() -> usize {
    4
}
fn default_fan_out_concurrency() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { worker_count: default_worker_count(), fan_out_concurrency: default_fan_out_concurrency() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_balance_snapshot_interval_secs")]
    pub balance_snapshot_interval_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    10
}
fn default_balance_snapshot_interval_secs() -> u64 {
    300
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { tick_interval_secs: default_tick_interval_secs(), balance_snapshot_interval_secs: default_balance_snapshot_interval_secs() }
    }
}

/// Source of the credential-store master key. Overridden by
/// `MASTER_ENCRYPTION_KEY` if set; never logged, never persisted. See
/// spec §4.9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterKeyConfig {
    pub key_base64: String,
}

/// Notification sink endpoints, spec §4.8/§6. Each entry becomes one
/// fire-and-forget outgoing webhook; a sink's failure never blocks the
/// caller.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    #[serde(default)]
    pub sinks: Vec<NotificationSinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSinkConfig {
    pub name: String,
    pub url: String,
}

impl Config {
    /// Load config from layered TOML files
    ///
    /// Loads configuration files in the following order (later files override earlier):
    /// 1. {base_name}.toml (required, e.g., config.toml)
    /// 2. {base_name}.{ENV}.toml (optional, only if CONFIG_ENV is set)
    /// 3. {base_name}.local.toml (optional, for personal overrides, git-ignored)
    ///
    /// # Arguments
    /// * `base_name` - Base name without extension (e.g., "config" for config.toml)
    ///
    /// # Environment Variables
    /// * `CONFIG_ENV` - If set, loads {base_name}.{CONFIG_ENV}.toml (e.g., config.dev.toml)
    ///   - No default value - must be explicitly set
    ///   - Common values: "dev", "prod", "staging"
    /// * `WEBHOOK_PASSPHRASE`, `MASTER_ENCRYPTION_KEY`, `DATABASE_URL` override
    ///   their file-config counterparts, mirroring how secrets are kept out
    ///   of the TOML files entirely in deployed environments.
    pub fn from_file<P: AsRef<Path>>(base_name: P) -> Result<Self> {
        let base_path = base_name.as_ref();
        let base_str = base_path.to_str().context("Invalid base path")?;

        let mut builder = config::Config::builder().add_source(config::File::with_name(base_str));

        if let Ok(env) = std::env::var("CONFIG_ENV") {
            let env_config = format!("{}.{}", base_str, env);
            builder = builder.add_source(config::File::with_name(&env_config).required(false));
        }

        let local_config = format!("{}.local", base_str);
        builder = builder.add_source(config::File::with_name(&local_config).required(false));

        let built = builder.build().context("Failed to build configuration")?;
        let mut config: Config = built.try_deserialize().context("Failed to deserialize configuration")?;

        if let Ok(passphrase) = std::env::var("WEBHOOK_PASSPHRASE") {
            config.webhook.passphrase = passphrase;
        }
        if let Ok(key) = std::env::var("MASTER_ENCRYPTION_KEY") {
            config.master_key.key_base64 = key;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }

        Ok(config)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        self.cors.additional_origins.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig { host: "0.0.0.0".to_string(), port: 8080 },
            database: DatabaseConfig { url: "sqlite://dispatch_engine.db?mode=rwc".to_string() },
            cors: CorsConfig::default(),
            logging: LoggingConfig::default(),
            webhook: WebhookConfig { passphrase: "changeme".to_string(), burst_limit_per_minute: 30 },
            exchanges: HashMap::new(),
            worker: WorkerConfig::default(),
            supervisor: SupervisorConfig::default(),
            master_key: MasterKeyConfig { key_base64: "".to_string() },
            notifications: NotificationConfig::default(),
            global_defaults: PartialTradingParams::default(),
        }
    }

    #[test]
    fn server_address_combines_host_and_port() {
        let config = sample();
        assert_eq!(config.server_address(), "0.0.0.0:8080");
    }

    #[test]
    fn toml_round_trip_preserves_webhook_section() {
        let config = sample();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[webhook]"));
        let reparsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(reparsed.webhook.passphrase, "changeme");
    }

    #[test]
    fn worker_config_defaults_are_sane() {
        let worker = WorkerConfig::default();
        assert!(worker.worker_count > 0);
        assert!(worker.fan_out_concurrency > 0);
    }
}
