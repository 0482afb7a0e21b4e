//! Configuration management for the trusted group coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub app: AppConfig,
    pub genesis: GenesisConfig,
    pub ledger: LedgerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

/// Credentials of this node's ledger application
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub client_id: String,
    pub pin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenesisConfig {
    pub members: Vec<String>,
    pub threshold: u8,
    /// Unix nanoseconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub api_urls: Vec<String>,
    pub access_token: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_batch_size")]
    pub drain_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub action_batch_size: usize,
    /// Upper bound on inputs selected for one transaction
    #[serde(default = "default_max_inputs")]
    pub max_inputs: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            drain_batch_size: default_batch_size(),
            action_batch_size: default_batch_size(),
            max_inputs: default_max_inputs(),
            poll_interval_ms: default_poll_interval(),
            retry_delay_ms: default_retry_delay(),
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

fn default_max_inputs() -> usize {
    36
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_retry_delay() -> u64 {
    3000
}

fn default_health_check_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TRUSTED_GROUP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a TOML document
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let genesis = &self.genesis;
        if genesis.members.is_empty() {
            anyhow::bail!("Genesis has no members");
        }
        if genesis.threshold < 1 || usize::from(genesis.threshold) > genesis.members.len() {
            anyhow::bail!(
                "Invalid group threshold {}/{}",
                genesis.threshold,
                genesis.members.len()
            );
        }
        if !genesis.members.contains(&self.app.client_id) {
            anyhow::bail!("App {} does not belong to the group", self.app.client_id);
        }

        if self.ledger.api_urls.is_empty() {
            anyhow::bail!("No ledger API URLs configured");
        }

        let coordinator = &self.coordinator;
        if coordinator.drain_batch_size == 0
            || coordinator.action_batch_size == 0
            || coordinator.max_inputs == 0
        {
            anyhow::bail!("Coordinator batch sizes must be positive");
        }
        if coordinator.drain_batch_size < 2 {
            tracing::warn!("Drain batch size below 2 never detects a caught-up stream early");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid pattern");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
