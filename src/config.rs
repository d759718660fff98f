use alloy::signers::local::PrivateKeySigner;
use clap::Parser;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;
use url::Url;

use crate::onchain::{EvmConfig, EvmCtx, EvmSecrets};
use crate::rebalancing::RebalanceConfig;
use crate::scheduler::{SchedulerConfig, SchedulerSettings};
use crate::store::configure_sqlite_pool;

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Path to TOML secrets file
    #[clap(long)]
    pub secrets: PathBuf,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    evm: EvmConfig,
    agent: AgentConfig,
    rebalancing: Option<RebalancingConfig>,
    scheduler: Option<SchedulerConfig>,
}

/// Secret credentials deserialized from the secrets TOML.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Secrets {
    evm: EvmSecrets,
    agent: AgentSecrets,
    operator_api_key: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentConfig {
    model: String,
    base_url: Option<Url>,
    max_retries: Option<usize>,
    temperature: Option<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentSecrets {
    api_key: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RebalancingConfig {
    threshold_bp: Option<u64>,
    min_confidence: Option<f64>,
    gas_limit: Option<u64>,
    max_decision_age_secs: Option<u64>,
}

// ===== Runtime types (assembled from Config + Secrets) =====

/// Reasoning-service settings.
#[derive(Clone)]
pub struct AgentCtx {
    pub(crate) base_url: Url,
    pub(crate) api_key: String,
    pub(crate) model: String,
    pub(crate) max_retries: usize,
    pub(crate) temperature: f64,
}

impl std::fmt::Debug for AgentCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCtx")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("max_retries", &self.max_retries)
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Combined runtime context for the server and CLI. Assembled from the
/// plaintext config and the secrets file.
#[derive(Clone)]
pub struct Ctx {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) evm: EvmCtx,
    pub(crate) agent: AgentCtx,
    pub(crate) rebalancing: RebalanceConfig,
    pub(crate) scheduler: SchedulerSettings,
    pub(crate) operator_api_key: String,
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("database_url", &self.database_url)
            .field("log_level", &self.log_level)
            .field("evm", &self.evm)
            .field("agent", &self.agent)
            .field("rebalancing", &self.rebalancing)
            .field("scheduler", &self.scheduler)
            .field("operator_api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("evm.vaults must list at least one vault")]
    NoVaults,
    #[error("rebalancing.threshold_bp must be within 0..=10000, got {0}")]
    InvalidThreshold(u64),
    #[error("rebalancing.min_confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f64),
    #[error("agent.temperature must be within [0, 2], got {0}")]
    InvalidTemperature(f64),
    #[error("invalid URL")]
    Url(#[from] url::ParseError),
    #[error("invalid evm.private_key")]
    InvalidPrivateKey(#[source] alloy::signers::k256::ecdsa::Error),
}

impl Ctx {
    pub fn load_files(config: &Path, secrets: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        let secrets_str = std::fs::read_to_string(secrets)?;
        Self::from_toml(&config_str, &secrets_str)
    }

    pub fn from_toml(config_toml: &str, secrets_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;
        let secrets: Secrets = toml::from_str(secrets_toml)?;

        if config.evm.vaults.is_empty() {
            return Err(ConfigError::NoVaults);
        }

        if let Some(private_key) = &secrets.evm.private_key {
            PrivateKeySigner::from_bytes(private_key).map_err(ConfigError::InvalidPrivateKey)?;
        }

        let evm = EvmCtx::new(config.evm, secrets.evm);
        let agent = assemble_agent(config.agent, secrets.agent)?;
        let rebalancing = assemble_rebalancing(config.rebalancing)?;
        let scheduler = config
            .scheduler
            .map(SchedulerSettings::from)
            .unwrap_or_default();

        Ok(Self {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or(LogLevel::Debug),
            evm,
            agent,
            rebalancing,
            scheduler,
            operator_api_key: secrets.operator_api_key,
        })
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }
}

fn assemble_agent(config: AgentConfig, secrets: AgentSecrets) -> Result<AgentCtx, ConfigError> {
    const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
    const DEFAULT_MAX_RETRIES: usize = 2;
    const DEFAULT_TEMPERATURE: f64 = 0.1;

    let temperature = config.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ConfigError::InvalidTemperature(temperature));
    }

    let base_url = match config.base_url {
        Some(url) => url,
        None => Url::parse(DEFAULT_BASE_URL)?,
    };

    Ok(AgentCtx {
        base_url,
        api_key: secrets.api_key,
        model: config.model,
        max_retries: config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        temperature,
    })
}

fn assemble_rebalancing(
    config: Option<RebalancingConfig>,
) -> Result<RebalanceConfig, ConfigError> {
    let defaults = RebalanceConfig::default();
    let Some(config) = config else {
        return Ok(defaults);
    };

    let threshold_bp = config.threshold_bp.unwrap_or(defaults.threshold_bp);
    if threshold_bp > 10_000 {
        return Err(ConfigError::InvalidThreshold(threshold_bp));
    }

    let min_confidence = config.min_confidence.unwrap_or(defaults.min_confidence);
    if !(0.0..=1.0).contains(&min_confidence) {
        return Err(ConfigError::InvalidConfidence(min_confidence));
    }

    Ok(RebalanceConfig {
        threshold_bp,
        min_confidence,
        gas_limit: config.gas_limit.unwrap_or(defaults.gas_limit),
        max_decision_age: config
            .max_decision_age_secs
            .map_or(defaults.max_decision_age, Duration::from_secs),
    })
}

/// Logs go to stderr so CLI output on stdout stays parseable.
pub fn setup_tracing(log_level: LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("vault_keeper={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}
