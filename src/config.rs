//! Agent configuration: defaults, optional YAML file, environment overrides.
//!
//! Only non-secret settings live here. The database connection string and
//! the bearer token come from their own collaborators (`DsnResolver`,
//! `TokenProvider`) and are never written back to a config file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Default number of concurrent SQL workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default capacity of the task and event channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default in-memory lifetime of the bearer token (20 minutes).
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 20 * 60;

/// Default gRPC connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

const ENV_PREFIX: &str = "SEED_AGENT_";

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Seeding service address (`host[:port]` or full URL).
    pub grpc_address: Option<String>,
    /// Number of concurrent SQL workers.
    pub concurrency: usize,
    /// Capacity of the bounded task/event channels.
    pub channel_capacity: usize,
    /// How long the bearer token is trusted after connect.
    pub token_ttl_secs: u64,
    pub connect_timeout_secs: u64,
    /// Pool size for the target database; `None` means `concurrency + 1`.
    pub max_db_connections: Option<u32>,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            grpc_address: None,
            concurrency: DEFAULT_CONCURRENCY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_db_connections: None,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load from a YAML file. Missing keys keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Build the effective configuration: defaults, then the optional file,
    /// then `.env`, then `SEED_AGENT_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };

        // A missing .env file is the common case.
        let _ = dotenvy::dotenv();

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Split out from `load` so tests
    /// don't have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = var("GRPC_ADDRESS") {
            self.grpc_address = Some(v);
        }
        if let Some(v) = var("CONCURRENCY") {
            self.concurrency = parse_number("CONCURRENCY", &v)?;
        }
        if let Some(v) = var("CHANNEL_CAPACITY") {
            self.channel_capacity = parse_number("CHANNEL_CAPACITY", &v)?;
        }
        if let Some(v) = var("TOKEN_TTL_SECS") {
            self.token_ttl_secs = parse_number("TOKEN_TTL_SECS", &v)?;
        }
        if let Some(v) = var("CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = parse_number("CONNECT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("MAX_DB_CONNECTIONS") {
            self.max_db_connections = Some(parse_number("MAX_DB_CONNECTIONS", &v)?);
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(AgentError::config("concurrency must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(AgentError::config("channel_capacity must be at least 1"));
        }
        if self.token_ttl_secs == 0 {
            return Err(AgentError::config("token_ttl_secs must be positive"));
        }
        if matches!(self.max_db_connections, Some(0)) {
            return Err(AgentError::config("max_db_connections must be at least 1"));
        }
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn db_pool_size(&self) -> u32 {
        self.max_db_connections
            .unwrap_or_else(|| u32::try_from(self.concurrency + 1).unwrap_or(u32::MAX))
    }

    /// The configured service address, or a config error if none was given.
    pub fn require_address(&self) -> Result<&str> {
        self.grpc_address
            .as_deref()
            .ok_or_else(|| AgentError::config("no seeding service address configured"))
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| AgentError::config(format!("{ENV_PREFIX}{name}: invalid number '{value}'")))
}
