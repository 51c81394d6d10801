//! Server configuration: one JSON document, with environment-variable
//! overrides for selected numeric fields.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::quota::QuotaConfig;
use crate::replication::RetentionPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub ports: Vec<PortConfig>,
    pub tls: Option<TlsConfig>,
    pub num_repository_workers: usize,
    /// Caffeine-style spec, e.g. `maximumWeight=134217728,expireAfterAccess=5m`.
    pub repository_cache_spec: String,
    pub replication: ReplicationConfig,
    pub graceful_shutdown_timeout: ShutdownTimeout,
    pub write_quota_per_repository: Option<QuotaConfig>,
    pub purge_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            data_dir: PathBuf::from("./data"),
            ports: vec![PortConfig::default()],
            tls: None,
            num_repository_workers: 16,
            repository_cache_spec: "maximumWeight=134217728,expireAfterAccess=5m".to_string(),
            replication: ReplicationConfig::default(),
            graceful_shutdown_timeout: ShutdownTimeout::default(),
            write_quota_per_repository: None,
            purge_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortConfig {
    pub port: u16,
    pub protocol: Protocol,
}

impl Default for PortConfig {
    fn default() -> PortConfig {
        PortConfig {
            port: 36462,
            protocol: Protocol::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub key_cert_chain_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMethod {
    None,
    Zookeeper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicationConfig {
    pub method: ReplicationMethod,
    /// Consensus service connection string, required for `ZOOKEEPER`.
    pub connection_string: Option<String>,
    pub path_prefix: Option<String>,
    pub timeout_millis: u64,
    pub max_log_count: u64,
    pub min_log_age_millis: i64,
}

impl Default for ReplicationConfig {
    fn default() -> ReplicationConfig {
        ReplicationConfig {
            method: ReplicationMethod::None,
            connection_string: None,
            path_prefix: None,
            timeout_millis: 10_000,
            max_log_count: 1024,
            min_log_age_millis: 3_600_000,
        }
    }
}

impl ReplicationConfig {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_log_count: self.max_log_count,
            min_log_age_millis: self.min_log_age_millis,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownTimeout {
    pub quiet_period_millis: u64,
    pub timeout_millis: u64,
}

impl Default for ShutdownTimeout {
    fn default() -> ShutdownTimeout {
        ShutdownTimeout {
            quiet_period_millis: 1_000,
            timeout_millis: 10_000,
        }
    }
}

/// Parsed repository cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSpec {
    pub maximum_weight: u64,
    pub expire_after_access: Duration,
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<ServerConfig> {
        let bytes = fs::read(path)?;
        let mut config: ServerConfig = serde_json::from_slice(&bytes)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override selected numeric fields.
    pub fn apply_env_overrides(&mut self) {
        override_num(
            "CENTRALDOGMA_NUM_REPOSITORY_WORKERS",
            &mut self.num_repository_workers,
        );
        override_num("CENTRALDOGMA_MAX_LOG_COUNT", &mut self.replication.max_log_count);
        override_num(
            "CENTRALDOGMA_MIN_LOG_AGE_MILLIS",
            &mut self.replication.min_log_age_millis,
        );
        override_num("CENTRALDOGMA_PURGE_INTERVAL_SECONDS", &mut self.purge_interval_seconds);
        if let Some(first) = self.ports.first_mut() {
            override_num("CENTRALDOGMA_PORT", &mut first.port);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::InvalidInput("at least one port is required".to_string()));
        }
        if self.num_repository_workers == 0 {
            return Err(Error::InvalidInput(
                "numRepositoryWorkers must be positive".to_string(),
            ));
        }
        if self.replication.method == ReplicationMethod::Zookeeper
            && self.replication.connection_string.is_none()
        {
            return Err(Error::InvalidInput(
                "ZOOKEEPER replication requires a connectionString".to_string(),
            ));
        }
        self.cache_spec()?;
        Ok(())
    }

    pub fn cache_spec(&self) -> Result<CacheSpec> {
        parse_cache_spec(&self.repository_cache_spec)
    }
}

fn override_num<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = env::var(name) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(name, value = %value, "ignoring unparsable override"),
        }
    }
}

fn parse_cache_spec(spec: &str) -> Result<CacheSpec> {
    let mut maximum_weight = 128 * 1024 * 1024;
    let mut expire_after_access = Duration::from_secs(300);
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| Error::InvalidInput(format!("invalid cache spec: {}", spec)))?;
        match key {
            "maximumWeight" => {
                maximum_weight = value
                    .parse()
                    .map_err(|_| Error::InvalidInput(format!("invalid cache spec: {}", spec)))?;
            }
            "expireAfterAccess" => {
                expire_after_access = parse_duration(value)
                    .ok_or_else(|| Error::InvalidInput(format!("invalid cache spec: {}", spec)))?;
            }
            _ => {
                return Err(Error::InvalidInput(format!(
                    "unsupported cache spec key: {}",
                    key
                )))
            }
        }
    }
    Ok(CacheSpec {
        maximum_weight,
        expire_after_access,
    })
}

fn parse_duration(value: &str) -> Option<Duration> {
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = value.split_at(split);
    let num: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(num)),
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        "d" => Some(Duration::from_secs(num * 86_400)),
        _ => None,
    }
}
