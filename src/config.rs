use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;

/// Port probing starts here when no advertise port is configured.
pub const DEFAULT_PORT: u16 = 9999;

/// Admin nodes mount their executor-facing API under this prefix.
pub const ADMIN_API_MOUNT: &str = "/jobs-api";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Comma-separated admin base URLs, e.g.
    /// "http://admin-a:8080,http://admin-b:8080".
    pub admin_addresses: String,
    /// Name this executor registers under; admins group executors by it.
    pub app_name: String,
    /// Address announced to admins. Auto-detected when empty.
    pub advertise_ip: String,
    /// Port the inbound endpoint binds to. 0 means probe from DEFAULT_PORT.
    pub advertise_port: u16,
    /// Shared secret carried by every inbound request. Empty disables the
    /// check (logged loudly at startup).
    pub access_token: String,
    /// Root directory for per-invocation job logs and the callback retry log.
    pub log_dir: String,
    /// Job log files older than this many days are swept. Values below 1
    /// disable the sweeper.
    pub log_retention_days: i64,
    pub heartbeat_interval_secs: u64,
    pub callback_retry_scan_secs: u64,
    /// Bound on every outbound admin call.
    pub request_timeout_secs: u64,
    pub structured_logging: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            admin_addresses: "http://127.0.0.1:8080".to_string(),
            app_name: "jobworks-executor-sample".to_string(),
            advertise_ip: String::new(),
            advertise_port: 0,
            access_token: String::new(),
            log_dir: "jobworks_logs".to_string(),
            log_retention_days: 30,
            heartbeat_interval_secs: 30,
            callback_retry_scan_secs: 30,
            request_timeout_secs: 10,
            structured_logging: false,
        }
    }
}

impl ExecutorConfig {
    /// Layered load: defaults, then the YAML file when given, then
    /// JOBWORKS_-prefixed environment variables on top.
    pub fn load(path: Option<&str>) -> Result<ExecutorConfig> {
        let mut figment = Figment::from(Serialized::defaults(ExecutorConfig::default()));
        if let Some(path) = path {
            let config_str = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path))?;
            figment = figment.merge(Yaml::string(&config_str));
        }
        let config: ExecutorConfig = figment.merge(Env::prefixed("JOBWORKS_")).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration as a YAML file, a starting point for
    /// a new deployment.
    pub fn generate(path: &Path) -> Result<()> {
        let config = ExecutorConfig::default();
        let text = serde_yaml::to_string(&config)?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write config file {:?}", path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.app_name.trim().is_empty() {
            return Err(ExecutorError::InvalidConfig(
                "app_name must not be empty".to_string(),
            ));
        }
        for address in self.admin_address_list() {
            reqwest::Url::parse(&address).map_err(|e| {
                ExecutorError::InvalidConfig(format!("invalid admin address {}: {}", address, e))
            })?;
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ExecutorError::InvalidConfig(
                "heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        if self.callback_retry_scan_secs == 0 {
            return Err(ExecutorError::InvalidConfig(
                "callback_retry_scan_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn admin_address_list(&self) -> Vec<String> {
        self.admin_addresses
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(|address| address.trim_end_matches('/').to_string())
            .collect()
    }

    /// Fill in the advertised ip and port when the operator left them unset.
    /// Runs once at startup, before anything announces the address.
    pub fn resolve_network(&mut self) -> Result<()> {
        if self.advertise_ip.trim().is_empty() {
            self.advertise_ip = jobworks_utils::local_ip().to_string();
        }
        if self.advertise_port == 0 {
            self.advertise_port = jobworks_utils::find_available_port(DEFAULT_PORT)?;
        }
        Ok(())
    }

    /// Socket the inbound endpoint binds to (all interfaces).
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("0.0.0.0:{}", self.advertise_port)
            .parse()
            .context("invalid listen address")
    }

    /// Base URL admins use to reach this executor.
    pub fn advertise_address(&self) -> String {
        format!("http://{}:{}", self.advertise_ip, self.advertise_port)
    }

    pub fn retry_dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir).join("callback-retry")
    }
}
