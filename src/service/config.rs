extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::DEFAULT_POLL_CAPACITY;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    /// Event capacity of one reactor poll batch.
    pub poll_capacity: usize,
    /// Seconds a connection may sit idle before its TIMEOUT event is
    /// delivered. Zero disables the idle timeout.
    pub connection_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> NetworkConfig {
        NetworkConfig {
            poll_capacity: DEFAULT_POLL_CAPACITY,
            connection_timeout_secs: 0,
        }
    }
}

impl NetworkConfig {
    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_secs > 0)
            .then(|| Duration::from_secs(self.connection_timeout_secs))
    }
}

/// The `[tls]` section. Certificate and key paths make the hub a TLS
/// server; a CA bundle plus server name make outbound connections TLS
/// clients. Empty strings and absent keys mean "not configured".
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
    pub server_name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct HubConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    pub tls: Option<TlsConfig>,
}

impl HubConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<HubConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let hub_config: HubConfig = config.try_deserialize()?;

        Ok(hub_config)
    }
}
