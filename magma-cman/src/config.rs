use std::net::SocketAddr;
use std::time::Duration;

use config::{File, FileFormat, Source};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};

use crate::CMAN_CONFIG;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmanConfig {
    pub client: ClientConfig,
    pub lock: LockConfig,
    pub service: ServiceConfig,
}

impl CmanConfig {
    pub fn builder() -> CmanConfigBuilder {
        CmanConfigBuilder::default()
    }

    pub fn load_default() -> Result<Self> {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub addr: SocketAddr,
    pub node_name: String,
    pub votes: u32,
    pub connect_retries: u32,
    pub retry_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub notification_buffer: usize,
}

impl ClientConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub lockspace: String,
    pub lock_timeout_ms: u64,
    pub etcd_endpoints: Vec<String>,
    pub lease_ttl: i64,
    pub keep_alive_interval_ms: u64,
    pub try_lock_timeout_ms: u64,
}

impl LockConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn try_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.try_lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub listen: SocketAddr,
    pub expected_votes: u32,
}

#[derive(Debug)]
pub struct CmanConfigBuilder {
    builder: config::ConfigBuilder<DefaultState>,
}

impl Default for CmanConfigBuilder {
    fn default() -> Self {
        let builder = config::Config::builder()
            .add_source(File::from_str(CMAN_CONFIG, FileFormat::Toml));
        Self { builder }
    }
}

impl CmanConfigBuilder {
    pub fn add_source<T>(self, source: T) -> Result<Self> where T: Source + Send + Sync + 'static {
        Ok(Self { builder: self.builder.add_source(source) })
    }

    pub fn set_override<S>(self, key: &str, value: S) -> Result<Self> where S: Into<config::Value> {
        Ok(Self { builder: self.builder.set_override(key, value)? })
    }

    pub fn build(self) -> Result<CmanConfig> {
        let cman_config = self.builder.build()?.try_deserialize::<CmanConfig>()?;
        Ok(cman_config)
    }
}
