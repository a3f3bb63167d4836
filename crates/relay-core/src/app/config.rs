//! Configuration loaded from TOML.
//!
//! Every section and field has a default, so an empty file is a valid config.
//!
//! ```toml
//! [connection]
//! endpoint = "memory://local"
//! queue = "relay-demo"
//!
//! [batch]
//! max_messages = 100
//! max_bytes = 262144
//!
//! [queue]
//! visibility_timeout_ms = 60000
//! max_delivery_count = 10   # 0 = never dead-letter
//!
//! [processor]
//! max_concurrent_calls = 1
//! receive_wait_ms = 1000
//! auto_complete = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::processor::ProcessorOptions;
use crate::domain::BatchLimits;
use crate::impls::QueueOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub connection: ConnectionConfig,
    pub batch: BatchConfig,
    pub queue: QueueConfig,
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// `memory://<namespace>` or `Endpoint=memory://<namespace>;...`
    pub endpoint: String,
    pub queue: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "memory://local".to_string(),
            queue: "relay-demo".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_messages: usize,
    pub max_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let limits = BatchLimits::default();
        Self {
            max_messages: limits.max_messages,
            max_bytes: limits.max_bytes,
        }
    }
}

impl BatchConfig {
    pub fn limits(&self) -> BatchLimits {
        BatchLimits::new(self.max_messages, self.max_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub visibility_timeout_ms: u64,
    pub max_delivery_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 60_000,
            max_delivery_count: 10,
        }
    }
}

impl QueueConfig {
    pub fn options(&self) -> QueueOptions {
        QueueOptions {
            visibility_timeout: Duration::from_millis(self.visibility_timeout_ms),
            max_delivery_count: (self.max_delivery_count > 0).then_some(self.max_delivery_count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub max_concurrent_calls: usize,
    /// Channel capacity between the receive pump and the workers.
    /// Defaults to `max_concurrent_calls`.
    pub prefetch: Option<usize>,
    pub receive_wait_ms: u64,
    pub auto_complete: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            prefetch: None,
            receive_wait_ms: 1_000,
            auto_complete: false,
        }
    }
}

impl ProcessorConfig {
    pub fn options(&self) -> ProcessorOptions {
        ProcessorOptions {
            max_concurrent_calls: self.max_concurrent_calls,
            prefetch: self.prefetch,
            receive_wait: Duration::from_millis(self.receive_wait_ms),
            auto_complete: self.auto_complete,
        }
    }
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.connection.queue.trim().is_empty() {
            return invalid("connection.queue must not be empty");
        }
        if self.batch.max_messages == 0 || self.batch.max_bytes == 0 {
            return invalid("batch limits must be positive");
        }
        if self.queue.visibility_timeout_ms == 0 {
            return invalid("queue.visibility_timeout_ms must be positive");
        }
        if self.processor.receive_wait_ms == 0 {
            return invalid("processor.receive_wait_ms must be positive");
        }
        if self.processor.max_concurrent_calls == 0 {
            return invalid("processor.max_concurrent_calls must be at least 1");
        }
        if self.processor.prefetch == Some(0) {
            return invalid("processor.prefetch must be at least 1 when set");
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RelayConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    RelayConfig::from_toml_str(&raw)
}
