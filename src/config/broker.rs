//! Broker configuration structures.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::DispatcherConfig;
use crate::infra::transport::DEFAULT_MAX_LINE_BYTES;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "TIME_BROKER_CONFIG";
/// Comma-separated submission listener addresses.
pub const SUBMISSION_ADDRS_ENV: &str = "TIME_BROKER_SUBMISSION_ADDRS";
/// Comma-separated response listener addresses.
pub const RESPONSE_ADDRS_ENV: &str = "TIME_BROKER_RESPONSE_ADDRS";
/// Default final receiver for submissions that name none.
pub const DEFAULT_RECEIVER_ENV: &str = "TIME_BROKER_DEFAULT_RECEIVER";

const fn default_max_poll_interval_ms() -> u64 {
    1_000
}

const fn default_min_poll_interval_ms() -> u64 {
    1
}

const fn default_wake_queue_capacity() -> usize {
    10
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_retry_backoff_ms() -> u64 {
    50
}

const fn default_response_grace_ms() -> u64 {
    30_000
}

const fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

/// A remote model known to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Address calls are sent to.
    pub endpoint: String,
    /// Attributes attached to every call of this model.
    #[serde(default)]
    pub attributes: HashMap<String, i64>,
}

/// Root broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Addresses accepting pipeline submissions.
    pub submission_addrs: Vec<String>,
    /// Addresses accepting model responses.
    pub response_addrs: Vec<String>,
    /// Longest sleep of a watch task, in milliseconds.
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    /// Shortest sleep of a watch task, in milliseconds.
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,
    /// Capacity of the dispatcher's wake queue.
    #[serde(default = "default_wake_queue_capacity")]
    pub wake_queue_capacity: usize,
    /// Outbound connect timeout, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Extra attempts for a failed model call.
    #[serde(default)]
    pub send_retries: u32,
    /// Pause between model call attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long past a pipeline's deadline its messages await responses, in
    /// milliseconds.
    #[serde(default = "default_response_grace_ms")]
    pub response_grace_ms: u64,
    /// Longest accepted line on a listener connection, in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Runtime worker threads.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Model registry: name to endpoint and attributes.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    /// Receiver used when a submission names none.
    #[serde(default)]
    pub default_receiver: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            submission_addrs: vec!["127.0.0.1:8000".into()],
            response_addrs: vec!["127.0.0.1:8001".into()],
            max_poll_interval_ms: default_max_poll_interval_ms(),
            min_poll_interval_ms: default_min_poll_interval_ms(),
            wake_queue_capacity: default_wake_queue_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            response_grace_ms: default_response_grace_ms(),
            max_line_bytes: default_max_line_bytes(),
            worker_threads: default_worker_threads(),
            models: HashMap::new(),
            default_receiver: None,
        }
    }
}

impl BrokerConfig {
    /// Validate listener addresses, timing and registry values.
    pub fn validate(&self) -> Result<(), String> {
        if self.submission_addrs.is_empty() {
            return Err("at least one submission address must be configured".into());
        }
        if self.response_addrs.is_empty() {
            return Err("at least one response address must be configured".into());
        }
        if let Some(addr) = self
            .submission_addrs
            .iter()
            .chain(&self.response_addrs)
            .find(|a| a.trim().is_empty())
        {
            return Err(format!("listener address `{addr}` is empty"));
        }
        if self.min_poll_interval_ms == 0 {
            return Err("min_poll_interval_ms must be greater than 0".into());
        }
        if self.min_poll_interval_ms > self.max_poll_interval_ms {
            return Err("min_poll_interval_ms must not exceed max_poll_interval_ms".into());
        }
        if self.wake_queue_capacity == 0 {
            return Err("wake_queue_capacity must be greater than 0".into());
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than 0".into());
        }
        if self.max_line_bytes == 0 {
            return Err("max_line_bytes must be greater than 0".into());
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be greater than 0".into());
        }
        for (name, model) in &self.models {
            if model.endpoint.trim().is_empty() {
                return Err(format!("model `{name}` has no endpoint"));
            }
        }
        Ok(())
    }

    /// Parse broker configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::from_json_str(&input)
    }

    /// Load from the environment: the file named by `TIME_BROKER_CONFIG` if
    /// set, otherwise defaults overridden by the address variables.
    pub fn from_env() -> Result<Self, String> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(path);
        }

        let mut cfg = Self::default();
        if let Ok(addrs) = std::env::var(SUBMISSION_ADDRS_ENV) {
            cfg.submission_addrs = split_addrs(&addrs);
        }
        if let Ok(addrs) = std::env::var(RESPONSE_ADDRS_ENV) {
            cfg.response_addrs = split_addrs(&addrs);
        }
        if let Ok(receiver) = std::env::var(DEFAULT_RECEIVER_ENV) {
            cfg.default_receiver = Some(receiver);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Dispatcher timing derived from this configuration.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_poll_interval: Duration::from_millis(self.max_poll_interval_ms),
            min_poll_interval: Duration::from_millis(self.min_poll_interval_ms),
            wake_queue_capacity: self.wake_queue_capacity,
            response_grace: Duration::from_millis(self.response_grace_ms),
            sweep_interval: Duration::from_millis(self.max_poll_interval_ms),
        }
    }

    /// Outbound connect timeout.
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Pause between model call attempts.
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn split_addrs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect()
}
