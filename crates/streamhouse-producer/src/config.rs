//! Producer configuration.
//!
//! `ProducerConfig` is a plain value threaded through every constructor. It can
//! be built in code, through [`crate::ProducerBuilder`], or read from TOML:
//!
//! ```toml
//! client_id = "billing"
//! batch_size = 65536
//! linger_ms = 5
//! acks = "all"
//! ```
//!
//! Fields missing from the file keep their defaults.

use crate::error::{ProducerError, Result};
use crate::retry::{ExpiryPolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Acknowledgement level requested from the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget. Batches complete as soon as the request is written.
    None,
    /// Wait for the partition leader.
    Leader,
    /// Wait for the full in-sync replica set.
    All,
}

impl Acks {
    /// Wire value of the `acks` field.
    pub fn as_i16(&self) -> i16 {
        match self {
            Acks::None => 0,
            Acks::Leader => 1,
            Acks::All => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Identifies this producer in destination logs
    pub client_id: String,

    /// Soft upper bound on bytes per batch, also the pooled buffer size
    pub batch_size: usize,

    /// Total bytes available for buffered records
    pub buffer_memory: usize,

    /// How long a non-full batch waits for more records
    pub linger_ms: u64,

    /// How long `send` may block waiting for buffer memory
    pub max_block_ms: u64,

    /// Upper bound on bytes per request, and on a single record
    pub max_request_size: usize,

    /// Destination-side timeout for a request
    pub request_timeout_ms: u64,

    /// Expiry window for full batches, defaults to the request timeout
    pub full_batch_expiry_ms: Option<u64>,

    /// Expiry window for batches that were never sent, defaults to the request timeout
    pub unsent_batch_expiry_ms: Option<u64>,

    /// Times a batch may be resent after a retriable failure
    pub retries: u32,

    pub retry_backoff_ms: u64,

    pub retry_backoff_max_ms: u64,

    pub retry_backoff_multiplier: f64,

    /// Spread retry backoff by ±25%
    pub retry_jitter: bool,

    pub acks: Acks,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_id: "streamhouse-producer".to_string(),
            batch_size: 16 * 1024,
            buffer_memory: 32 * 1024 * 1024,
            linger_ms: 0,
            max_block_ms: 60_000,
            max_request_size: 1024 * 1024,
            request_timeout_ms: 30_000,
            full_batch_expiry_ms: None,
            unsent_batch_expiry_ms: None,
            retries: 3,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 1000,
            retry_backoff_multiplier: 2.0,
            retry_jitter: false,
            acks: Acks::Leader,
        }
    }
}

impl ProducerConfig {
    /// Parse a TOML document and validate the result.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ProducerConfig = toml::from_str(contents)
            .map_err(|e| ProducerError::ConfigError(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProducerError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ProducerError::ConfigError(format!("cannot serialize config: {}", e)))
    }

    /// Reject settings the accumulator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ProducerError::ConfigError(
                "batch_size must be greater than zero".into(),
            ));
        }
        if self.buffer_memory < self.batch_size {
            return Err(ProducerError::ConfigError(format!(
                "buffer_memory ({}) must be at least batch_size ({})",
                self.buffer_memory, self.batch_size
            )));
        }
        if self.max_request_size == 0 {
            return Err(ProducerError::ConfigError(
                "max_request_size must be greater than zero".into(),
            ));
        }
        if self.retry_backoff_multiplier.is_nan() || self.retry_backoff_multiplier <= 0.0 {
            return Err(ProducerError::ConfigError(
                "retry_backoff_multiplier must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn max_block(&self) -> Duration {
        Duration::from_millis(self.max_block_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Largest record `send` accepts.
    pub fn max_record_size(&self) -> usize {
        self.max_request_size.min(self.buffer_memory)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_backoff_max_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
            jitter: self.retry_jitter,
        }
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        let request_timeout = self.request_timeout_ms;
        ExpiryPolicy {
            full_batch_timeout: Duration::from_millis(
                self.full_batch_expiry_ms.unwrap_or(request_timeout),
            ),
            unsent_batch_timeout: Duration::from_millis(
                self.unsent_batch_expiry_ms.unwrap_or(request_timeout),
            ),
        }
    }
}
