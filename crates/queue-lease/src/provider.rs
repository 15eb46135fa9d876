//! Provider types and configuration.
//!
//! A [`QueueConfig`] names its provider with a plain string tag so that it can
//! be read from files and environment variables; the tag is resolved to a
//! [`ProviderType`] when a consumer or producer is constructed.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
///
/// `QUEUE_LEASE__HEARTBEAT__INTERVAL_SECONDS=5` sets `heartbeat.interval_seconds`.
pub const ENV_PREFIX: &str = "QUEUE_LEASE";

/// Heartbeat interval value that disables lease keepalive
pub const HEARTBEAT_DISABLED: i32 = -1;

/// Default number of concurrent heartbeat fires
pub const DEFAULT_HEARTBEAT_POOL_SIZE: usize = 2;

/// Default queue-level visibility timeout of the in-memory provider
pub const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: u32 = 30;

/// Maximum batch size of a single SQS receive call
pub const SQS_MAX_BATCH_SIZE: u32 = 10;

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    AwsSqs,
    InMemory,
}

impl ProviderType {
    /// Canonical configuration tag for the provider
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AwsSqs => "sqs",
            Self::InMemory => "in-memory",
        }
    }

    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::AwsSqs => 256 * 1024,         // 256KB
            Self::InMemory => 10 * 1024 * 1024, // 10MB
        }
    }

    /// Get maximum number of messages returned by one receive call
    pub fn max_batch_size(&self) -> u32 {
        match self {
            Self::AwsSqs => SQS_MAX_BATCH_SIZE,
            Self::InMemory => 100,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for ProviderType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqs" | "aws-sqs" | "awssqs" => Ok(Self::AwsSqs),
            "in-memory" | "memory" | "inmemory" => Ok(Self::InMemory),
            _ => Err(ConfigurationError::UnsupportedProvider {
                provider: s.to_string(),
                message: "expected one of: sqs, in-memory".to_string(),
            }),
        }
    }
}

// ============================================================================
// Heartbeat and Receive Settings
// ============================================================================

/// Lease keepalive settings of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeats; zero or negative disables keepalive
    pub interval_seconds: i32,
    /// Number of heartbeat fires that may run at the same time
    pub worker_pool_size: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: HEARTBEAT_DISABLED,
            worker_pool_size: DEFAULT_HEARTBEAT_POOL_SIZE,
        }
    }
}

impl HeartbeatConfig {
    /// Create heartbeat settings
    pub fn new(interval_seconds: i32, worker_pool_size: usize) -> Self {
        Self {
            interval_seconds,
            worker_pool_size,
        }
    }

    /// Heartbeat every `interval_seconds` with the default pool size
    pub fn every(interval_seconds: i32) -> Self {
        Self {
            interval_seconds,
            ..Self::default()
        }
    }

    /// Keepalive turned off
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Check whether keepalive is turned on
    pub fn is_enabled(&self) -> bool {
        self.interval_seconds > 0
    }

    /// Time between two heartbeats, if enabled
    pub fn interval(&self) -> Option<Duration> {
        self.is_enabled()
            .then(|| Duration::from_secs(self.interval_seconds as u64))
    }

    /// Visibility timeout requested by each heartbeat: two full intervals
    pub fn extension_seconds(&self) -> Option<u32> {
        self.is_enabled()
            .then(|| (self.interval_seconds as u32).saturating_mul(2))
    }
}

/// Receive call settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Maximum number of messages returned by one receive call
    pub max_messages: u32,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self { max_messages: 1 }
    }
}

// ============================================================================
// Queue Configuration
// ============================================================================

/// Configuration for consumer and producer construction
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Provider tag, resolved with [`ProviderType::from_str`]
    pub provider: String,
    /// Queue URL (SQS) or queue name (in-memory)
    pub queue_url: String,
    pub region: String,
    /// Endpoint override, e.g. a LocalStack URL
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Queue-level visibility timeout, used by providers that own their queue
    pub visibility_timeout_seconds: u32,
    pub receive: ReceiveConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: ProviderType::AwsSqs.tag().to_string(),
            queue_url: String::new(),
            region: String::new(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            visibility_timeout_seconds: DEFAULT_VISIBILITY_TIMEOUT_SECONDS,
            receive: ReceiveConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("provider", &self.provider)
            .field("queue_url", &self.queue_url)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "visibility_timeout_seconds",
                &self.visibility_timeout_seconds,
            )
            .field("receive", &self.receive)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl QueueConfig {
    /// Configuration for an SQS queue
    pub fn sqs(queue_url: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            provider: ProviderType::AwsSqs.tag().to_string(),
            queue_url: queue_url.into(),
            region: region.into(),
            ..Self::default()
        }
    }

    /// Configuration for a named in-memory queue
    pub fn in_memory(queue_name: impl Into<String>) -> Self {
        Self {
            provider: ProviderType::InMemory.tag().to_string(),
            queue_url: queue_name.into(),
            ..Self::default()
        }
    }

    /// Override the provider endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Use static credentials instead of the environment
    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    /// Set the receive batch size
    pub fn with_max_messages(mut self, max_messages: u32) -> Self {
        self.receive.max_messages = max_messages;
        self
    }

    /// Set the lease keepalive settings
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the queue-level visibility timeout
    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout_seconds = seconds;
        self
    }

    /// Resolve the provider tag
    pub fn provider_type(&self) -> Result<ProviderType, ConfigurationError> {
        self.provider.parse()
    }

    /// Endpoint override, treating an empty string as absent
    pub fn endpoint_override(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    /// Check mandatory settings and resolve the provider
    pub fn validate(&self) -> Result<ProviderType, ConfigurationError> {
        let provider_type = self.provider_type()?;

        if self.queue_url.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "queue_url".to_string(),
            });
        }

        if provider_type == ProviderType::AwsSqs && self.region.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "region".to_string(),
            });
        }

        let max_batch = provider_type.max_batch_size();
        if self.receive.max_messages == 0 || self.receive.max_messages > max_batch {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "receive.max_messages must be between 1 and {} for {}",
                    max_batch, provider_type
                ),
            });
        }

        if self.heartbeat.worker_pool_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "heartbeat.worker_pool_size must be at least 1".to_string(),
            });
        }

        Ok(provider_type)
    }

    /// Load configuration from defaults, an optional file and the environment
    ///
    /// Later sources override earlier ones. The file format follows its
    /// extension (`.toml`, `.yaml`, `.json`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
