//! Engine configuration.

use crate::error::{ReplicatorError, ReplicatorResult};
use crate::resource::ResourceTypeDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Configuration for a replication engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicatorConfig {
    /// Identifier of the local cluster. Written into every mirror as the
    /// origin marker.
    pub cluster_id: String,

    /// Namespace scope for eligible local objects. `None` watches all
    /// namespaces.
    pub namespace: Option<String>,

    /// Namespace holding `PeerCluster` descriptors and their credential
    /// secrets.
    pub peer_namespace: String,

    /// Period of the full re-list that heals missed watch events.
    pub resync_interval_seconds: u64,

    /// Deadline for every create/update/delete against a peer.
    pub call_timeout_seconds: u64,

    /// Backoff for transient endpoint errors.
    pub retry: RetryConfig,

    /// Conflict retry on status writes.
    pub status_retry: StatusRetryConfig,

    /// Reconnect period for a degraded peer.
    pub degraded_retry_seconds: u64,

    /// Consecutive failed remote watch attempts before a peer is considered
    /// unusable.
    pub unreachable_threshold: u32,

    /// Statically registered resource types.
    pub resources: Vec<ResourceTypeDescriptor>,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

/// Read-modify-write retry on status conflicts. Fixed backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusRetryConfig {
    /// Attempts including the first write.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff_ms: u64,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            namespace: None,
            peer_namespace: "default".to_string(),
            resync_interval_seconds: 30,
            call_timeout_seconds: 10,
            retry: RetryConfig::default(),
            status_retry: StatusRetryConfig::default(),
            degraded_retry_seconds: 30,
            unreachable_threshold: 3,
            resources: Vec::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl Default for StatusRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 100,
        }
    }
}

impl ReplicatorConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ReplicatorConfigBuilder {
        ReplicatorConfigBuilder::default()
    }

    /// Load from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> ReplicatorResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse from YAML.
    pub fn from_yaml(raw: &str) -> ReplicatorResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    /// Resync period as a Duration.
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_seconds)
    }

    /// Per-call deadline as a Duration.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    /// Degraded reconnect period as a Duration.
    pub fn degraded_retry(&self) -> Duration {
        Duration::from_secs(self.degraded_retry_seconds)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster_id.trim().is_empty() {
            return Err("clusterId is required".to_string());
        }
        if self.peer_namespace.is_empty() {
            return Err("peerNamespace must not be empty".to_string());
        }
        if self.resync_interval_seconds == 0 {
            return Err("resyncIntervalSeconds must be > 0".to_string());
        }
        if self.call_timeout_seconds == 0 {
            return Err("callTimeoutSeconds must be > 0".to_string());
        }
        if self.degraded_retry_seconds == 0 {
            return Err("degradedRetrySeconds must be > 0".to_string());
        }
        if self.unreachable_threshold == 0 {
            return Err("unreachableThreshold must be > 0".to_string());
        }
        if self.retry.max_attempts == 0 || self.status_retry.max_attempts == 0 {
            return Err("maxAttempts must be >= 1".to_string());
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(format!(
                "retry.initialBackoffMs ({}) exceeds retry.maxBackoffMs ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            ));
        }

        let mut seen = HashSet::new();
        for rt in &self.resources {
            rt.validate()?;
            if !seen.insert(rt.id()) {
                return Err(format!("resource type {} is listed twice", rt.id()));
            }
        }

        Ok(())
    }

    /// Validate, converting the message into an engine error.
    pub fn check(&self) -> ReplicatorResult<()> {
        self.validate().map_err(ReplicatorError::InvalidConfig)
    }
}

/// Builder for ReplicatorConfig.
#[derive(Debug, Default)]
pub struct ReplicatorConfigBuilder {
    config: ReplicatorConfig,
}

impl ReplicatorConfigBuilder {
    /// Set the local cluster identifier.
    pub fn cluster_id(mut self, id: impl Into<String>) -> Self {
        self.config.cluster_id = id.into();
        self
    }

    /// Restrict local objects to one namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = Some(namespace.into());
        self
    }

    /// Set the namespace holding peering descriptors.
    pub fn peer_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.peer_namespace = namespace.into();
        self
    }

    /// Set the resync interval in seconds.
    pub fn resync_interval_seconds(mut self, secs: u64) -> Self {
        self.config.resync_interval_seconds = secs;
        self
    }

    /// Set the per-call timeout in seconds.
    pub fn call_timeout_seconds(mut self, secs: u64) -> Self {
        self.config.call_timeout_seconds = secs;
        self
    }

    /// Set transient retry settings.
    pub fn retry(mut self, max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        self.config.retry = RetryConfig {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
        };
        self
    }

    /// Set status conflict retry settings.
    pub fn status_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.config.status_retry = StatusRetryConfig {
            max_attempts,
            backoff_ms,
        };
        self
    }

    /// Set the degraded reconnect period in seconds.
    pub fn degraded_retry_seconds(mut self, secs: u64) -> Self {
        self.config.degraded_retry_seconds = secs;
        self
    }

    /// Set the remote watch failure threshold.
    pub fn unreachable_threshold(mut self, threshold: u32) -> Self {
        self.config.unreachable_threshold = threshold;
        self
    }

    /// Add a statically registered resource type.
    pub fn resource(mut self, rt: ResourceTypeDescriptor) -> Self {
        self.config.resources.push(rt);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ReplicatorConfig {
        self.config
    }
}
