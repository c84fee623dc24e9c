//! Centralized configuration for pipehub.
//!
//! Compile-time defaults live as associated constants on unit structs; the
//! runtime-overridable subset is collected in [`RelayConfig`], which can be
//! loaded from a JSON file by the host binary.

use crate::retry::RetryConfig;
use crate::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Transport-level limits and timings.
pub struct TransportConfig;

impl TransportConfig {
    pub const DEFAULT_ENDPOINT_NAME: &'static str = "pipehub";
    /// Largest payload a single frame may carry.
    pub const READ_BUFFER_SIZE: usize = 1024;
    /// Extra room a relayed frame needs for the "Broadcast from ..." prefix.
    pub const ENVELOPE_OVERHEAD: usize = 128;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);
    pub const PROBE_TIMEOUT: Duration = Duration::from_millis(250);
    pub const RUNTIME_DIR_NAME: &'static str = "pipehub";
}

/// Election lock names and reconnect policy.
pub struct ElectionConfig;

impl ElectionConfig {
    pub const INSTANCE_LOCK_NAME: &'static str = "pipehub-instance";
    pub const ARBITER_LOCK_NAME: &'static str = "pipehub-arbiter";
    pub const RECONNECT_ATTEMPTS: u32 = 5;
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(200);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(3);
}

/// Hub-side sizing.
pub struct HubConfig;

impl HubConfig {
    /// Frames queued per peer before further frames to that peer are dropped.
    pub const PEER_QUEUE_DEPTH: usize = 64;
    pub const COMMAND_QUEUE_DEPTH: usize = 256;
    /// Pause after a failed accept before listening again.
    pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
    /// How long a stopping hub waits for peer transports to close.
    pub const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
    /// In-process pipe capacity for the hub's own console session.
    pub const LOCAL_PIPE_CAPACITY: usize = 64 * 1024;
    /// Case-insensitive sentinel that ends a client's sending side.
    pub const EXIT_COMMAND: &'static str = "exit";
}

/// Runtime configuration shared by every component of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Endpoint name; hub and clients must agree on it.
    pub endpoint_name: String,
    /// Directory for sockets and lock files. `None` uses the platform default.
    pub runtime_dir: Option<PathBuf>,
    pub instance_lock: String,
    pub arbiter_lock: String,
    pub connect_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_jitter: bool,
    pub peer_queue_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint_name: TransportConfig::DEFAULT_ENDPOINT_NAME.to_string(),
            runtime_dir: None,
            instance_lock: ElectionConfig::INSTANCE_LOCK_NAME.to_string(),
            arbiter_lock: ElectionConfig::ARBITER_LOCK_NAME.to_string(),
            connect_timeout_ms: TransportConfig::CONNECT_TIMEOUT.as_millis() as u64,
            reconnect_attempts: ElectionConfig::RECONNECT_ATTEMPTS,
            reconnect_base_delay_ms: ElectionConfig::RECONNECT_BASE_DELAY.as_millis() as u64,
            reconnect_max_delay_ms: ElectionConfig::RECONNECT_MAX_DELAY.as_millis() as u64,
            reconnect_jitter: true,
            peer_queue_depth: HubConfig::PEER_QUEUE_DEPTH,
        }
    }
}

impl RelayConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).map_err(|e| RelayError::io_with_path(e, path))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the endpoint name.
    pub fn with_endpoint_name(mut self, name: impl Into<String>) -> Self {
        self.endpoint_name = name.into();
        self
    }

    /// Place sockets and lock files under `dir` instead of the platform default.
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    /// Set the client connect window.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the reconnect policy used after losing the arbiter race.
    pub fn with_reconnect(mut self, retry: &RetryConfig) -> Self {
        self.reconnect_attempts = retry.max_attempts;
        self.reconnect_base_delay_ms = retry.base_delay.as_millis() as u64;
        self.reconnect_max_delay_ms = retry.max_delay.as_millis() as u64;
        self.reconnect_jitter = retry.jitter;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect policy as a [`RetryConfig`].
    pub fn reconnect_policy(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.reconnect_attempts)
            .with_base_delay(Duration::from_millis(self.reconnect_base_delay_ms))
            .with_max_delay(Duration::from_millis(self.reconnect_max_delay_ms))
            .with_jitter(self.reconnect_jitter)
    }

    /// Reject values that would make the election misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_name.trim().is_empty() {
            return Err(RelayError::Config {
                message: "endpoint_name must not be empty".to_string(),
            });
        }
        if self.instance_lock == self.arbiter_lock {
            return Err(RelayError::Config {
                message: format!(
                    "instance_lock and arbiter_lock must differ (both are {:?})",
                    self.instance_lock
                ),
            });
        }
        if self.reconnect_attempts == 0 {
            return Err(RelayError::Config {
                message: "reconnect_attempts must be at least 1".to_string(),
            });
        }
        if self.peer_queue_depth == 0 {
            return Err(RelayError::Config {
                message: "peer_queue_depth must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
