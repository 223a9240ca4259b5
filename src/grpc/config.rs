//! gRPC client configuration.

use super::PickerPolicy;
use crate::breaker::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default send/receive message size limit (32 MiB).
pub const DEFAULT_MAX_MSG_SIZE: usize = 32 * 1024 * 1024;

/// Default HTTP/2 stream and connection window (1 GiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 1024 * 1024 * 1024;

/// Configuration for one balanced gRPC client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GrpcClientConfig {
    /// Name used in logs and metrics
    pub service_name: String,

    /// Dial target: `list://...`, `file://...` or a single address
    pub target: String,

    /// Pick policy among READY subchannels
    #[serde(default)]
    pub policy: PickerPolicy,

    /// Wait for the first READY subchannel before returning from connect
    #[serde(default)]
    pub dial_block: bool,

    /// Per-subchannel connect timeout, and the wait bound when `dial_block` is set
    #[serde(default = "default_dial_timeout", with = "crate::config::humantime_serde")]
    pub dial_timeout: Duration,

    /// Independent connections to the target, used in turn
    #[serde(default = "default_conn_pool_size")]
    pub conn_pool_size: usize,

    /// Largest encoded request accepted
    #[serde(default = "default_max_msg_size")]
    pub max_send_msg_size: usize,

    /// Largest decoded response accepted
    #[serde(default = "default_max_msg_size")]
    pub max_recv_msg_size: usize,

    /// Initial HTTP/2 stream and connection window
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Circuit breaker wrapped around every call
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl GrpcClientConfig {
    pub fn new(service_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            target: target.into(),
            policy: PickerPolicy::default(),
            dial_block: false,
            dial_timeout: default_dial_timeout(),
            conn_pool_size: default_conn_pool_size(),
            max_send_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_recv_msg_size: DEFAULT_MAX_MSG_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            breaker: BreakerConfig::default(),
        }
    }

    pub fn with_policy(mut self, policy: PickerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_dial_block(mut self, dial_timeout: Duration) -> Self {
        self.dial_block = true;
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_conn_pool_size(mut self, size: usize) -> Self {
        self.conn_pool_size = size;
        self
    }
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_conn_pool_size() -> usize {
    1
}

fn default_max_msg_size() -> usize {
    DEFAULT_MAX_MSG_SIZE
}

fn default_window_size() -> u32 {
    DEFAULT_WINDOW_SIZE
}
