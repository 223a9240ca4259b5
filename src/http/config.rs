//! HTTP client configuration.

use crate::balancer::BalancerConfig;
use crate::breaker::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Idle pooled connections are kept for at least this long.
pub const MIN_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport settings for one pooled HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpTransportConfig {
    /// TCP connect timeout
    #[serde(default = "default_dial_timeout", with = "crate::config::humantime_serde")]
    pub dial_timeout: Duration,

    /// Overall budget for one call, including reading the body
    #[serde(default = "default_timeout", with = "crate::config::humantime_serde")]
    pub timeout: Duration,

    /// How long an idle pooled connection is kept (minimum 10s)
    #[serde(default = "default_idle_conn_timeout", with = "crate::config::humantime_serde")]
    pub idle_conn_timeout: Duration,

    /// Idle connections kept per backend address
    #[serde(default = "default_max_idle_conns_per_addr")]
    pub max_idle_conns_per_addr: usize,

    /// Concurrent requests per backend address (0 = unlimited)
    #[serde(default)]
    pub max_conns_per_addr: usize,

    /// Set TCP_NODELAY on new connections
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
}

impl HttpTransportConfig {
    /// Idle timeout after clamping to [`MIN_IDLE_CONN_TIMEOUT`].
    pub fn effective_idle_timeout(&self) -> Duration {
        self.idle_conn_timeout.max(MIN_IDLE_CONN_TIMEOUT)
    }
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: default_dial_timeout(),
            timeout: default_timeout(),
            idle_conn_timeout: default_idle_conn_timeout(),
            max_idle_conns_per_addr: default_max_idle_conns_per_addr(),
            max_conns_per_addr: 0,
            tcp_nodelay: true,
        }
    }
}

/// Configuration for one balanced HTTP client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpClientConfig {
    /// Name the client is registered under
    pub service_name: String,

    /// Connection pool and timeout settings
    #[serde(default)]
    pub transport: HttpTransportConfig,

    /// Backend selection; required
    #[serde(default)]
    pub balancer: Option<BalancerConfig>,

    /// Circuit breaker settings; no breaker when absent
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
}

impl HttpClientConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            transport: HttpTransportConfig::default(),
            balancer: None,
            breaker: None,
        }
    }

    pub fn with_balancer(mut self, balancer: BalancerConfig) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn with_transport(mut self, transport: HttpTransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = Some(breaker);
        self
    }
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_conn_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_max_idle_conns_per_addr() -> usize {
    32
}

fn default_true() -> bool {
    true
}
