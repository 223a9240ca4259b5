//! Balanced HTTP client.
//!
//! An [`HttpClient`] pairs one pooled hyper-util client with one balancer:
//! every call picks a backend, composes the URL against it and runs the
//! exchange under the configured timeout. [`HttpClientManager`] keeps the
//! clients of an application keyed by service name.

mod client;
mod config;
mod manager;
mod request;

pub use client::HttpClient;
pub use config::{HttpClientConfig, HttpTransportConfig, MIN_IDLE_CONN_TIMEOUT};
pub use manager::HttpClientManager;
pub use request::{HttpRequest, HttpResponse};

use crate::balancer::BalancerError;
use crate::metrics::Outcome;
use thiserror::Error;

/// Errors returned by [`HttpClient`].
#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("client config has no balancer section")]
    BalancerNil,

    #[error(transparent)]
    Balancer(#[from] BalancerError),

    #[error("network error: {0}")]
    Network(#[source] hyper_util::client::legacy::Error),

    #[error("failed to read response body: {0}")]
    Body(#[source] hyper::Error),

    #[error("request deadline exceeded")]
    Timeout,

    #[error("http resp status: {status}, msg: {body}")]
    Protocol { status: u16, body: String },

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpClientError {
    pub(crate) fn outcome(&self) -> Outcome {
        match self {
            HttpClientError::Balancer(_) => Outcome::NoBackend,
            HttpClientError::Network(_) | HttpClientError::Body(_) => Outcome::NetworkError,
            HttpClientError::Timeout => Outcome::Timeout,
            HttpClientError::CircuitOpen => Outcome::BreakerOpen,
            HttpClientError::BalancerNil
            | HttpClientError::Protocol { .. }
            | HttpClientError::InvalidRequest(_) => Outcome::ProtocolError,
        }
    }
}

/// Errors returned by [`HttpClientManager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("service already exists: {0}")]
    ServiceAlreadyExists(String),

    #[error("service not exists: {0}")]
    ServiceNotExists(String),

    #[error("service '{0}' has no balancer section")]
    BalancerNil(String),

    #[error("failed to build client for '{service}': {source}")]
    Client {
        service: String,
        #[source]
        source: HttpClientError,
    },
}
