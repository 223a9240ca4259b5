//! Client-side balanced gRPC.
//!
//! Targets resolve to address sets ([`resolver`]), each address becomes a
//! subchannel, and a [`picker`] chooses among READY subchannels per call.
//! [`GrpcClient`] pools several [`GrpcConn`]s to the same target.

mod client;
mod config;
mod conn;
pub mod picker;
pub mod resolver;

pub use client::{GrpcClient, GrpcClientBuilder};
pub use config::{GrpcClientConfig, DEFAULT_MAX_MSG_SIZE, DEFAULT_WINDOW_SIZE};
pub use conn::{ConnectivityState, GrpcConn};
pub use picker::{Picker, PickerBuilder, PickerPolicy, SubConn};
pub use resolver::{FileResolver, ListResolver, Resolver, ResolverError, ResolverSink, Target};

use crate::metrics::Outcome;
use std::time::Duration;
use thiserror::Error;
use tonic::Code;

/// Errors returned by balanced gRPC calls.
#[derive(Debug, Error)]
pub enum GrpcError {
    #[error("resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("no subconn available")]
    NoSubConnAvailable,

    #[error("no subconn ready within {0:?}")]
    DialTimeout(Duration),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("invalid method path {0}")]
    InvalidPath(String),

    #[error("grpc status: {0}")]
    Status(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("connection closed")]
    Closed,
}

impl GrpcError {
    pub(crate) fn outcome(&self) -> Outcome {
        match self {
            GrpcError::Status(status) => match status.code() {
                Code::DeadlineExceeded => Outcome::Timeout,
                Code::Unavailable => Outcome::NetworkError,
                _ => Outcome::ProtocolError,
            },
            GrpcError::Transport(_) => Outcome::NetworkError,
            GrpcError::NoSubConnAvailable => Outcome::NoBackend,
            GrpcError::DialTimeout(_) => Outcome::Timeout,
            GrpcError::CircuitOpen => Outcome::BreakerOpen,
            GrpcError::Resolver(_) | GrpcError::InvalidPath(_) | GrpcError::Closed => {
                Outcome::ProtocolError
            }
        }
    }
}
