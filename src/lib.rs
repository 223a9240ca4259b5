//! rustrpc - client-side load balancing and RPC dispatch
//!
//! This crate provides the outbound half of service-to-service calls:
//! - Weighted random and consistent-hash backend selection
//! - A pooled HTTP client bound to a balancer, plus a per-service registry
//! - Balanced gRPC connections fed by list and file resolvers
//! - A circuit breaker contract wrapped around every call
//! - An adapter applying discovery events to live balancers

pub mod balancer;
pub mod breaker;
pub mod config;
pub mod discovery;
pub mod grpc;
pub mod http;
pub mod metrics;
pub mod util;

pub use config::Config;
