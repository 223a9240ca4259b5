//! Configuration validation.

use crate::balancer::{Algorithm, BalancerConfig, MAX_HASH_NODES, MAX_TOTAL_WEIGHT, MAX_WEIGHT};
use crate::config::Config;
use crate::grpc::Target;
use std::collections::{HashMap, HashSet};

/// Validate the configuration.
///
/// Checks for:
/// - Non-empty, unique service names per transport
/// - Every HTTP client has a balancer section with a supported algorithm
/// - Balancer backends are present, non-empty and within ring capacity
/// - gRPC targets parse and pool sizes are positive
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    let mut http_names = HashSet::new();
    for client in &config.http_clients {
        let name = client.service_name.as_str();

        if name.is_empty() {
            errors.push("http client service_name cannot be empty".to_string());
        }

        if !http_names.insert(name) {
            errors.push(format!("duplicate http client: {}", name));
        }

        match &client.balancer {
            None => errors.push(format!("http client '{}' has no balancer section", name)),
            Some(balancer) => validate_balancer(name, balancer, &mut errors),
        }

        if client.transport.timeout.is_zero() {
            errors.push(format!("http client '{}' has a zero timeout", name));
        }
    }

    let mut grpc_names = HashSet::new();
    for client in &config.grpc_clients {
        let name = client.service_name.as_str();

        if name.is_empty() {
            errors.push("grpc client service_name cannot be empty".to_string());
        }

        if !grpc_names.insert(name) {
            errors.push(format!("duplicate grpc client: {}", name));
        }

        if let Err(e) = Target::parse(&client.target) {
            errors.push(format!("grpc client '{}': {}", name, e));
        }

        if client.conn_pool_size == 0 {
            errors.push(format!("grpc client '{}' has conn_pool_size 0", name));
        }

        if client.dial_timeout.is_zero() {
            errors.push(format!("grpc client '{}' has a zero dial_timeout", name));
        }
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn validate_balancer(name: &str, balancer: &BalancerConfig, errors: &mut Vec<String>) {
    if matches!(balancer.algorithm, Algorithm::P2c | Algorithm::Range) {
        errors.push(format!(
            "http client '{}' uses unsupported algorithm '{}'",
            name, balancer.algorithm
        ));
    }

    if balancer.backends.is_empty() {
        errors.push(format!("http client '{}' must have at least one backend", name));
    }

    // Duplicate addresses collapse, last weight wins.
    let mut weights: HashMap<&str, u32> = HashMap::new();
    for backend in &balancer.backends {
        let addr = backend.addr.trim();
        if addr.is_empty() {
            errors.push(format!("http client '{}' has a backend with an empty addr", name));
            continue;
        }
        if backend.weight > MAX_WEIGHT {
            errors.push(format!(
                "http client '{}' backend {} has weight {}, at most {} allowed",
                name, addr, backend.weight, MAX_WEIGHT
            ));
        }
        weights.insert(addr, backend.weight);
    }

    if balancer.algorithm == Algorithm::ConsistencyHash && weights.len() > MAX_HASH_NODES {
        errors.push(format!(
            "http client '{}' has {} backends, consistency_hash allows at most {}",
            name,
            weights.len(),
            MAX_HASH_NODES
        ));
    }

    let total: u64 = weights.values().map(|w| u64::from(*w)).sum();
    if total > MAX_TOTAL_WEIGHT {
        errors.push(format!(
            "http client '{}' has total weight {}, at most {} allowed",
            name, total, MAX_TOTAL_WEIGHT
        ));
    }
}
