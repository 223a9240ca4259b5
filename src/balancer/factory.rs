//! Balancer construction from configuration.

use super::{
    Algorithm, Balancer, BalancerError, BalancerItem, ConsistentHashBalancer,
    WeightedRandomBalancer,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Balancer section of a client configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct BalancerConfig {
    /// Selection algorithm.
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Initial members.
    #[serde(default)]
    pub backends: Vec<BalancerItem>,
}

impl BalancerConfig {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            backends: Vec::new(),
        }
    }

    /// Append a backend (builder style).
    pub fn with_backend(mut self, addr: impl Into<String>, weight: u32) -> Self {
        self.backends.push(BalancerItem::new(addr, weight));
        self
    }
}

/// Build a balancer for `config`.
///
/// `p2c` and `range` are reserved tags and fail with
/// [`BalancerError::UnsupportedAlgorithm`].
pub fn new_balancer(config: &BalancerConfig) -> Result<Arc<dyn Balancer>, BalancerError> {
    let balancer: Arc<dyn Balancer> = match config.algorithm {
        Algorithm::Random => Arc::new(WeightedRandomBalancer::new(&config.backends)?),
        Algorithm::ConsistencyHash => Arc::new(ConsistentHashBalancer::new(&config.backends)?),
        Algorithm::P2c | Algorithm::Range => {
            return Err(BalancerError::UnsupportedAlgorithm(config.algorithm));
        }
    };

    info!(
        algorithm = %config.algorithm,
        backends = config.backends.len(),
        "balancer created"
    );
    Ok(balancer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random() {
        let config = BalancerConfig::new(Algorithm::Random).with_backend("a:1", 1);
        let lb = new_balancer(&config).unwrap();
        assert_eq!(lb.algorithm(), Algorithm::Random);
    }

    #[test]
    fn test_consistency_hash() {
        let config = BalancerConfig::new(Algorithm::ConsistencyHash)
            .with_backend("a:1", 1)
            .with_backend("b:1", 1);
        let lb = new_balancer(&config).unwrap();
        assert_eq!(lb.algorithm(), Algorithm::ConsistencyHash);
        assert_eq!(lb.members().len(), 2);
    }

    #[test]
    fn test_reserved_algorithms_fail() {
        for algorithm in [Algorithm::P2c, Algorithm::Range] {
            let config = BalancerConfig::new(algorithm).with_backend("a:1", 1);
            let err = new_balancer(&config).unwrap_err();
            assert_eq!(err, BalancerError::UnsupportedAlgorithm(algorithm));
            assert!(err.is_config_error());
        }
    }

    #[test]
    fn test_empty_backends_fail() {
        let config = BalancerConfig::new(Algorithm::Random);
        assert_eq!(
            new_balancer(&config).unwrap_err(),
            BalancerError::EmptyBackendSet
        );
    }

    #[test]
    fn test_config_yaml() {
        let yaml = r#"
algorithm: consistency_hash
backends:
  - addr: "10.0.0.1:80"
    weight: 2
  - addr: "10.0.0.2:80"
"#;
        let config: BalancerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.algorithm, Algorithm::ConsistencyHash);
        assert_eq!(config.backends[1].weight, 1);
    }
}
