//! Backend selection algorithms.
//!
//! Every balancer owns its membership set and is safe to share between
//! tasks: `pick` takes a shared lock, `add`/`remove` rebuild the whole
//! routing structure and publish it under an exclusive lock, so a reader
//! always observes either the old or the new membership.

mod consistent_hash;
mod factory;
pub mod hash;
mod random;

pub use consistent_hash::{ConsistentHashBalancer, MAX_HASH_NODES};
pub use factory::{new_balancer, BalancerConfig};
pub use random::WeightedRandomBalancer;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by balancer construction, selection and mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalancerError {
    #[error("backend set is empty")]
    EmptyBackendSet,

    #[error("backend set exceeds {max} entries (got {got})")]
    TooManyBackends { max: usize, got: usize },

    #[error("backend not found: {0}")]
    BackendNotFound(String),

    #[error("balancer algorithm '{0}' is not implemented")]
    UnsupportedAlgorithm(Algorithm),

    #[error("invalid backend: {0}")]
    InvalidBackend(String),
}

impl BalancerError {
    /// Whether this error comes from construction-time configuration rather
    /// than from a lookup against live membership.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BalancerError::TooManyBackends { .. }
                | BalancerError::UnsupportedAlgorithm(_)
                | BalancerError::InvalidBackend(_)
        )
    }
}

/// Load balancing algorithm tag.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    Random,
    P2c,
    ConsistencyHash,
    Range,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Random => "random",
            Algorithm::P2c => "p2c",
            Algorithm::ConsistencyHash => "consistency_hash",
            Algorithm::Range => "range",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration form of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BalancerItem {
    /// Routable address, `host:port` or a full base URL.
    pub addr: String,

    /// Selection weight. Zero keeps the backend as a member but never picks it.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl BalancerItem {
    pub fn new(addr: impl Into<String>, weight: u32) -> Self {
        Self {
            addr: addr.into(),
            weight,
        }
    }
}

fn default_weight() -> u32 {
    1
}

/// A routable backend handed out by [`Balancer::pick`].
///
/// Cloning is cheap; the address is reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    addr: Arc<str>,
    weight: u32,
}

impl Backend {
    pub fn new(addr: &str, weight: u32) -> Self {
        Self {
            addr: Arc::from(addr),
            weight,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// Trait for backend selection algorithms.
pub trait Balancer: Send + Sync + fmt::Debug {
    /// Select a backend.
    ///
    /// `key` is only meaningful for key-affine algorithms such as consistent
    /// hashing; other algorithms ignore it.
    fn pick(&self, key: &[u8]) -> Result<Backend, BalancerError>;

    /// Insert new backends or update the weight of existing ones.
    fn add(&self, items: &[BalancerItem]) -> Result<(), BalancerError>;

    /// Remove a backend by address.
    fn remove(&self, addr: &str) -> Result<(), BalancerError>;

    /// Current members in insertion order, including zero-weight ones.
    fn members(&self) -> Vec<BalancerItem>;

    /// Algorithm implemented by this balancer.
    fn algorithm(&self) -> Algorithm;
}

/// Largest weight a single backend may carry.
pub const MAX_WEIGHT: u32 = 10_000;

/// Largest sum of weights in one balancer.
pub const MAX_TOTAL_WEIGHT: u64 = 1_000_000;

/// Authoritative membership list with an address index.
///
/// Never patched in place by callers: every mutation produces a fresh set
/// that the owning balancer rebuilds its routing structure from.
#[derive(Debug, Clone, Default)]
pub(crate) struct BalancerSet {
    items: Vec<BalancerItem>,
    index: HashMap<String, usize>,
}

impl BalancerSet {
    /// Build a set, collapsing duplicate addresses (last weight wins).
    pub(crate) fn from_items(items: &[BalancerItem]) -> Result<Self, BalancerError> {
        let mut set = Self::default();
        set.merge(items)?;
        Ok(set)
    }

    pub(crate) fn items(&self) -> &[BalancerItem] {
        &self.items
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Return a copy with `items` merged in.
    pub(crate) fn with_added(&self, items: &[BalancerItem]) -> Result<Self, BalancerError> {
        let mut next = self.clone();
        next.merge(items)?;
        Ok(next)
    }

    /// Return a copy without `addr`.
    pub(crate) fn without(&self, addr: &str) -> Result<Self, BalancerError> {
        let position = *self
            .index
            .get(addr)
            .ok_or_else(|| BalancerError::BackendNotFound(addr.to_string()))?;

        let items: Vec<BalancerItem> = self
            .items
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != position)
            .map(|(_, item)| item.clone())
            .collect();

        Ok(Self::indexed(items))
    }

    fn merge(&mut self, items: &[BalancerItem]) -> Result<(), BalancerError> {
        for item in items {
            let addr = item.addr.trim();
            if addr.is_empty() {
                return Err(BalancerError::InvalidBackend(
                    "backend address cannot be empty".to_string(),
                ));
            }

            if item.weight > MAX_WEIGHT {
                return Err(BalancerError::InvalidBackend(format!(
                    "weight {} of {} exceeds {}",
                    item.weight, addr, MAX_WEIGHT
                )));
            }

            match self.index.get(addr) {
                Some(&i) => self.items[i].weight = item.weight,
                None => {
                    self.index.insert(addr.to_string(), self.items.len());
                    self.items.push(BalancerItem::new(addr, item.weight));
                }
            }
        }

        let total = self.total_weight();
        if total > MAX_TOTAL_WEIGHT {
            return Err(BalancerError::InvalidBackend(format!(
                "total weight {} exceeds {}",
                total, MAX_TOTAL_WEIGHT
            )));
        }
        Ok(())
    }

    /// Sum of member weights.
    pub(crate) fn total_weight(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.weight)).sum()
    }

    fn indexed(items: Vec<BalancerItem>) -> Self {
        let index = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.addr.clone(), i))
            .collect();
        Self { items, index }
    }
}
