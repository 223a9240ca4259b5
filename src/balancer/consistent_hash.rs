//! Consistent hashing load balancing algorithm.

use super::hash::murmur64;
use super::{Algorithm, Backend, Balancer, BalancerError, BalancerItem, BalancerSet};
use parking_lot::RwLock;
use tracing::debug;

/// Maximum number of members a hash ring accepts.
pub const MAX_HASH_NODES: usize = 1024;

/// Consistent hash load balancer.
///
/// Each backend with a non-zero weight gets one node on the ring at the
/// hash of its address. A key is routed to the first node clockwise from
/// the key's hash, wrapping past the end of the ring.
#[derive(Debug)]
pub struct ConsistentHashBalancer {
    state: RwLock<RingState>,
}

#[derive(Debug)]
struct RingNode {
    hash: u64,
    backend: Backend,
}

#[derive(Debug)]
struct RingState {
    set: BalancerSet,
    ring: Vec<RingNode>,
}

impl RingState {
    fn build(set: BalancerSet) -> Result<Self, BalancerError> {
        if set.len() > MAX_HASH_NODES {
            return Err(BalancerError::TooManyBackends {
                max: MAX_HASH_NODES,
                got: set.len(),
            });
        }

        let mut ring: Vec<RingNode> = set
            .items()
            .iter()
            .filter(|item| item.weight > 0)
            .map(|item| RingNode {
                hash: murmur64(item.addr.as_bytes()),
                backend: Backend::new(&item.addr, item.weight),
            })
            .collect();

        // Address as tiebreaker keeps the order independent of insertion order.
        ring.sort_by(|a, b| {
            a.hash
                .cmp(&b.hash)
                .then_with(|| a.backend.addr().cmp(b.backend.addr()))
        });

        Ok(Self { set, ring })
    }

    fn lookup(&self, hash: u64) -> Option<&Backend> {
        if self.ring.is_empty() {
            return None;
        }

        let idx = self.ring.partition_point(|node| node.hash < hash);
        let idx = if idx == self.ring.len() { 0 } else { idx };
        Some(&self.ring[idx].backend)
    }
}

impl ConsistentHashBalancer {
    /// Create a new consistent hash balancer.
    ///
    /// Fails with [`BalancerError::EmptyBackendSet`] if `items` is empty and
    /// [`BalancerError::TooManyBackends`] above [`MAX_HASH_NODES`] members.
    pub fn new(items: &[BalancerItem]) -> Result<Self, BalancerError> {
        if items.is_empty() {
            return Err(BalancerError::EmptyBackendSet);
        }

        let set = BalancerSet::from_items(items)?;
        Ok(Self {
            state: RwLock::new(RingState::build(set)?),
        })
    }

    /// Number of nodes currently on the ring.
    pub fn ring_len(&self) -> usize {
        self.state.read().ring.len()
    }

    /// Ring hashes in order, for inspection.
    pub fn ring_hashes(&self) -> Vec<u64> {
        self.state.read().ring.iter().map(|n| n.hash).collect()
    }
}

impl Balancer for ConsistentHashBalancer {
    fn pick(&self, key: &[u8]) -> Result<Backend, BalancerError> {
        let state = self.state.read();

        if state.ring.len() == 1 {
            return Ok(state.ring[0].backend.clone());
        }

        state
            .lookup(murmur64(key))
            .cloned()
            .ok_or(BalancerError::EmptyBackendSet)
    }

    fn add(&self, items: &[BalancerItem]) -> Result<(), BalancerError> {
        let mut state = self.state.write();

        let next = RingState::build(state.set.with_added(items)?)?;
        *state = next;

        debug!(
            added = items.len(),
            members = state.set.len(),
            ring = state.ring.len(),
            "hash ring rebuilt"
        );
        Ok(())
    }

    fn remove(&self, addr: &str) -> Result<(), BalancerError> {
        let mut state = self.state.write();

        let next = RingState::build(state.set.without(addr)?)?;
        *state = next;

        debug!(
            removed = addr,
            members = state.set.len(),
            ring = state.ring.len(),
            "hash ring rebuilt"
        );
        Ok(())
    }

    fn members(&self) -> Vec<BalancerItem> {
        self.state.read().set.items().to_vec()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::ConsistencyHash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn four_nodes() -> Vec<BalancerItem> {
        vec![
            BalancerItem::new("xx.xxx.xxx.01", 1),
            BalancerItem::new("xx.xxx.xxx.02", 1),
            BalancerItem::new("xx.xxx.xxx.03", 1),
            BalancerItem::new("xx.xxx.xxx.04", 1),
        ]
    }

    #[test]
    fn test_new_empty() {
        assert_eq!(
            ConsistentHashBalancer::new(&[]).unwrap_err(),
            BalancerError::EmptyBackendSet
        );
    }

    #[test]
    fn test_too_many_backends() {
        let items: Vec<BalancerItem> = (0..=MAX_HASH_NODES)
            .map(|i| BalancerItem::new(format!("10.0.{}.{}:80", i / 256, i % 256), 1))
            .collect();

        assert_eq!(
            ConsistentHashBalancer::new(&items).unwrap_err(),
            BalancerError::TooManyBackends {
                max: MAX_HASH_NODES,
                got: MAX_HASH_NODES + 1
            }
        );

        assert!(ConsistentHashBalancer::new(&items[..MAX_HASH_NODES]).is_ok());
    }

    #[test]
    fn test_ring_sorted() {
        let lb = ConsistentHashBalancer::new(&four_nodes()).unwrap();
        let hashes = lb.ring_hashes();
        assert_eq!(hashes.len(), 4);
        assert!(hashes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_deterministic_pick() {
        let lb = ConsistentHashBalancer::new(&four_nodes()).unwrap();
        let first = lb.pick(b"23472").unwrap();

        for _ in 0..1_000 {
            assert_eq!(lb.pick(b"23472").unwrap(), first);
        }
    }

    #[test]
    fn test_pick_independent_of_insertion_order() {
        let mut reversed = four_nodes();
        reversed.reverse();

        let a = ConsistentHashBalancer::new(&four_nodes()).unwrap();
        let b = ConsistentHashBalancer::new(&reversed).unwrap();

        for i in 0..200 {
            let key = format!("user-{}", i);
            assert_eq!(a.pick(key.as_bytes()).unwrap(), b.pick(key.as_bytes()).unwrap());
        }
    }

    #[test]
    fn test_lookup_wraps_to_first_node() {
        let lb = ConsistentHashBalancer::new(&four_nodes()).unwrap();
        let state = lb.state.read();

        let first = state.ring[0].backend.clone();
        let last = state.ring.last().unwrap();

        assert_eq!(state.lookup(u64::MAX).cloned(), Some(first.clone()));
        assert_eq!(state.lookup(last.hash.wrapping_add(1)).cloned(), Some(first));
        assert_eq!(state.lookup(last.hash), Some(&last.backend));
        assert_eq!(state.lookup(0), Some(&state.ring[0].backend));
    }

    #[test]
    fn test_keys_spread_across_nodes() {
        let lb = ConsistentHashBalancer::new(&four_nodes()).unwrap();
        let picked: HashSet<String> = (0..2_000)
            .map(|i| lb.pick(format!("key-{}", i).as_bytes()).unwrap().addr().to_string())
            .collect();
        assert!(picked.len() > 1);
    }

    #[test]
    fn test_single_node() {
        let lb = ConsistentHashBalancer::new(&[BalancerItem::new("a:1", 1)]).unwrap();
        assert_eq!(lb.pick(b"anything").unwrap().addr(), "a:1");
    }

    #[test]
    fn test_zero_weight_excluded_from_ring() {
        let lb = ConsistentHashBalancer::new(&[
            BalancerItem::new("a:1", 1),
            BalancerItem::new("b:1", 0),
        ])
        .unwrap();

        assert_eq!(lb.ring_len(), 1);
        assert_eq!(lb.members().len(), 2);
        for i in 0..100 {
            assert_eq!(lb.pick(i.to_string().as_bytes()).unwrap().addr(), "a:1");
        }

        lb.add(&[BalancerItem::new("a:1", 0)]).unwrap();
        assert_eq!(lb.pick(b"k").unwrap_err(), BalancerError::EmptyBackendSet);
    }

    #[test]
    fn test_add_then_remove_restores_members() {
        let lb = ConsistentHashBalancer::new(&four_nodes()).unwrap();
        let before = lb.members();
        let owner = lb.pick(b"23472").unwrap();

        lb.add(&[BalancerItem::new("xx.xxx.xxx.05", 1)]).unwrap();
        assert_eq!(lb.ring_len(), 5);

        lb.remove("xx.xxx.xxx.05").unwrap();
        assert_eq!(lb.members(), before);
        assert_eq!(lb.pick(b"23472").unwrap(), owner);
    }

    #[test]
    fn test_remove_only_moves_removed_keys() {
        let lb = ConsistentHashBalancer::new(&four_nodes()).unwrap();
        let keys: Vec<String> = (0..500).map(|i| format!("session-{}", i)).collect();
        let before: Vec<Backend> = keys.iter().map(|k| lb.pick(k.as_bytes()).unwrap()).collect();

        lb.remove("xx.xxx.xxx.02").unwrap();

        for (key, owner) in keys.iter().zip(before) {
            if owner.addr() != "xx.xxx.xxx.02" {
                assert_eq!(lb.pick(key.as_bytes()).unwrap(), owner);
            }
        }
    }

    #[test]
    fn test_add_over_cap_leaves_state() {
        let items: Vec<BalancerItem> = (0..MAX_HASH_NODES)
            .map(|i| BalancerItem::new(format!("node-{}", i), 1))
            .collect();
        let lb = ConsistentHashBalancer::new(&items).unwrap();

        let result = lb.add(&[BalancerItem::new("one-too-many", 1)]);
        assert!(matches!(result, Err(BalancerError::TooManyBackends { .. })));
        assert_eq!(lb.members().len(), MAX_HASH_NODES);

        // Updating an existing member is still allowed at the cap.
        lb.add(&[BalancerItem::new("node-0", 3)]).unwrap();
    }

    #[test]
    fn test_remove_missing() {
        let lb = ConsistentHashBalancer::new(&four_nodes()).unwrap();
        assert!(matches!(
            lb.remove("nope"),
            Err(BalancerError::BackendNotFound(_))
        ));
        assert_eq!(lb.ring_len(), 4);
    }
}
