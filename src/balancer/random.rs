//! Weighted random load balancing algorithm.

use super::{Algorithm, Backend, Balancer, BalancerError, BalancerItem, BalancerSet};
use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

/// Weighted random load balancer.
///
/// Each backend occupies `weight` slots in a flat slot list; a pick is a
/// uniform draw over that list, so selection probability is proportional
/// to weight. The selection key is ignored.
#[derive(Debug)]
pub struct WeightedRandomBalancer {
    state: RwLock<RandomState>,
}

#[derive(Debug)]
struct RandomState {
    set: BalancerSet,
    slots: Vec<Backend>,
}

impl RandomState {
    fn build(set: BalancerSet) -> Self {
        let total: usize = set.items().iter().map(|i| i.weight as usize).sum();
        let mut slots = Vec::with_capacity(total);

        for item in set.items() {
            let backend = Backend::new(&item.addr, item.weight);
            for _ in 0..item.weight {
                slots.push(backend.clone());
            }
        }

        Self { set, slots }
    }
}

impl WeightedRandomBalancer {
    /// Create a new weighted random balancer.
    ///
    /// Fails with [`BalancerError::EmptyBackendSet`] if `items` is empty.
    pub fn new(items: &[BalancerItem]) -> Result<Self, BalancerError> {
        if items.is_empty() {
            return Err(BalancerError::EmptyBackendSet);
        }

        let set = BalancerSet::from_items(items)?;
        Ok(Self {
            state: RwLock::new(RandomState::build(set)),
        })
    }

    /// Number of slots in the current slot list (sum of weights).
    pub fn slot_count(&self) -> usize {
        self.state.read().slots.len()
    }
}

impl Balancer for WeightedRandomBalancer {
    fn pick(&self, _key: &[u8]) -> Result<Backend, BalancerError> {
        let state = self.state.read();

        match state.slots.len() {
            0 => Err(BalancerError::EmptyBackendSet),
            1 => Ok(state.slots[0].clone()),
            len => {
                let idx = rand::thread_rng().gen_range(0..len);
                Ok(state.slots[idx].clone())
            }
        }
    }

    fn add(&self, items: &[BalancerItem]) -> Result<(), BalancerError> {
        let mut state = self.state.write();

        let set = state.set.with_added(items)?;
        *state = RandomState::build(set);

        debug!(
            added = items.len(),
            members = state.set.len(),
            slots = state.slots.len(),
            "random balancer membership updated"
        );
        Ok(())
    }

    fn remove(&self, addr: &str) -> Result<(), BalancerError> {
        let mut state = self.state.write();

        let set = state.set.without(addr)?;
        *state = RandomState::build(set);

        debug!(
            removed = addr,
            members = state.set.len(),
            slots = state.slots.len(),
            "random balancer membership updated"
        );
        Ok(())
    }

    fn members(&self) -> Vec<BalancerItem> {
        self.state.read().set.items().to_vec()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Random
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(spec: &[(&str, u32)]) -> Vec<BalancerItem> {
        spec.iter().map(|(a, w)| BalancerItem::new(*a, *w)).collect()
    }

    #[test]
    fn test_new_empty() {
        assert_eq!(
            WeightedRandomBalancer::new(&[]).unwrap_err(),
            BalancerError::EmptyBackendSet
        );
    }

    #[test]
    fn test_slot_list_matches_weights() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 3), ("b:1", 1), ("c:1", 0)])).unwrap();
        assert_eq!(lb.slot_count(), 4);
        assert_eq!(lb.members().len(), 3);
    }

    #[test]
    fn test_single_backend() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 1)])).unwrap();
        for _ in 0..10 {
            assert_eq!(lb.pick(b"").unwrap().addr(), "a:1");
        }
    }

    #[test]
    fn test_zero_weight_never_picked() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 2), ("b:1", 0)])).unwrap();
        for _ in 0..1_000 {
            assert_eq!(lb.pick(b"").unwrap().addr(), "a:1");
        }
    }

    #[test]
    fn test_all_zero_weight_is_empty() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 0)])).unwrap();
        assert_eq!(lb.pick(b"").unwrap_err(), BalancerError::EmptyBackendSet);
    }

    #[test]
    fn test_weighted_distribution() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 3), ("b:1", 1)])).unwrap();

        let mut a = 0u32;
        let mut b = 0u32;
        for _ in 0..100_000 {
            match lb.pick(b"").unwrap().addr() {
                "a:1" => a += 1,
                _ => b += 1,
            }
        }

        let ratio = a as f64 / b as f64;
        assert!((2.7..=3.3).contains(&ratio), "ratio {} out of range", ratio);
    }

    #[test]
    fn test_add_updates_weight_in_place() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 1), ("b:1", 1)])).unwrap();
        lb.add(&items(&[("a:1", 5), ("c:1", 2)])).unwrap();

        assert_eq!(lb.members(), items(&[("a:1", 5), ("b:1", 1), ("c:1", 2)]));
        assert_eq!(lb.slot_count(), 8);
    }

    #[test]
    fn test_add_then_remove_restores_members() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 1), ("b:1", 2)])).unwrap();
        let before = lb.members();

        lb.add(&items(&[("c:1", 4)])).unwrap();
        lb.remove("c:1").unwrap();

        assert_eq!(lb.members(), before);
        assert_eq!(lb.slot_count(), 3);
    }

    #[test]
    fn test_remove_missing_leaves_state() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 1)])).unwrap();
        assert_eq!(
            lb.remove("z:1").unwrap_err(),
            BalancerError::BackendNotFound("z:1".to_string())
        );
        assert_eq!(lb.members(), items(&[("a:1", 1)]));
    }

    #[test]
    fn test_failed_add_leaves_state() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 1)])).unwrap();
        let result = lb.add(&items(&[("b:1", 1), ("", 1)]));
        assert!(matches!(result, Err(BalancerError::InvalidBackend(_))));
        assert_eq!(lb.members(), items(&[("a:1", 1)]));
    }

    #[test]
    fn test_huge_weight_rejected() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 2)])).unwrap();

        let result = lb.add(&items(&[("b:1", u32::MAX)]));
        assert!(matches!(result, Err(BalancerError::InvalidBackend(_))));
        assert_eq!(lb.members(), items(&[("a:1", 2)]));
        assert_eq!(lb.slot_count(), 2);

        let result = WeightedRandomBalancer::new(&items(&[("a:1", u32::MAX)]));
        assert!(matches!(result, Err(BalancerError::InvalidBackend(_))));
    }

    #[test]
    fn test_remove_last_then_pick() {
        let lb = WeightedRandomBalancer::new(&items(&[("a:1", 1)])).unwrap();
        lb.remove("a:1").unwrap();
        assert_eq!(lb.pick(b"").unwrap_err(), BalancerError::EmptyBackendSet);
    }
}
