//! Pick policies over READY subchannels.

use super::GrpcError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tonic::transport::Channel;

/// Registered name of the random policy.
pub const RANDOM_PICKER_NAME: &str = "random";

/// Registered name of the round robin policy.
pub const ROUND_ROBIN_PICKER_NAME: &str = "round_robin";

/// A READY connection to one backend address.
#[derive(Clone)]
pub struct SubConn {
    addr: Arc<str>,
    channel: Channel,
}

impl SubConn {
    pub fn new(addr: &str, channel: Channel) -> Self {
        Self {
            addr: Arc::from(addr),
            channel,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

impl fmt::Debug for SubConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubConn").field("addr", &self.addr).finish()
    }
}

/// Chooses a subchannel for one call.
pub trait Picker: Send + Sync + fmt::Debug {
    fn pick(&self) -> Result<SubConn, GrpcError>;
}

/// Builds a picker from the current READY set.
pub trait PickerBuilder: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn build(&self, ready: Vec<SubConn>) -> Box<dyn Picker>;
}

/// Pick policy selector.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PickerPolicy {
    #[default]
    RoundRobin,
    Random,
}

impl PickerPolicy {
    /// Look a policy up by its registered name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            RANDOM_PICKER_NAME => Some(PickerPolicy::Random),
            ROUND_ROBIN_PICKER_NAME => Some(PickerPolicy::RoundRobin),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PickerPolicy::Random => RANDOM_PICKER_NAME,
            PickerPolicy::RoundRobin => ROUND_ROBIN_PICKER_NAME,
        }
    }

    /// Builder registered for this policy.
    pub fn builder(&self) -> Arc<dyn PickerBuilder> {
        match self {
            PickerPolicy::Random => Arc::new(RandomPickerBuilder),
            PickerPolicy::RoundRobin => Arc::new(RoundRobinPickerBuilder),
        }
    }
}

impl fmt::Display for PickerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Picker used while nothing is READY.
#[derive(Debug, Default)]
pub struct ErrPicker;

impl Picker for ErrPicker {
    fn pick(&self) -> Result<SubConn, GrpcError> {
        Err(GrpcError::NoSubConnAvailable)
    }
}

#[derive(Debug, Default)]
pub struct RandomPickerBuilder;

impl PickerBuilder for RandomPickerBuilder {
    fn name(&self) -> &'static str {
        RANDOM_PICKER_NAME
    }

    fn build(&self, ready: Vec<SubConn>) -> Box<dyn Picker> {
        if ready.is_empty() {
            return Box::new(ErrPicker);
        }
        Box::new(RandomPicker { subconns: ready })
    }
}

/// Uniform random choice among READY subchannels.
#[derive(Debug)]
pub struct RandomPicker {
    subconns: Vec<SubConn>,
}

impl Picker for RandomPicker {
    fn pick(&self) -> Result<SubConn, GrpcError> {
        match self.subconns.len() {
            0 => Err(GrpcError::NoSubConnAvailable),
            1 => Ok(self.subconns[0].clone()),
            len => Ok(self.subconns[rand::thread_rng().gen_range(0..len)].clone()),
        }
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinPickerBuilder;

impl PickerBuilder for RoundRobinPickerBuilder {
    fn name(&self) -> &'static str {
        ROUND_ROBIN_PICKER_NAME
    }

    fn build(&self, ready: Vec<SubConn>) -> Box<dyn Picker> {
        if ready.is_empty() {
            return Box::new(ErrPicker);
        }
        // Start at a random offset per picker.
        let start = rand::thread_rng().gen_range(0..ready.len());
        Box::new(RoundRobinPicker {
            subconns: ready,
            next: AtomicUsize::new(start),
        })
    }
}

/// Cycles through READY subchannels in order.
#[derive(Debug)]
pub struct RoundRobinPicker {
    subconns: Vec<SubConn>,
    next: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self) -> Result<SubConn, GrpcError> {
        match self.subconns.len() {
            0 => Err(GrpcError::NoSubConnAvailable),
            1 => Ok(self.subconns[0].clone()),
            len => {
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % len;
                Ok(self.subconns[idx].clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tonic::transport::Endpoint;

    fn subconns(addrs: &[&str]) -> Vec<SubConn> {
        addrs
            .iter()
            .map(|a| {
                let channel = Endpoint::from_shared(format!("http://{}", a))
                    .unwrap()
                    .connect_lazy();
                SubConn::new(a, channel)
            })
            .collect()
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(PickerPolicy::from_name("random"), Some(PickerPolicy::Random));
        assert_eq!(PickerPolicy::from_name("round_robin"), Some(PickerPolicy::RoundRobin));
        assert_eq!(PickerPolicy::from_name("p2c"), None);
        assert_eq!(PickerPolicy::default(), PickerPolicy::RoundRobin);
        assert_eq!(PickerPolicy::Random.builder().name(), RANDOM_PICKER_NAME);
    }

    #[tokio::test]
    async fn test_empty_ready_set() {
        for policy in [PickerPolicy::Random, PickerPolicy::RoundRobin] {
            let picker = policy.builder().build(Vec::new());
            assert!(matches!(picker.pick(), Err(GrpcError::NoSubConnAvailable)));
        }
    }

    #[tokio::test]
    async fn test_single_subconn() {
        for policy in [PickerPolicy::Random, PickerPolicy::RoundRobin] {
            let picker = policy.builder().build(subconns(&["127.0.0.1:1"]));
            for _ in 0..10 {
                assert_eq!(picker.pick().unwrap().addr(), "127.0.0.1:1");
            }
        }
    }

    #[tokio::test]
    async fn test_random_covers_all() {
        let picker = RandomPickerBuilder.build(subconns(&["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"]));
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..3_000 {
            *counts.entry(picker.pick().unwrap().addr().to_string()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c > 700));
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let picker = RoundRobinPickerBuilder.build(subconns(&["127.0.0.1:1", "127.0.0.1:2"]));
        let first = picker.pick().unwrap().addr().to_string();
        let second = picker.pick().unwrap().addr().to_string();
        let third = picker.pick().unwrap().addr().to_string();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }
}
