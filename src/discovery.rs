//! Membership updates from a service discovery feed.
//!
//! A feed emits [`DiscoveryEvent`]s keyed `service/addr`. The value is either
//! empty (weight 1) or a JSON object such as `{"weight": 3}`.
//! [`MembershipAdapter`] applies events for one service to a balancer.
//! Malformed events are logged and skipped.

use crate::balancer::{Balancer, BalancerError, BalancerItem};
use crate::metrics::{MetricsCollector, Transport};
use crate::util::ShutdownSignal;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered events per watcher.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Add => "add",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// One change from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub key: String,
    pub value: String,
    pub operation: Operation,
}

impl DiscoveryEvent {
    pub fn add(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            operation: Operation::Add,
        }
    }

    pub fn update(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            operation: Operation::Update,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            operation: Operation::Delete,
        }
    }

    /// Service part of the key, if the key has one.
    pub fn service(&self) -> Option<&str> {
        self.key.split_once('/').map(|(service, _)| service)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery key '{0}'")]
    InvalidKey(String),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("balancer rejected update: {0}")]
    Balancer(#[from] BalancerError),

    #[error("watch failed: {0}")]
    Watch(String),
}

/// A source of membership events.
pub trait ServiceDiscovery: Send + Sync {
    /// Subscribe to events for `service`.
    fn watch(&self, service: &str) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError>;
}

/// In-process feed. Events are routed to watchers by the service part of
/// their key.
#[derive(Debug, Clone, Default)]
pub struct MemoryDiscovery {
    watchers: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<DiscoveryEvent>>>>>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live watcher of its service.
    ///
    /// Returns the number of watchers that received it. A full watcher
    /// drops the event.
    pub fn publish(&self, event: DiscoveryEvent) -> usize {
        let Some(service) = event.service() else {
            warn!(key = %event.key, "discovery event without service prefix dropped");
            return 0;
        };

        let mut watchers = self.watchers.lock();
        let Some(senders) = watchers.get_mut(service) else {
            return 0;
        };

        let mut delivered = 0;
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(key = %event.key, "discovery watcher full, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }
}

impl ServiceDiscovery for MemoryDiscovery {
    fn watch(&self, service: &str) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        if service.is_empty() || service.contains('/') {
            return Err(DiscoveryError::Watch(format!("invalid service name '{}'", service)));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.watchers
            .lock()
            .entry(service.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[derive(Debug, Deserialize)]
struct MemberValue {
    #[serde(default = "default_weight")]
    weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Applies discovery events for one service to a balancer.
pub struct MembershipAdapter {
    service: String,
    balancer: Arc<dyn Balancer>,
    metrics: Option<MetricsCollector>,
}

impl MembershipAdapter {
    pub fn new(service: impl Into<String>, balancer: Arc<dyn Balancer>) -> Self {
        Self {
            service: service.into(),
            balancer,
            metrics: None,
        }
    }

    /// Report membership size after every applied event.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Apply one event.
    pub fn apply(&self, event: &DiscoveryEvent) -> Result<(), DiscoveryError> {
        let addr = self.parse_key(&event.key)?;

        match event.operation {
            Operation::Add | Operation::Update => {
                let weight = parse_value(&event.key, &event.value)?;
                self.balancer.add(&[BalancerItem::new(addr, weight)])?;
            }
            Operation::Delete => self.balancer.remove(addr)?,
        }

        debug!(
            service = %self.service,
            addr = %addr,
            operation = %event.operation,
            "membership updated"
        );

        if let Some(metrics) = &self.metrics {
            metrics.set_members(Transport::Http, &self.service, self.balancer.members().len());
        }
        Ok(())
    }

    fn parse_key<'a>(&self, key: &'a str) -> Result<&'a str, DiscoveryError> {
        match key.split_once('/') {
            Some((service, addr)) if service == self.service && !addr.is_empty() => Ok(addr),
            _ => Err(DiscoveryError::InvalidKey(key.to_string())),
        }
    }

    /// Apply events until the feed closes or `shutdown` fires.
    pub async fn run(&self, mut events: mpsc::Receiver<DiscoveryEvent>, shutdown: ShutdownSignal) {
        info!(service = %self.service, "membership adapter started");

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!(service = %self.service, "discovery feed closed");
                        break;
                    };
                    if let Err(e) = self.apply(&event) {
                        warn!(service = %self.service, key = %event.key, error = %e, "discovery event skipped");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!(service = %self.service, "membership adapter stopping");
                    break;
                }
            }
        }
    }

    /// Watch `discovery` for this service and apply events on a background task.
    pub fn spawn(
        self: Arc<Self>,
        discovery: &dyn ServiceDiscovery,
        shutdown: ShutdownSignal,
    ) -> Result<JoinHandle<()>, DiscoveryError> {
        let events = discovery.watch(&self.service)?;
        Ok(tokio::spawn(async move { self.run(events, shutdown).await }))
    }
}

impl fmt::Debug for MembershipAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipAdapter")
            .field("service", &self.service)
            .field("algorithm", &self.balancer.algorithm())
            .finish_non_exhaustive()
    }
}

fn parse_value(key: &str, value: &str) -> Result<u32, DiscoveryError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(default_weight());
    }

    serde_json::from_str::<MemberValue>(value)
        .map(|v| v.weight)
        .map_err(|e| DiscoveryError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::WeightedRandomBalancer;
    use std::time::Duration;

    fn balancer() -> Arc<dyn Balancer> {
        Arc::new(WeightedRandomBalancer::new(&[BalancerItem::new("10.0.0.1:80", 1)]).unwrap())
    }

    fn addrs(balancer: &Arc<dyn Balancer>) -> Vec<(String, u32)> {
        balancer.members().into_iter().map(|i| (i.addr, i.weight)).collect()
    }

    #[test]
    fn test_apply_add_update_delete() {
        let lb = balancer();
        let adapter = MembershipAdapter::new("user-svc", Arc::clone(&lb));

        adapter.apply(&DiscoveryEvent::add("user-svc/10.0.0.2:80", "")).unwrap();
        adapter
            .apply(&DiscoveryEvent::update("user-svc/10.0.0.2:80", r#"{"weight": 4}"#))
            .unwrap();
        assert_eq!(
            addrs(&lb),
            vec![("10.0.0.1:80".to_string(), 1), ("10.0.0.2:80".to_string(), 4)]
        );

        adapter.apply(&DiscoveryEvent::delete("user-svc/10.0.0.1:80")).unwrap();
        assert_eq!(addrs(&lb), vec![("10.0.0.2:80".to_string(), 4)]);
    }

    #[test]
    fn test_invalid_events() {
        let lb = balancer();
        let adapter = MembershipAdapter::new("user-svc", Arc::clone(&lb));

        let err = adapter.apply(&DiscoveryEvent::add("no-slash", "")).unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidKey(_)));

        let err = adapter.apply(&DiscoveryEvent::add("other-svc/h:1", "")).unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidKey(_)));

        let err = adapter.apply(&DiscoveryEvent::add("user-svc/h:1", "weight=2")).unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidValue { .. }));

        let err = adapter
            .apply(&DiscoveryEvent::add("user-svc/h:1", r#"{"weight": 4294967295}"#))
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Balancer(BalancerError::InvalidBackend(_))));

        let err = adapter.apply(&DiscoveryEvent::delete("user-svc/missing:1")).unwrap_err();
        assert!(matches!(err, DiscoveryError::Balancer(BalancerError::BackendNotFound(_))));

        assert_eq!(addrs(&lb), vec![("10.0.0.1:80".to_string(), 1)]);
    }

    #[test]
    fn test_value_defaults() {
        assert_eq!(parse_value("k", "").unwrap(), 1);
        assert_eq!(parse_value("k", "{}").unwrap(), 1);
        assert_eq!(parse_value("k", r#"{"weight":0}"#).unwrap(), 0);
    }

    #[test]
    fn test_memory_discovery_routes_by_service() {
        let discovery = MemoryDiscovery::new();
        let mut rx = discovery.watch("user-svc").unwrap();

        assert_eq!(discovery.publish(DiscoveryEvent::add("user-svc/h:1", "")), 1);
        assert_eq!(discovery.publish(DiscoveryEvent::add("order-svc/h:1", "")), 0);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.key, "user-svc/h:1");
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert_eq!(discovery.publish(DiscoveryEvent::add("user-svc/h:2", "")), 0);
    }

    #[tokio::test]
    async fn test_adapter_task_applies_and_stops() {
        let lb = balancer();
        let discovery = MemoryDiscovery::new();
        let shutdown = ShutdownSignal::new();

        let adapter = Arc::new(MembershipAdapter::new("user-svc", Arc::clone(&lb)));
        let handle = adapter.spawn(&discovery, shutdown.clone()).unwrap();

        discovery.publish(DiscoveryEvent::add("user-svc/bad", "not json"));
        discovery.publish(DiscoveryEvent::add("user-svc/10.0.0.3:80", r#"{"weight":2}"#));

        tokio::time::timeout(Duration::from_secs(1), async {
            while lb.members().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(addrs(&lb)[1], ("10.0.0.3:80".to_string(), 2));
    }
}
