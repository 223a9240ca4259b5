//! Metrics collector using prometheus-client.
//!
//! Provides metrics for outbound calls, latency, breaker rejections and
//! balancer membership.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Transport a call went through.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Transport {
    Http,
    Grpc,
}

/// How an outbound call ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    ProtocolError,
    NetworkError,
    Timeout,
    BreakerOpen,
    NoBackend,
}

/// Labels for call metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CallLabels {
    pub transport: Transport,
    pub service: String,
    pub backend: String,
    pub outcome: Outcome,
}

/// Labels for per-service metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub transport: Transport,
    pub service: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total calls counter.
    calls_total: Family<CallLabels, Counter>,
    /// Call duration histogram (in seconds).
    call_duration_seconds: Family<ServiceLabels, Histogram>,
    /// Calls rejected by a circuit breaker.
    breaker_rejections_total: Family<ServiceLabels, Counter>,
    /// Current balancer membership size.
    balancer_members: Family<ServiceLabels, Gauge>,
    /// Address-set updates pushed by resolvers.
    resolver_updates_total: Family<ServiceLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let calls_total = Family::<CallLabels, Counter>::default();
        let call_duration_seconds = Family::<ServiceLabels, Histogram>::new_with_constructor(
            || {
                // Buckets: 1ms, 2.5ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
                Histogram::new(exponential_buckets(0.001, 2.5, 13))
            },
        );
        let breaker_rejections_total = Family::<ServiceLabels, Counter>::default();
        let balancer_members = Family::<ServiceLabels, Gauge>::default();
        let resolver_updates_total = Family::<ServiceLabels, Counter>::default();

        registry.register(
            "rustrpc_calls",
            "Total number of outbound calls",
            calls_total.clone(),
        );
        registry.register(
            "rustrpc_call_duration_seconds",
            "Outbound call duration in seconds",
            call_duration_seconds.clone(),
        );
        registry.register(
            "rustrpc_breaker_rejections",
            "Calls rejected by a circuit breaker without being dispatched",
            breaker_rejections_total.clone(),
        );
        registry.register(
            "rustrpc_balancer_members",
            "Number of members in a client's balancer",
            balancer_members.clone(),
        );
        registry.register(
            "rustrpc_resolver_updates",
            "Address-set updates pushed by resolvers",
            resolver_updates_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                calls_total,
                call_duration_seconds,
                breaker_rejections_total,
                balancer_members,
                resolver_updates_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Encode all metrics in the text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.inner.registry)?;
        Ok(buffer)
    }

    /// Record a completed call.
    pub fn record_call(
        &self,
        transport: Transport,
        service: &str,
        backend: &str,
        outcome: Outcome,
        duration: Duration,
    ) {
        let labels = CallLabels {
            transport,
            service: service.to_string(),
            backend: backend.to_string(),
            outcome,
        };
        self.inner.calls_total.get_or_create(&labels).inc();

        let service_labels = ServiceLabels {
            transport,
            service: service.to_string(),
        };
        self.inner
            .call_duration_seconds
            .get_or_create(&service_labels)
            .observe(duration.as_secs_f64());

        if outcome == Outcome::BreakerOpen {
            self.inner
                .breaker_rejections_total
                .get_or_create(&service_labels)
                .inc();
        }
    }

    /// Update the membership gauge for a service.
    pub fn set_members(&self, transport: Transport, service: &str, members: usize) {
        let labels = ServiceLabels {
            transport,
            service: service.to_string(),
        };
        self.inner
            .balancer_members
            .get_or_create(&labels)
            .set(members as i64);
    }

    /// Record one resolver update.
    pub fn record_resolver_update(&self, service: &str) {
        let labels = ServiceLabels {
            transport: Transport::Grpc,
            service: service.to_string(),
        };
        self.inner.resolver_updates_total.get_or_create(&labels).inc();
    }

    /// Start timing a call.
    pub fn start_call_timer(&self, transport: Transport, service: &str) -> CallTimer {
        CallTimer {
            collector: self.clone(),
            transport,
            service: service.to_string(),
            start: Instant::now(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

/// Timer for one call; consumed by [`CallTimer::record`].
pub struct CallTimer {
    collector: MetricsCollector,
    transport: Transport,
    service: String,
    start: Instant,
}

impl CallTimer {
    /// Get the elapsed duration.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the call and consume the timer.
    pub fn record(self, backend: &str, outcome: Outcome) {
        let duration = self.start.elapsed();
        self.collector
            .record_call(self.transport, &self.service, backend, outcome, duration);
    }
}
