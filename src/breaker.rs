//! Circuit breaker contract.
//!
//! The breaker itself lives outside this crate. Transports only need to ask
//! for permission before dispatching and report the outcome afterwards;
//! [`call`] packages that protocol around a future.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Returned by [`CircuitBreaker::try_acquire`] when the breaker rejects a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker is open")]
pub struct BreakerOpen;

/// A call-wrapping guard around one downstream dependency.
pub trait CircuitBreaker: Send + Sync + fmt::Debug {
    /// Ask for permission to dispatch one call.
    fn try_acquire(&self) -> Result<(), BreakerOpen>;

    /// Record a call that completed successfully.
    fn on_success(&self);

    /// Record a call that failed.
    fn on_failure(&self);
}

/// Outcome of a call routed through [`call`].
#[derive(Debug, PartialEq, Eq)]
pub enum CallError<E> {
    /// Rejected by the breaker; the call was never dispatched.
    Open,
    /// The call ran and failed.
    Inner(E),
}

/// Run `fut` through `breaker`.
///
/// `fut` is not polled when the breaker rejects. Any `Err` counts as a failure.
pub async fn call<F, T, E>(breaker: &dyn CircuitBreaker, fut: F) -> Result<T, CallError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    if breaker.try_acquire().is_err() {
        debug!("call rejected by circuit breaker");
        return Err(CallError::Open);
    }

    match fut.await {
        Ok(value) => {
            breaker.on_success();
            Ok(value)
        }
        Err(e) => {
            breaker.on_failure();
            Err(CallError::Inner(e))
        }
    }
}

/// Breaker configuration surface.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// Failure rate (percent) at which the breaker opens.
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: u32,

    /// Minimum requests per second before the breaker may trip.
    #[serde(default = "default_min_qps")]
    pub min_qps: u64,

    /// How long the breaker stays open, in milliseconds.
    #[serde(default = "default_open_ms")]
    pub open_duration_ms: u64,

    /// Width of one sliding-window cell, in milliseconds.
    #[serde(default = "default_cell_interval_ms")]
    pub cell_interval_ms: u64,

    /// Number of cells in the sliding window.
    #[serde(default = "default_cell_count")]
    pub cell_count: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate(),
            min_qps: default_min_qps(),
            open_duration_ms: default_open_ms(),
            cell_interval_ms: default_cell_interval_ms(),
            cell_count: default_cell_count(),
        }
    }
}

fn default_failure_rate() -> u32 {
    40
}

fn default_min_qps() -> u64 {
    1
}

fn default_open_ms() -> u64 {
    5000
}

fn default_cell_interval_ms() -> u64 {
    1000
}

fn default_cell_count() -> u32 {
    10
}

/// Builds a breaker for one client from its configuration.
pub type BreakerFactory = Arc<dyn Fn(&BreakerConfig) -> Arc<dyn CircuitBreaker> + Send + Sync>;

/// Factory producing [`NoopBreaker`]s.
pub fn noop_factory() -> BreakerFactory {
    Arc::new(|_: &BreakerConfig| -> Arc<dyn CircuitBreaker> { Arc::new(NoopBreaker) })
}

/// Breaker that never opens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBreaker;

impl CircuitBreaker for NoopBreaker {
    fn try_acquire(&self) -> Result<(), BreakerOpen> {
        Ok(())
    }

    fn on_success(&self) {}

    fn on_failure(&self) {}
}

/// Breaker whose state is set explicitly by its owner.
///
/// Useful as an operator kill switch in front of a dependency.
#[derive(Debug, Default)]
pub struct ManualBreaker {
    open: AtomicBool,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ManualBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl CircuitBreaker for ManualBreaker {
    fn try_acquire(&self) -> Result<(), BreakerOpen> {
        if self.is_open() { Err(BreakerOpen) } else { Ok(()) }
    }

    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn on_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}
