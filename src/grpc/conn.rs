//! Balanced gRPC connection.
//!
//! A [`GrpcConn`] owns one resolver and one subchannel per resolved address.
//! Each subchannel connects in the background and moves through
//! [`ConnectivityState`]s; every transition rebuilds the picker from the
//! READY set and publishes it atomically, so calls pick without locking.

use super::picker::{ErrPicker, Picker, PickerBuilder, SubConn};
use super::resolver::{Resolver, ResolverError, ResolverSink, Target};
use super::{GrpcClientConfig, GrpcError};
use crate::breaker::CircuitBreaker;
use crate::metrics::{MetricsCollector, Outcome, Transport};
use crate::util::{generate_trace_id, ShutdownSignal, TRACE_HEADER};
use arc_swap::ArcSwap;
use futures::Stream;
use http::uri::PathAndQuery;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

/// Connectivity state of one subchannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

struct SubConnEntry {
    /// Changes whenever a new connect loop takes over the entry.
    id: u64,
    state: ConnectivityState,
    endpoint: Endpoint,
    channel: Option<Channel>,
    cancel: ShutdownSignal,
}

struct ConnState {
    service_name: String,
    builder: Arc<dyn PickerBuilder>,
    subconns: RwLock<HashMap<String, SubConnEntry>>,
    picker: ArcSwap<Box<dyn Picker>>,
    /// Number of READY subchannels.
    ready_tx: watch::Sender<usize>,
    next_id: AtomicU64,
    dial_timeout: Duration,
    window_size: u32,
    stop: ShutdownSignal,
    shutdown: ShutdownSignal,
    metrics: Option<MetricsCollector>,
}

impl ConnState {
    async fn stopped(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    fn endpoint_for(&self, addr: &str) -> Result<Endpoint, tonic::transport::Error> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };

        Ok(Endpoint::from_shared(uri)?
            .connect_timeout(self.dial_timeout)
            .initial_stream_window_size(self.window_size)
            .initial_connection_window_size(self.window_size)
            .tcp_nodelay(true))
    }

    /// Reconcile subchannels with a new address set.
    fn update_addresses(self: &Arc<Self>, addrs: Vec<String>) {
        if self.stop.is_shutdown() {
            return;
        }

        let wanted: HashSet<String> = addrs.into_iter().collect();
        let mut started = Vec::new();

        {
            let mut subconns = self.subconns.write();

            subconns.retain(|addr, entry| {
                if wanted.contains(addr) {
                    return true;
                }
                entry.cancel.shutdown();
                debug!(service = %self.service_name, addr = %addr, "subconn removed");
                false
            });

            for addr in &wanted {
                if subconns.contains_key(addr) {
                    continue;
                }

                let endpoint = match self.endpoint_for(addr) {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        warn!(service = %self.service_name, addr = %addr, error = %e, "invalid subconn address");
                        continue;
                    }
                };

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let cancel = ShutdownSignal::new();
                subconns.insert(
                    addr.clone(),
                    SubConnEntry {
                        id,
                        state: ConnectivityState::Idle,
                        endpoint: endpoint.clone(),
                        channel: None,
                        cancel: cancel.clone(),
                    },
                );
                started.push((addr.clone(), id, endpoint, cancel));
            }

            self.publish_locked(&subconns);

            if let Some(metrics) = &self.metrics {
                metrics.set_members(Transport::Grpc, &self.service_name, subconns.len());
            }
        }

        for (addr, id, endpoint, cancel) in started {
            tokio::spawn(connect_loop(Arc::clone(self), addr, id, endpoint, cancel));
        }
    }

    /// Move a subchannel to `state` if `id` still owns it.
    fn transition(
        &self,
        addr: &str,
        id: u64,
        state: ConnectivityState,
        channel: Option<Channel>,
    ) -> bool {
        let mut subconns = self.subconns.write();

        let Some(entry) = subconns.get_mut(addr) else {
            return false;
        };
        if entry.id != id {
            return false;
        }

        let previous = entry.state;
        entry.state = state;
        entry.channel = channel;

        debug!(
            service = %self.service_name,
            addr = %addr,
            from = %previous,
            to = %state,
            "subconn state changed"
        );

        self.publish_locked(&subconns);
        true
    }

    /// Take a READY subchannel back to reconnecting after a call saw it fail.
    fn report_transient_failure(self: &Arc<Self>, addr: &str) {
        let (id, endpoint, cancel) = {
            let mut subconns = self.subconns.write();

            let Some(entry) = subconns.get_mut(addr) else {
                return;
            };
            if entry.state != ConnectivityState::Ready {
                return;
            }

            entry.cancel.shutdown();
            entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
            entry.cancel = ShutdownSignal::new();
            entry.state = ConnectivityState::TransientFailure;
            entry.channel = None;
            let restart = (entry.id, entry.endpoint.clone(), entry.cancel.clone());

            self.publish_locked(&subconns);
            restart
        };

        warn!(service = %self.service_name, addr = %addr, "subconn unavailable, reconnecting");
        tokio::spawn(connect_loop(Arc::clone(self), addr.to_string(), id, endpoint, cancel));
    }

    /// Rebuild the picker from READY entries. Callers hold the write lock.
    fn publish_locked(&self, subconns: &HashMap<String, SubConnEntry>) {
        let mut ready: Vec<SubConn> = subconns
            .iter()
            .filter_map(|(addr, entry)| match (entry.state, &entry.channel) {
                (ConnectivityState::Ready, Some(channel)) => {
                    Some(SubConn::new(addr, channel.clone()))
                }
                _ => None,
            })
            .collect();
        ready.sort_by(|a, b| a.addr().cmp(b.addr()));

        let count = ready.len();
        self.picker.store(Arc::new(self.builder.build(ready)));
        self.ready_tx.send_replace(count);
    }

    fn shutdown_all(&self) {
        let mut subconns = self.subconns.write();
        for entry in subconns.values_mut() {
            entry.cancel.shutdown();
            entry.state = ConnectivityState::Shutdown;
            entry.channel = None;
        }
        subconns.clear();

        self.picker.store(Arc::new(Box::new(ErrPicker) as Box<dyn Picker>));
        self.ready_tx.send_replace(0);
    }
}

/// Resolver output feeding a [`ConnState`].
struct ConnSink(Arc<ConnState>);

impl ResolverSink for ConnSink {
    fn update_state(&self, addrs: Vec<String>) {
        info!(service = %self.0.service_name, addrs = ?addrs, "resolver update");
        if let Some(metrics) = &self.0.metrics {
            metrics.record_resolver_update(&self.0.service_name);
        }
        self.0.update_addresses(addrs);
    }

    fn report_error(&self, err: ResolverError) {
        warn!(service = %self.0.service_name, error = %err, "resolver error");
    }
}

/// Reconnect delay: 100ms base, x1.6 per attempt, +/-20% jitter, 1s cap.
#[derive(Debug, Default)]
struct Backoff {
    attempt: i32,
}

impl Backoff {
    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(1);
    const MULTIPLIER: f64 = 1.6;
    const JITTER: f64 = 0.2;

    fn next_delay(&mut self) -> Duration {
        let raw = Self::BASE.as_secs_f64() * Self::MULTIPLIER.powi(self.attempt);
        let capped = raw.min(Self::MAX.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(-Self::JITTER..=Self::JITTER);
        Duration::from_secs_f64(capped * (1.0 + jitter))
    }
}

async fn connect_loop(
    state: Arc<ConnState>,
    addr: String,
    id: u64,
    endpoint: Endpoint,
    cancel: ShutdownSignal,
) {
    let mut backoff = Backoff::default();

    loop {
        if !state.transition(&addr, id, ConnectivityState::Connecting, None) {
            return;
        }

        let attempt = tokio::select! {
            result = endpoint.connect() => result,
            _ = cancel.cancelled() => return,
            _ = state.stopped() => return,
        };

        match attempt {
            Ok(channel) => {
                if state.transition(&addr, id, ConnectivityState::Ready, Some(channel)) {
                    info!(service = %state.service_name, addr = %addr, "subconn ready");
                }
                return;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    service = %state.service_name,
                    addr = %addr,
                    error = %e,
                    retry_ms = delay.as_millis(),
                    "subconn connect failed"
                );

                if !state.transition(&addr, id, ConnectivityState::TransientFailure, None) {
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                    _ = state.stopped() => return,
                }
            }
        }
    }
}

/// Deadline carried in a request's `grpc-timeout` header.
fn request_timeout(metadata: &tonic::metadata::MetadataMap) -> Option<Duration> {
    let value = metadata.get("grpc-timeout")?.to_str().ok()?;
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let n: u64 = digits.parse().ok()?;

    let timeout = match unit {
        "H" => Duration::from_secs(n.saturating_mul(3600)),
        "M" => Duration::from_secs(n.saturating_mul(60)),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    };
    Some(timeout)
}

/// One balanced connection to a gRPC target.
pub struct GrpcConn {
    target: String,
    state: Arc<ConnState>,
    resolver: Mutex<Option<Resolver>>,
    breaker: Arc<dyn CircuitBreaker>,
    max_send_msg_size: usize,
    max_recv_msg_size: usize,
}

impl GrpcConn {
    /// Resolve `config.target` and start connecting.
    ///
    /// With `dial_block` set this waits until a subchannel is READY and fails
    /// with [`GrpcError::DialTimeout`] after `dial_timeout`.
    pub async fn connect(
        config: &GrpcClientConfig,
        breaker: Arc<dyn CircuitBreaker>,
        metrics: Option<MetricsCollector>,
        shutdown: &ShutdownSignal,
    ) -> Result<Self, GrpcError> {
        let target = Target::parse(&config.target)?;
        let builder = config.policy.builder();
        let (ready_tx, _) = watch::channel(0);

        let state = Arc::new(ConnState {
            service_name: config.service_name.clone(),
            builder,
            subconns: RwLock::new(HashMap::new()),
            picker: ArcSwap::from_pointee(Box::new(ErrPicker) as Box<dyn Picker>),
            ready_tx,
            next_id: AtomicU64::new(0),
            dial_timeout: config.dial_timeout,
            window_size: config.window_size,
            stop: ShutdownSignal::new(),
            shutdown: shutdown.clone(),
            metrics,
        });

        let sink: Arc<dyn ResolverSink> = Arc::new(ConnSink(Arc::clone(&state)));
        let resolver = match Resolver::build(&target, sink, shutdown).await {
            Ok(resolver) => resolver,
            Err(e) => {
                state.stop.shutdown();
                state.shutdown_all();
                return Err(e.into());
            }
        };

        let conn = Self {
            target: config.target.clone(),
            state,
            resolver: Mutex::new(Some(resolver)),
            breaker,
            max_send_msg_size: config.max_send_msg_size,
            max_recv_msg_size: config.max_recv_msg_size,
        };

        if config.dial_block {
            if let Err(e) = conn.wait_ready(config.dial_timeout).await {
                conn.close().await;
                return Err(e);
            }
        }

        info!(
            service = %config.service_name,
            target = %config.target,
            policy = %config.policy,
            "grpc connection created"
        );
        Ok(conn)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wait until at least one subchannel is READY.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), GrpcError> {
        let mut rx = self.state.ready_tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready > 0)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(GrpcError::Closed),
            Err(_) => Err(GrpcError::DialTimeout(timeout)),
        }
    }

    /// Number of READY subchannels.
    pub fn ready_count(&self) -> usize {
        *self.state.ready_tx.borrow()
    }

    /// Current subchannel states, sorted by address.
    pub fn subconn_states(&self) -> Vec<(String, ConnectivityState)> {
        let mut states: Vec<(String, ConnectivityState)> = self
            .state
            .subconns
            .read()
            .iter()
            .map(|(addr, entry)| (addr.clone(), entry.state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Re-run resolution now.
    pub async fn resolve_now(&self) {
        if let Some(resolver) = self.resolver.lock().await.as_ref() {
            resolver.resolve_now().await;
        }
    }

    /// Pick a READY subchannel, waiting up to `wait` for one to appear.
    async fn pick_ready(&self, wait: Duration) -> Result<SubConn, GrpcError> {
        let deadline = Instant::now() + wait;
        let mut ready_rx = self.state.ready_tx.subscribe();

        loop {
            match self.state.picker.load().pick() {
                Err(GrpcError::NoSubConnAvailable) => {}
                picked => return picked,
            }
            if self.state.stop.is_shutdown() {
                return Err(GrpcError::Closed);
            }

            match tokio::time::timeout_at(deadline, ready_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(GrpcError::Closed),
                Err(_) => return Err(GrpcError::NoSubConnAvailable),
            }
        }
    }

    /// Validate `method` and stamp a trace id on the request.
    fn prepare<T>(
        &self,
        method: &str,
        request: &mut tonic::Request<T>,
    ) -> Result<(PathAndQuery, Duration), GrpcError> {
        if self.state.stop.is_shutdown() {
            return Err(GrpcError::Closed);
        }

        let path = PathAndQuery::try_from(method)
            .map_err(|e| GrpcError::InvalidPath(format!("{}: {}", method, e)))?;

        if !request.metadata().contains_key(TRACE_HEADER) {
            if let Ok(value) = generate_trace_id().parse() {
                request.metadata_mut().insert(TRACE_HEADER, value);
            }
        }

        let wait = request_timeout(request.metadata()).unwrap_or(self.state.dial_timeout);
        Ok((path, wait))
    }

    fn client_for(&self, subconn: &SubConn) -> tonic::client::Grpc<Channel> {
        tonic::client::Grpc::new(subconn.channel())
            .max_decoding_message_size(self.max_recv_msg_size)
            .max_encoding_message_size(self.max_send_msg_size)
    }

    /// Reconnect `addr` when a call saw its transport go away.
    fn observe_failure(&self, addr: &str, err: &GrpcError) {
        let lost = match err {
            GrpcError::Status(status) => status.code() == Code::Unavailable,
            GrpcError::Transport(_) => true,
            _ => false,
        };
        if lost && !addr.is_empty() {
            self.state.report_transient_failure(addr);
        }
    }

    /// Issue one unary call to `method` (e.g. `/pkg.Service/Method`).
    ///
    /// With no READY subchannel the call waits for one until the request's
    /// `grpc-timeout`, or `dial_timeout` when none is set. The breaker is
    /// consulted before the pick, so a rejected call never reaches a
    /// subchannel. A failed pick is returned without being recorded.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        mut request: tonic::Request<Req>,
    ) -> Result<tonic::Response<Resp>, GrpcError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let (path, wait) = self.prepare(method, &mut request)?;

        let start = Instant::now();
        let timer = self
            .state
            .metrics
            .as_ref()
            .map(|m| m.start_call_timer(Transport::Grpc, &self.state.service_name));
        let mut backend: Option<String> = None;

        let result = async {
            self.breaker
                .try_acquire()
                .map_err(|_| GrpcError::CircuitOpen)?;

            let subconn = self.pick_ready(wait).await?;
            backend = Some(subconn.addr().to_string());

            let result = self.invoke(&subconn, path, request).await;
            match &result {
                Ok(_) => self.breaker.on_success(),
                Err(_) => self.breaker.on_failure(),
            }
            result
        }
        .await;

        let addr = backend.unwrap_or_default();
        match &result {
            Ok(_) => {
                debug!(
                    service = %self.state.service_name,
                    method = %method,
                    backend = %addr,
                    duration_ms = start.elapsed().as_millis(),
                    "grpc call completed"
                );
            }
            Err(e) => {
                warn!(
                    service = %self.state.service_name,
                    method = %method,
                    backend = %addr,
                    error = %e,
                    "grpc call failed"
                );
                self.observe_failure(&addr, e);
            }
        }

        if let Some(timer) = timer {
            let outcome = match &result {
                Ok(_) => Outcome::Success,
                Err(e) => e.outcome(),
            };
            timer.record(&addr, outcome);
        }

        result
    }

    async fn invoke<Req, Resp>(
        &self,
        subconn: &SubConn,
        path: PathAndQuery,
        request: tonic::Request<Req>,
    ) -> Result<tonic::Response<Resp>, GrpcError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.client_for(subconn);
        grpc.ready().await.map_err(GrpcError::Transport)?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        Ok(grpc.unary(request, path, codec).await?)
    }

    /// Open a server-streaming call to `method`.
    ///
    /// The stream stays on the subchannel picked at open time. Streams do
    /// not go through the circuit breaker.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        mut request: tonic::Request<Req>,
    ) -> Result<tonic::Response<tonic::Streaming<Resp>>, GrpcError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let (path, wait) = self.prepare(method, &mut request)?;
        let subconn = self.pick_ready(wait).await?;

        let result = async {
            let mut grpc = self.client_for(&subconn);
            grpc.ready().await.map_err(GrpcError::Transport)?;

            let codec: ProstCodec<Req, Resp> = ProstCodec::default();
            Ok(grpc.server_streaming(request, path, codec).await?)
        }
        .await;

        if let Err(e) = &result {
            warn!(
                service = %self.state.service_name,
                method = %method,
                backend = %subconn.addr(),
                error = %e,
                "grpc stream failed to open"
            );
            self.observe_failure(subconn.addr(), e);
        }
        result
    }

    /// Open a client- or bidirectional-streaming call to `method`.
    ///
    /// Same picking rules as [`GrpcConn::server_streaming`].
    pub async fn streaming<S, Req, Resp>(
        &self,
        method: &str,
        mut request: tonic::Request<S>,
    ) -> Result<tonic::Response<tonic::Streaming<Resp>>, GrpcError>
    where
        S: Stream<Item = Req> + Send + 'static,
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let (path, wait) = self.prepare(method, &mut request)?;
        let subconn = self.pick_ready(wait).await?;

        let result = async {
            let mut grpc = self.client_for(&subconn);
            grpc.ready().await.map_err(GrpcError::Transport)?;

            let codec: ProstCodec<Req, Resp> = ProstCodec::default();
            Ok(grpc.streaming(request, path, codec).await?)
        }
        .await;

        if let Err(e) = &result {
            warn!(
                service = %self.state.service_name,
                method = %method,
                backend = %subconn.addr(),
                error = %e,
                "grpc stream failed to open"
            );
            self.observe_failure(subconn.addr(), e);
        }
        result
    }

    /// Stop the resolver and every subchannel.
    pub async fn close(&self) {
        self.state.stop.shutdown();

        if let Some(resolver) = self.resolver.lock().await.take() {
            resolver.close().await;
        }
        self.state.shutdown_all();

        info!(service = %self.state.service_name, target = %self.target, "grpc connection closed");
    }
}

impl fmt::Debug for GrpcConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcConn")
            .field("service_name", &self.state.service_name)
            .field("target", &self.target)
            .field("policy", &self.state.builder.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{ManualBreaker, NoopBreaker};
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};

    fn closed_port() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    const HEALTH_CHECK: &str = "/grpc.health.v1.Health/Check";
    const HEALTH_WATCH: &str = "/grpc.health.v1.Health/Watch";
    const SERVING: i32 = 1;

    /// Start a tonic health server on a random port.
    async fn start_health_server() -> (String, ShutdownSignal) {
        let (reporter, service) = tonic_health::server::health_reporter();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = ShutdownSignal::new();

        let signal = stop.clone();
        tokio::spawn(async move {
            let _reporter = reporter;
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    signal.cancelled().await
                })
                .await
        });

        (addr.to_string(), stop)
    }

    async fn lazy_conn(target: &str) -> GrpcConn {
        let config = GrpcClientConfig::new("test-svc", target);
        GrpcConn::connect(&config, Arc::new(NoopBreaker), None, &ShutdownSignal::new())
            .await
            .unwrap()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::default();
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(80) && first <= Duration::from_millis(120));

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(1200));
        }
        assert!(backoff.next_delay() >= Duration::from_millis(800));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectivityState::TransientFailure.to_string(), "TRANSIENT_FAILURE");
    }

    #[tokio::test]
    async fn test_list_target_creates_subconns() {
        let a = closed_port();
        let b = closed_port();
        let conn = lazy_conn(&format!("list://{},{}", a, b)).await;

        let states = conn.subconn_states();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|(_, s)| *s != ConnectivityState::Ready));
        assert_eq!(conn.ready_count(), 0);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_unary_without_ready_subconn() {
        let config = GrpcClientConfig::new("test-svc", closed_port());
        let config = GrpcClientConfig {
            dial_timeout: Duration::from_millis(150),
            ..config
        };
        let conn = GrpcConn::connect(&config, Arc::new(NoopBreaker), None, &ShutdownSignal::new())
            .await
            .unwrap();

        let start = std::time::Instant::now();
        let result: Result<tonic::Response<()>, _> =
            conn.unary("/test.Svc/Method", tonic::Request::new(())).await;
        assert!(matches!(result, Err(GrpcError::NoSubConnAvailable)));
        assert!(start.elapsed() >= Duration::from_millis(150));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_pick_wait_bounded_by_request_timeout() {
        let conn = lazy_conn(&closed_port()).await;
        let mut request = tonic::Request::new(());
        request.set_timeout(Duration::from_millis(100));

        let start = std::time::Instant::now();
        let result: Result<tonic::Response<()>, _> = conn.unary("/test.Svc/Method", request).await;
        assert!(matches!(result, Err(GrpcError::NoSubConnAvailable)));
        assert!(start.elapsed() < Duration::from_secs(2));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_failed_pick_not_recorded_by_breaker() {
        let breaker = Arc::new(ManualBreaker::new());
        let config = GrpcClientConfig::new("test-svc", closed_port());
        let conn = GrpcConn::connect(&config, breaker.clone(), None, &ShutdownSignal::new())
            .await
            .unwrap();

        let mut request = tonic::Request::new(());
        request.set_timeout(Duration::from_millis(50));
        let result: Result<tonic::Response<()>, _> = conn.unary("/test.Svc/Method", request).await;
        assert!(matches!(result, Err(GrpcError::NoSubConnAvailable)));
        assert_eq!(breaker.failures(), 0);
        assert_eq!(breaker.successes(), 0);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_call() {
        let conn = Arc::new(lazy_conn(&closed_port()).await);
        let waiting = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let result: Result<tonic::Response<()>, _> =
                    conn.unary("/test.Svc/Method", tonic::Request::new(())).await;
                result
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(GrpcError::Closed)));
    }

    #[test]
    fn test_request_timeout_header() {
        let mut request = tonic::Request::new(());
        assert_eq!(request_timeout(request.metadata()), None);

        request.set_timeout(Duration::from_millis(250));
        assert_eq!(request_timeout(request.metadata()), Some(Duration::from_millis(250)));

        request.metadata_mut().insert("grpc-timeout", "3S".parse().unwrap());
        assert_eq!(request_timeout(request.metadata()), Some(Duration::from_secs(3)));

        request.metadata_mut().insert("grpc-timeout", "bogus".parse().unwrap());
        assert_eq!(request_timeout(request.metadata()), None);
    }

    #[tokio::test]
    async fn test_call_right_after_lazy_connect() {
        let (addr, server) = start_health_server().await;
        let conn = lazy_conn(&addr).await;

        let response: tonic::Response<HealthCheckResponse> = conn
            .unary(HEALTH_CHECK, tonic::Request::new(HealthCheckRequest::default()))
            .await
            .unwrap();
        assert_eq!(response.into_inner().status, SERVING);
        conn.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_dial_block_against_live_server() {
        let (addr, server) = start_health_server().await;
        let breaker = Arc::new(ManualBreaker::new());
        let config =
            GrpcClientConfig::new("test-svc", &addr).with_dial_block(Duration::from_secs(2));
        let conn = GrpcConn::connect(&config, breaker.clone(), None, &ShutdownSignal::new())
            .await
            .unwrap();

        assert_eq!(conn.ready_count(), 1);
        assert_eq!(conn.subconn_states(), vec![(addr.clone(), ConnectivityState::Ready)]);

        let response: tonic::Response<HealthCheckResponse> = conn
            .unary(HEALTH_CHECK, tonic::Request::new(HealthCheckRequest::default()))
            .await
            .unwrap();
        assert_eq!(response.into_inner().status, SERVING);
        assert_eq!(breaker.successes(), 1);
        conn.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unavailable_status_reconnects_subconn() {
        let (addr, server) = start_health_server().await;
        let config =
            GrpcClientConfig::new("test-svc", &addr).with_dial_block(Duration::from_secs(2));
        let conn = GrpcConn::connect(&config, Arc::new(NoopBreaker), None, &ShutdownSignal::new())
            .await
            .unwrap();
        assert_eq!(conn.ready_count(), 1);

        let err = GrpcError::Status(tonic::Status::unavailable("gone"));
        conn.observe_failure(&addr, &err);
        assert_eq!(conn.ready_count(), 0);
        assert_ne!(conn.subconn_states()[0].1, ConnectivityState::Ready);

        conn.wait_ready(Duration::from_secs(2)).await.unwrap();
        let response: tonic::Response<HealthCheckResponse> = conn
            .unary(HEALTH_CHECK, tonic::Request::new(HealthCheckRequest::default()))
            .await
            .unwrap();
        assert_eq!(response.into_inner().status, SERVING);

        let not_found = GrpcError::Status(tonic::Status::not_found("svc"));
        conn.observe_failure(&addr, &not_found);
        assert_eq!(conn.ready_count(), 1);
        conn.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_streaming_watch() {
        let (addr, server) = start_health_server().await;
        let conn = lazy_conn(&addr).await;

        let response = conn
            .server_streaming::<_, HealthCheckResponse>(
                HEALTH_WATCH,
                tonic::Request::new(HealthCheckRequest::default()),
            )
            .await
            .unwrap();
        let mut stream = response.into_inner();
        let first = stream.message().await.unwrap().unwrap();
        assert_eq!(first.status, SERVING);
        conn.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_streaming_request_stream() {
        let (addr, server) = start_health_server().await;
        let conn = lazy_conn(&addr).await;

        let requests = futures::stream::iter(vec![HealthCheckRequest::default()]);
        let response = conn
            .streaming::<_, _, HealthCheckResponse>(HEALTH_WATCH, tonic::Request::new(requests))
            .await
            .unwrap();
        let mut stream = response.into_inner();
        let first = stream.message().await.unwrap().unwrap();
        assert_eq!(first.status, SERVING);
        conn.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_streaming_on_closed_conn() {
        let conn = lazy_conn(&closed_port()).await;
        conn.close().await;

        let result = conn
            .server_streaming::<_, HealthCheckResponse>(
                HEALTH_WATCH,
                tonic::Request::new(HealthCheckRequest::default()),
            )
            .await;
        assert!(matches!(result, Err(GrpcError::Closed)));
    }

    #[tokio::test]
    async fn test_dial_block_times_out() {
        let config = GrpcClientConfig::new("test-svc", closed_port())
            .with_dial_block(Duration::from_millis(200));

        let result =
            GrpcConn::connect(&config, Arc::new(NoopBreaker), None, &ShutdownSignal::new()).await;
        assert!(matches!(result, Err(GrpcError::DialTimeout(_))));
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_before_pick() {
        let breaker = Arc::new(ManualBreaker::new());
        breaker.open();

        let config = GrpcClientConfig::new("test-svc", closed_port());
        let conn = GrpcConn::connect(&config, breaker.clone(), None, &ShutdownSignal::new())
            .await
            .unwrap();

        let result: Result<tonic::Response<()>, _> =
            conn.unary("/test.Svc/Method", tonic::Request::new(())).await;
        assert!(matches!(result, Err(GrpcError::CircuitOpen)));
        assert_eq!(breaker.failures(), 0);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_closed_conn_rejects_calls() {
        let conn = lazy_conn(&closed_port()).await;
        conn.close().await;

        assert!(conn.subconn_states().is_empty());
        let result: Result<tonic::Response<()>, _> =
            conn.unary("/test.Svc/Method", tonic::Request::new(())).await;
        assert!(matches!(result, Err(GrpcError::Closed)));
    }

    #[tokio::test]
    async fn test_resolver_update_reconciles() {
        let conn = lazy_conn(&closed_port()).await;
        let keep = conn.subconn_states()[0].0.clone();
        let added = closed_port();

        conn.state.update_addresses(vec![keep.clone(), added.clone()]);
        let addrs: Vec<String> = conn.subconn_states().into_iter().map(|(a, _)| a).collect();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains(&added));

        conn.state.update_addresses(vec![added.clone()]);
        let addrs: Vec<String> = conn.subconn_states().into_iter().map(|(a, _)| a).collect();
        assert_eq!(addrs, vec![added]);
        conn.close().await;
    }
}
