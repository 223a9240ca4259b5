//! Pool of balanced connections to one target.

use super::{GrpcClientConfig, GrpcConn, GrpcError};
use crate::breaker::{noop_factory, BreakerFactory};
use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use futures::Stream;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Builder for [`GrpcClient`].
pub struct GrpcClientBuilder {
    config: GrpcClientConfig,
    breaker_factory: BreakerFactory,
    metrics: Option<MetricsCollector>,
    shutdown: ShutdownSignal,
}

impl GrpcClientBuilder {
    /// Breakers are built per connection from `config.breaker`.
    pub fn breaker_factory(mut self, factory: BreakerFactory) -> Self {
        self.breaker_factory = factory;
        self
    }

    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Background resolver and connect tasks stop when `shutdown` fires.
    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Open `conn_pool_size` connections. A failure closes the ones
    /// already opened.
    pub async fn connect(self) -> Result<GrpcClient, GrpcError> {
        let size = self.config.conn_pool_size.max(1);
        let mut conns = Vec::with_capacity(size);

        for _ in 0..size {
            let breaker = (self.breaker_factory)(&self.config.breaker);
            let conn =
                GrpcConn::connect(&self.config, breaker, self.metrics.clone(), &self.shutdown)
                    .await;

            match conn {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    for conn in &conns {
                        conn.close().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            service = %self.config.service_name,
            target = %self.config.target,
            pool_size = size,
            "grpc client created"
        );

        Ok(GrpcClient {
            service_name: self.config.service_name,
            conns,
            next: AtomicUsize::new(0),
        })
    }
}

/// Balanced gRPC client holding a fixed pool of connections.
pub struct GrpcClient {
    service_name: String,
    conns: Vec<GrpcConn>,
    next: AtomicUsize,
}

impl GrpcClient {
    pub fn builder(config: GrpcClientConfig) -> GrpcClientBuilder {
        GrpcClientBuilder {
            config,
            breaker_factory: noop_factory(),
            metrics: None,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Connect with default collaborators.
    pub async fn connect(config: GrpcClientConfig) -> Result<Self, GrpcError> {
        Self::builder(config).connect().await
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn pool_size(&self) -> usize {
        self.conns.len()
    }

    /// Connections in pool order.
    pub fn conns(&self) -> &[GrpcConn] {
        &self.conns
    }

    /// Next connection in turn.
    pub fn conn(&self) -> &GrpcConn {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        &self.conns[idx]
    }

    /// Issue a unary call on the next pooled connection.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: tonic::Request<Req>,
    ) -> Result<tonic::Response<Resp>, GrpcError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.conn().unary(method, request).await
    }

    /// Open a server-streaming call on the next pooled connection.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: tonic::Request<Req>,
    ) -> Result<tonic::Response<tonic::Streaming<Resp>>, GrpcError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.conn().server_streaming(method, request).await
    }

    /// Open a client- or bidirectional-streaming call on the next pooled
    /// connection.
    pub async fn streaming<S, Req, Resp>(
        &self,
        method: &str,
        request: tonic::Request<S>,
    ) -> Result<tonic::Response<tonic::Streaming<Resp>>, GrpcError>
    where
        S: Stream<Item = Req> + Send + 'static,
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.conn().streaming(method, request).await
    }

    pub async fn close(&self) {
        for conn in &self.conns {
            conn.close().await;
        }
        info!(service = %self.service_name, "grpc client closed");
    }
}

impl fmt::Debug for GrpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcClient")
            .field("service_name", &self.service_name)
            .field("pool_size", &self.conns.len())
            .finish_non_exhaustive()
    }
}
