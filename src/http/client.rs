//! Pooled HTTP client bound to one balancer.

use super::{HttpClientConfig, HttpClientError, HttpRequest, HttpResponse, HttpTransportConfig};
use crate::balancer::{new_balancer, Backend, Balancer, BalancerItem};
use crate::breaker::{self, CallError, CircuitBreaker, NoopBreaker};
use crate::metrics::{MetricsCollector, Outcome, Transport};
use crate::util::ensure_trace_id;
use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type PooledClient = Client<HttpConnector, Full<Bytes>>;

/// HTTP client that routes every call through a balancer.
///
/// Calls never retry. A failed pick, a transport error, a non-2xx status or
/// an expired deadline is returned to the caller as is.
pub struct HttpClient {
    service_name: String,
    config: HttpTransportConfig,
    balancer: Arc<dyn Balancer>,
    pool: ArcSwap<PooledClient>,
    permits: DashMap<String, Arc<Semaphore>>,
    breaker: Arc<dyn CircuitBreaker>,
    metrics: Option<MetricsCollector>,
}

impl HttpClient {
    /// Build a client from its configuration.
    ///
    /// Fails with [`HttpClientError::BalancerNil`] when the config carries no
    /// balancer section, and with the balancer's own error when the section
    /// is invalid.
    pub fn new(config: &HttpClientConfig) -> Result<Self, HttpClientError> {
        let balancer_config = config.balancer.as_ref().ok_or(HttpClientError::BalancerNil)?;
        let balancer = new_balancer(balancer_config)?;

        info!(
            service = %config.service_name,
            algorithm = %balancer.algorithm(),
            timeout_ms = config.transport.timeout.as_millis(),
            "http client created"
        );

        Ok(Self {
            service_name: config.service_name.clone(),
            config: config.transport.clone(),
            balancer,
            pool: ArcSwap::from_pointee(build_pool(&config.transport)),
            permits: DashMap::new(),
            breaker: Arc::new(NoopBreaker),
            metrics: None,
        })
    }

    /// Route calls through `breaker`.
    pub fn with_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Record call metrics into `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        metrics.set_members(Transport::Http, &self.service_name, self.balancer.members().len());
        self.metrics = Some(metrics);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn transport(&self) -> &HttpTransportConfig {
        &self.config
    }

    /// The balancer this client picks from.
    pub fn balancer(&self) -> Arc<dyn Balancer> {
        Arc::clone(&self.balancer)
    }

    /// Send one request to a backend picked by `request.key`.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
        let start = Instant::now();

        let backend = match self.balancer.pick(&request.key) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "no backend to send to");
                self.record("", Outcome::NoBackend, start);
                return Err(e.into());
            }
        };

        let result = match breaker::call(self.breaker.as_ref(), self.execute(&backend, request)).await
        {
            Ok(response) => Ok(response),
            Err(CallError::Open) => Err(HttpClientError::CircuitOpen),
            Err(CallError::Inner(e)) => Err(e),
        };

        match &result {
            Ok(response) => {
                debug!(
                    service = %self.service_name,
                    backend = %backend,
                    status = response.status.as_u16(),
                    duration_ms = start.elapsed().as_millis(),
                    "http call completed"
                );
                self.record(backend.addr(), Outcome::Success, start);
            }
            Err(e) => {
                warn!(
                    service = %self.service_name,
                    backend = %backend,
                    error = %e,
                    "http call failed"
                );
                self.record(backend.addr(), e.outcome(), start);
            }
        }

        result
    }

    async fn execute(
        &self,
        backend: &Backend,
        request: HttpRequest,
    ) -> Result<HttpResponse, HttpClientError> {
        let HttpRequest {
            method,
            path,
            query,
            mut headers,
            body,
            deadline,
            ..
        } = request;

        let uri = compose_uri(backend.addr(), &path, &query)?;
        let trace_id = ensure_trace_id(&mut headers);

        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body))
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        *req.headers_mut() = headers;

        debug!(
            service = %self.service_name,
            trace_id = %trace_id,
            uri = %req.uri(),
            "dispatching http request"
        );

        let deadline = self.deadline_for(deadline);
        let pool = self.pool.load_full();

        let exchange = async {
            let _permit = self.acquire_permit(backend.addr()).await;
            let response = pool.request(req).await.map_err(HttpClientError::Network)?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await.map_err(HttpClientError::Body)?.to_bytes();
            Ok::<_, HttpClientError>((parts, body))
        };

        let (parts, body) = tokio::time::timeout_at(deadline, exchange)
            .await
            .map_err(|_| HttpClientError::Timeout)??;

        if !parts.status.is_success() {
            return Err(HttpClientError::Protocol {
                status: parts.status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body,
            backend: backend.clone(),
        })
    }

    fn deadline_for(&self, requested: Option<Instant>) -> Instant {
        let budget = Instant::now() + self.config.timeout;
        requested.map_or(budget, |deadline| deadline.min(budget))
    }

    async fn acquire_permit(&self, addr: &str) -> Option<OwnedSemaphorePermit> {
        let limit = self.config.max_conns_per_addr;
        if limit == 0 {
            return None;
        }

        let semaphore = self
            .permits
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone();

        semaphore.acquire_owned().await.ok()
    }

    fn record(&self, backend: &str, outcome: Outcome, start: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_call(
                Transport::Http,
                &self.service_name,
                backend,
                outcome,
                start.elapsed(),
            );
        }
    }

    /// Add or re-weight members.
    pub fn add_addr(&self, items: &[BalancerItem]) -> Result<(), HttpClientError> {
        self.balancer.add(items)?;
        self.update_members_gauge();
        Ok(())
    }

    /// Remove one member.
    pub fn remove_addr(&self, addr: &str) -> Result<(), HttpClientError> {
        self.balancer.remove(addr)?;
        self.permits.remove(addr);
        self.update_members_gauge();
        Ok(())
    }

    pub fn members(&self) -> Vec<BalancerItem> {
        self.balancer.members()
    }

    /// Drop idle pooled connections.
    ///
    /// Requests already in flight keep using the previous pool until they
    /// complete; new requests use a fresh pool.
    pub fn close(&self) {
        self.pool.store(Arc::new(build_pool(&self.config)));
        info!(service = %self.service_name, "http client idle connections closed");
    }

    fn update_members_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_members(Transport::Http, &self.service_name, self.balancer.members().len());
        }
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("service_name", &self.service_name)
            .field("algorithm", &self.balancer.algorithm())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn build_pool(config: &HttpTransportConfig) -> PooledClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.dial_timeout));
    connector.set_nodelay(config.tcp_nodelay);

    Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(config.effective_idle_timeout())
        .pool_max_idle_per_host(config.max_idle_conns_per_addr)
        .build(connector)
}

/// Join a backend address, a path and query pairs into a request URI.
///
/// Addresses without a scheme are treated as plain `http`.
fn compose_uri(addr: &str, path: &str, query: &[(String, String)]) -> Result<Uri, HttpClientError> {
    let mut url = String::with_capacity(addr.len() + path.len() + 16);

    if !addr.contains("://") {
        url.push_str("http://");
    }
    url.push_str(addr.trim_end_matches('/'));

    if !path.is_empty() && !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);

    if !query.is_empty() {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query)
            .finish();
        url.push(if path.contains('?') { '&' } else { '?' });
        url.push_str(&encoded);
    }

    url.parse::<Uri>()
        .map_err(|e| HttpClientError::InvalidRequest(format!("{}: {}", url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{Algorithm, BalancerConfig};
    use crate::breaker::ManualBreaker;
    use std::time::Duration;

    fn config_for(addrs: &[&str]) -> HttpClientConfig {
        let mut balancer = BalancerConfig::new(Algorithm::Random);
        for addr in addrs {
            balancer = balancer.with_backend(*addr, 1);
        }
        HttpClientConfig::new("test-svc").with_balancer(balancer)
    }

    fn closed_port() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn test_compose_uri() {
        let query = vec![
            ("q".to_string(), "a b".to_string()),
            ("page".to_string(), "2".to_string()),
        ];
        let uri = compose_uri("10.0.0.1:8080", "/search", &query).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/search?q=a+b&page=2");
    }

    #[test]
    fn test_compose_uri_keeps_scheme_and_joins_path() {
        let uri = compose_uri("http://10.0.0.1:8080/", "users", &[]).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/users");

        let uri = compose_uri("10.0.0.1:8080", "", &[]).unwrap();
        assert_eq!(uri.host(), Some("10.0.0.1"));
    }

    #[test]
    fn test_compose_uri_appends_to_existing_query() {
        let query = vec![("b".to_string(), "2".to_string())];
        let uri = compose_uri("h:1", "/p?a=1", &query).unwrap();
        assert_eq!(uri.query(), Some("a=1&b=2"));
    }

    #[test]
    fn test_compose_uri_invalid() {
        assert!(matches!(
            compose_uri("bad host", "/", &[]),
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_new_without_balancer() {
        let result = HttpClient::new(&HttpClientConfig::new("test-svc"));
        assert!(matches!(result, Err(HttpClientError::BalancerNil)));
    }

    #[test]
    fn test_new_with_bad_balancer() {
        let config = HttpClientConfig::new("test-svc").with_balancer(BalancerConfig::new(Algorithm::Range));
        assert!(matches!(
            HttpClient::new(&config),
            Err(HttpClientError::Balancer(_))
        ));
    }

    #[test]
    fn test_membership_changes() {
        let client = HttpClient::new(&config_for(&["a:1"])).unwrap();
        client.add_addr(&[BalancerItem::new("b:1", 2)]).unwrap();
        assert_eq!(client.members().len(), 2);

        client.remove_addr("a:1").unwrap();
        assert_eq!(client.members(), vec![BalancerItem::new("b:1", 2)]);

        assert!(client.remove_addr("a:1").is_err());
    }

    #[tokio::test]
    async fn test_send_to_closed_port_is_network_error() {
        let client = HttpClient::new(&config_for(&[&closed_port()])).unwrap();
        let err = client.send(HttpRequest::get("/")).await.unwrap_err();
        assert!(matches!(err, HttpClientError::Network(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_send_with_no_members() {
        let client = HttpClient::new(&config_for(&["a:1"])).unwrap();
        client.remove_addr("a:1").unwrap();
        let err = client.send(HttpRequest::get("/")).await.unwrap_err();
        assert!(matches!(err, HttpClientError::Balancer(_)));
    }

    #[tokio::test]
    async fn test_open_breaker_rejects() {
        let breaker = Arc::new(ManualBreaker::new());
        breaker.open();

        let metrics = MetricsCollector::new();
        let client = HttpClient::new(&config_for(&[&closed_port()]))
            .unwrap()
            .with_breaker(breaker.clone())
            .with_metrics(metrics.clone());

        let err = client.send(HttpRequest::get("/")).await.unwrap_err();
        assert!(matches!(err, HttpClientError::CircuitOpen));
        assert_eq!(breaker.failures(), 0);

        let text = metrics.encode().unwrap();
        assert!(text.contains("rustrpc_breaker_rejections_total"));
    }

    #[tokio::test]
    async fn test_deadline_never_exceeds_client_timeout() {
        let client = HttpClient::new(&config_for(&["a:1"])).unwrap();
        let far = Instant::now() + Duration::from_secs(3600);
        let deadline = client.deadline_for(Some(far));
        assert!(deadline <= Instant::now() + client.transport().timeout);

        let near = Instant::now() + Duration::from_millis(10);
        assert_eq!(client.deadline_for(Some(near)), near);
    }

    #[tokio::test]
    async fn test_permits_bound_concurrency() {
        let mut config = config_for(&["a:1"]);
        config.transport.max_conns_per_addr = 1;
        let client = HttpClient::new(&config).unwrap();

        let first = client.acquire_permit("a:1").await;
        assert!(first.is_some());

        let second =
            tokio::time::timeout(Duration::from_millis(50), client.acquire_permit("a:1")).await;
        assert!(second.is_err());

        drop(first);
        assert!(client.acquire_permit("a:1").await.is_some());
    }

    #[tokio::test]
    async fn test_close_swaps_pool() {
        let client = HttpClient::new(&config_for(&["a:1"])).unwrap();
        let before = client.pool.load_full();
        client.close();
        assert!(!Arc::ptr_eq(&before, &client.pool.load_full()));
    }
}
