//! Registry of HTTP clients keyed by service name.

use super::{HttpClient, HttpClientConfig, HttpClientError, ManagerError};
use crate::breaker::{noop_factory, BreakerFactory};
use crate::metrics::MetricsCollector;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Holds one [`HttpClient`] per downstream service.
///
/// The manager is built by the application and passed to whoever needs it;
/// there is no process-wide instance.
pub struct HttpClientManager {
    clients: RwLock<HashMap<String, Arc<HttpClient>>>,
    breaker_factory: BreakerFactory,
    metrics: Option<MetricsCollector>,
}

impl HttpClientManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            breaker_factory: noop_factory(),
            metrics: None,
        }
    }

    /// Build breakers for clients whose config has a `breaker` section.
    pub fn with_breaker_factory(mut self, factory: BreakerFactory) -> Self {
        self.breaker_factory = factory;
        self
    }

    /// Attach a metrics collector to every client created afterwards.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build a manager holding a client for every config.
    ///
    /// Stops at the first failure.
    pub fn from_configs(configs: &[HttpClientConfig]) -> Result<Self, ManagerError> {
        let manager = Self::new();
        for config in configs {
            manager.new_http_client(config)?;
        }
        Ok(manager)
    }

    /// Create and register a client.
    pub fn new_http_client(&self, config: &HttpClientConfig) -> Result<Arc<HttpClient>, ManagerError> {
        let name = &config.service_name;
        let mut clients = self.clients.write();

        if clients.contains_key(name) {
            return Err(ManagerError::ServiceAlreadyExists(name.clone()));
        }

        let mut client = HttpClient::new(config).map_err(|e| match e {
            HttpClientError::BalancerNil => ManagerError::BalancerNil(name.clone()),
            source => ManagerError::Client {
                service: name.clone(),
                source,
            },
        })?;

        if let Some(breaker_config) = &config.breaker {
            client = client.with_breaker((self.breaker_factory)(breaker_config));
        }
        if let Some(metrics) = &self.metrics {
            client = client.with_metrics(metrics.clone());
        }

        let client = Arc::new(client);
        clients.insert(name.clone(), Arc::clone(&client));

        info!(service = %name, clients = clients.len(), "http client registered");
        Ok(client)
    }

    /// Look up a client by service name.
    pub fn get_client(&self, service_name: &str) -> Result<Arc<HttpClient>, ManagerError> {
        self.clients
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| ManagerError::ServiceNotExists(service_name.to_string()))
    }

    /// Registered service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Close idle connections of every client.
    pub fn close_all(&self) {
        for client in self.clients.read().values() {
            client.close();
        }
    }
}

impl Default for HttpClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HttpClientManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientManager")
            .field("services", &self.service_names())
            .finish_non_exhaustive()
    }
}
