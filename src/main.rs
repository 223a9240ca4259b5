//! rustrpc - client-side load balancing and RPC dispatch
//!
//! Usage:
//!     rustrpc --config <path> validate
//!     rustrpc --config <path> http <service> <path>
//!     rustrpc --config <path> grpc-health <service>
//!
//! See --help for more options.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use hyper::header::{HeaderName, HeaderValue};
use hyper::Method;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use rustrpc::config::{load_config, Config};
use rustrpc::grpc::GrpcClient;
use rustrpc::http::{HttpClientManager, HttpRequest};
use rustrpc::metrics::MetricsCollector;
use rustrpc::util::{init_logging, ShutdownSignal};

/// Client-side load balancing and RPC dispatch for HTTP and gRPC services.
#[derive(Parser, Debug)]
#[command(name = "rustrpc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print collected metrics after the command
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration and print the configured clients
    Validate,

    /// Send one HTTP request through a configured client
    Http {
        /// Service name of the client
        service: String,

        /// Request path
        path: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Selection key for key-affine balancers
        #[arg(short, long)]
        key: Option<String>,

        /// Request header as `name:value`, repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Run grpc.health.v1 Check through a configured client
    GrpcHealth {
        /// Service name of the client
        service: String,

        /// Service to ask the health endpoint about
        #[arg(long, default_value = "")]
        check: String,

        /// Call timeout
        #[arg(long, value_parser = humantime::parse_duration, default_value = "3s")]
        timeout: Duration,
    },
}

#[derive(Clone, PartialEq, prost::Message)]
struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    service: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct HealthCheckResponse {
    #[prost(int32, tag = "1")]
    status: i32,
}

const HEALTH_CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, &config.global.log_format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let metrics = MetricsCollector::new();
    runtime.block_on(run(cli.command, config, metrics.clone()))?;

    if cli.metrics {
        let text = metrics.encode().map_err(|_| anyhow!("failed to encode metrics"))?;
        print!("{}", text);
    }
    Ok(())
}

async fn run(command: Command, config: Config, metrics: MetricsCollector) -> Result<()> {
    match command {
        Command::Validate => {
            validate(&config);
            Ok(())
        }
        Command::Http {
            service,
            path,
            method,
            key,
            headers,
            data,
        } => {
            let mut request = HttpRequest::new(
                Method::from_bytes(method.as_bytes())
                    .with_context(|| format!("invalid method '{}'", method))?,
                path,
            );
            if let Some(key) = key {
                request = request.with_key(key);
            }
            if let Some(data) = data {
                request = request.with_body(data);
            }
            for header in &headers {
                let (name, value) = parse_header(header)?;
                request = request.with_header(name, value);
            }
            http_call(&config, metrics, &service, request).await
        }
        Command::GrpcHealth {
            service,
            check,
            timeout,
        } => grpc_health(&config, metrics, &service, check, timeout).await,
    }
}

fn validate(config: &Config) {
    info!("configuration is valid");
    println!("Configuration is valid.");
    println!("  HTTP clients: {}", config.http_clients.len());
    for client in &config.http_clients {
        if let Some(balancer) = &client.balancer {
            println!(
                "    - {} [{}] {} backends",
                client.service_name,
                balancer.algorithm,
                balancer.backends.len()
            );
        }
    }
    println!("  gRPC clients: {}", config.grpc_clients.len());
    for client in &config.grpc_clients {
        println!(
            "    - {} -> {} [{}] pool {}",
            client.service_name, client.target, client.policy, client.conn_pool_size
        );
    }
}

fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("header '{}' is not name:value", raw))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .with_context(|| format!("invalid header name in '{}'", raw))?;
    let value = HeaderValue::from_str(value.trim())
        .with_context(|| format!("invalid header value in '{}'", raw))?;
    Ok((name, value))
}

async fn http_call(
    config: &Config,
    metrics: MetricsCollector,
    service: &str,
    request: HttpRequest,
) -> Result<()> {
    let manager = HttpClientManager::new().with_metrics(metrics);
    for client in &config.http_clients {
        manager
            .new_http_client(client)
            .with_context(|| format!("failed to create http client '{}'", client.service_name))?;
    }

    let client = manager.get_client(service)?;
    let response = client
        .send(request)
        .await
        .with_context(|| format!("request to '{}' failed", service))?;

    info!(
        service = %service,
        backend = %response.backend,
        status = response.status.as_u16(),
        "http call completed"
    );
    println!("{} {}", response.status, response.backend);
    println!("{}", response.text());

    manager.close_all();
    Ok(())
}

async fn grpc_health(
    config: &Config,
    metrics: MetricsCollector,
    service: &str,
    check: String,
    timeout: Duration,
) -> Result<()> {
    let Some(client_config) = config
        .grpc_clients
        .iter()
        .find(|c| c.service_name == service)
    else {
        bail!("no grpc client named '{}'", service);
    };

    let shutdown = ShutdownSignal::new();
    let client = GrpcClient::builder(client_config.clone())
        .metrics(metrics)
        .shutdown(shutdown.clone())
        .connect()
        .await
        .with_context(|| format!("failed to connect grpc client '{}'", service))?;

    let mut request = tonic::Request::new(HealthCheckRequest { service: check });
    request.set_timeout(timeout);

    let result = client
        .unary::<_, HealthCheckResponse>(HEALTH_CHECK_METHOD, request)
        .await;

    client.close().await;
    shutdown.shutdown();

    let response = result.with_context(|| format!("health check on '{}' failed", service))?;
    let status = match response.get_ref().status {
        1 => "SERVING",
        2 => "NOT_SERVING",
        3 => "SERVICE_UNKNOWN",
        _ => "UNKNOWN",
    };
    println!("{}", status);
    Ok(())
}
