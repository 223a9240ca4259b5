//! Name resolution for gRPC targets.
//!
//! Two schemes are supported:
//!
//! - `list://host1:port1,host2:port2` resolves once to a fixed list.
//! - `file:///path/naming.json?service_name=svc&reload_time=10` reads a JSON
//!   object mapping service names to address arrays and re-reads it every
//!   `reload_time` seconds.
//!
//! A target without `://` is a single address.

use crate::util::ShutdownSignal;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Re-read interval for file targets without `reload_time`.
pub const DEFAULT_RELOAD_TIME: Duration = Duration::from_secs(10);

const LIST_SCHEME: &str = "list";
const FILE_SCHEME: &str = "file";

/// Errors produced while parsing targets or resolving addresses.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    #[error("unsupported resolver scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("service_name is empty")]
    EmptyService,

    #[error("naming file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to read naming file: {0}")]
    Read(#[source] io::Error),

    #[error("failed to parse naming file: {0}")]
    Parse(#[source] serde_json::Error),
}

/// A parsed dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Fixed address list.
    List(Vec<String>),
    /// Naming file polled for one service.
    File {
        path: PathBuf,
        service_name: String,
        reload_time: Duration,
    },
}

impl Target {
    /// Parse a target string.
    pub fn parse(target: &str) -> Result<Self, ResolverError> {
        let target = target.trim();

        let Some((scheme, rest)) = target.split_once("://") else {
            if target.is_empty() {
                return Err(ResolverError::InvalidTarget(target.to_string()));
            }
            return Ok(Target::List(vec![target.to_string()]));
        };

        match scheme {
            LIST_SCHEME => {
                let addrs: Vec<String> = rest
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect();
                if addrs.is_empty() {
                    return Err(ResolverError::InvalidTarget(target.to_string()));
                }
                Ok(Target::List(addrs))
            }
            FILE_SCHEME => Self::parse_file(target),
            other => Err(ResolverError::UnsupportedScheme(other.to_string())),
        }
    }

    fn parse_file(target: &str) -> Result<Self, ResolverError> {
        let invalid = || ResolverError::InvalidTarget(target.to_string());

        let url = Url::parse(target).map_err(|_| invalid())?;
        let path = url.to_file_path().map_err(|_| invalid())?;

        let mut service_name = String::new();
        let mut reload_time = DEFAULT_RELOAD_TIME;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "service_name" => service_name = value.into_owned(),
                "reload_time" => {
                    let secs: u64 = value.parse().map_err(|_| invalid())?;
                    if secs == 0 {
                        return Err(invalid());
                    }
                    reload_time = Duration::from_secs(secs);
                }
                _ => {}
            }
        }

        if service_name.is_empty() {
            return Err(ResolverError::EmptyService);
        }

        Ok(Target::File {
            path,
            service_name,
            reload_time,
        })
    }
}

/// Receiving side of a resolver.
pub trait ResolverSink: Send + Sync {
    /// Replace the address set.
    fn update_state(&self, addrs: Vec<String>);

    /// Report a resolution failure; the previous address set stays in effect.
    fn report_error(&self, err: ResolverError);
}

/// A running resolver.
#[derive(Debug)]
pub enum Resolver {
    List(ListResolver),
    File(FileResolver),
}

impl Resolver {
    /// Start resolving `target` into `sink`.
    ///
    /// The initial resolution happens before this returns.
    pub async fn build(
        target: &Target,
        sink: Arc<dyn ResolverSink>,
        shutdown: &ShutdownSignal,
    ) -> Result<Self, ResolverError> {
        match target {
            Target::List(addrs) => Ok(Resolver::List(ListResolver::build(addrs.clone(), sink))),
            Target::File {
                path,
                service_name,
                reload_time,
            } => {
                let resolver =
                    FileResolver::start(path, service_name, *reload_time, sink, shutdown).await?;
                Ok(Resolver::File(resolver))
            }
        }
    }

    /// Resolve again immediately.
    pub async fn resolve_now(&self) {
        match self {
            Resolver::List(_) => {}
            Resolver::File(resolver) => resolver.resolve_now().await,
        }
    }

    /// Stop resolving and wait for background work to finish.
    pub async fn close(self) {
        match self {
            Resolver::List(_) => {}
            Resolver::File(resolver) => resolver.close().await,
        }
    }
}

/// Resolver for `list://` targets.
#[derive(Debug)]
pub struct ListResolver {
    addrs: Vec<String>,
}

impl ListResolver {
    /// Push `addrs` to `sink` once.
    pub fn build(addrs: Vec<String>, sink: Arc<dyn ResolverSink>) -> Self {
        debug!(addrs = ?addrs, "list resolver built");
        sink.update_state(addrs.clone());
        Self { addrs }
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }
}

/// Resolver for `file://` targets.
pub struct FileResolver {
    inner: Arc<FileResolverInner>,
    stop: ShutdownSignal,
    task: JoinHandle<()>,
}

struct FileResolverInner {
    path: PathBuf,
    service_name: String,
    sink: Arc<dyn ResolverSink>,
    /// Last address set pushed to the sink.
    current: Mutex<HashSet<String>>,
}

impl FileResolver {
    /// Resolve `path` once, then poll it every `reload_time` until `shutdown`
    /// fires or the resolver is closed.
    pub async fn start(
        path: &Path,
        service_name: &str,
        reload_time: Duration,
        sink: Arc<dyn ResolverSink>,
        shutdown: &ShutdownSignal,
    ) -> Result<Self, ResolverError> {
        if service_name.is_empty() {
            return Err(ResolverError::EmptyService);
        }
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ResolverError::FileNotFound(path.to_path_buf()));
        }

        let inner = Arc::new(FileResolverInner {
            path: path.to_path_buf(),
            service_name: service_name.to_string(),
            sink,
            current: Mutex::new(HashSet::new()),
        });
        inner.resolve_now().await;

        let stop = ShutdownSignal::new();
        let task = tokio::spawn(poll_loop(
            Arc::clone(&inner),
            reload_time,
            stop.clone(),
            shutdown.clone(),
        ));

        info!(
            path = %path.display(),
            service = %service_name,
            reload_secs = reload_time.as_secs(),
            "file resolver started"
        );

        Ok(Self { inner, stop, task })
    }

    pub async fn resolve_now(&self) {
        self.inner.resolve_now().await;
    }

    /// Stop polling and wait for the poll task to exit.
    pub async fn close(self) {
        self.stop.shutdown();
        if let Err(e) = self.task.await {
            warn!(error = %e, "file resolver task failed");
        }
    }
}

impl std::fmt::Debug for FileResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileResolver")
            .field("path", &self.inner.path)
            .field("service_name", &self.inner.service_name)
            .finish_non_exhaustive()
    }
}

impl FileResolverInner {
    async fn resolve_now(&self) {
        // Held across the read so concurrent resolutions apply in order.
        let mut current = self.current.lock().await;

        let addrs = match self.read_addrs().await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "naming file resolution failed");
                self.sink.report_error(e);
                return;
            }
        };

        if addrs.is_empty() {
            debug!(service = %self.service_name, "naming file has no addresses, keeping current set");
            return;
        }

        let next: HashSet<String> = addrs.iter().cloned().collect();
        if next == *current {
            return;
        }

        debug!(service = %self.service_name, addrs = ?addrs, "naming file changed");
        *current = next;
        self.sink.update_state(addrs);
    }

    async fn read_addrs(&self) -> Result<Vec<String>, ResolverError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(ResolverError::Read)?;
        parse_naming_file(&contents, &self.service_name)
    }
}

/// Extract the address list for `service_name` from a naming file.
///
/// Unknown services and non-string entries yield nothing; duplicates are
/// dropped keeping first occurrence.
fn parse_naming_file(contents: &str, service_name: &str) -> Result<Vec<String>, ResolverError> {
    let root: serde_json::Value = serde_json::from_str(contents).map_err(ResolverError::Parse)?;

    let mut seen = HashSet::new();
    let addrs = root
        .get(service_name)
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.as_str())
                .map(str::trim)
                .filter(|a| !a.is_empty() && seen.insert(a.to_string()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(addrs)
}

async fn poll_loop(
    inner: Arc<FileResolverInner>,
    reload_time: Duration,
    stop: ShutdownSignal,
    shutdown: ShutdownSignal,
) {
    let mut ticker = interval(reload_time);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial resolve already ran.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.resolve_now().await,
            _ = stop.cancelled() => break,
            _ = shutdown.cancelled() => break,
        }
    }

    debug!(service = %inner.service_name, "file resolver stopped");
}
