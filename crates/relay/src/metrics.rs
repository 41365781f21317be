//! Per-URI request counters and the Prometheus text endpoint.
//!
//! Every registered network gets its own counter family, named after the
//! URI with slashes flattened to underscores. The hub owns the live
//! registry; a configuration reload swaps in a fresh registry so counters
//! for deregistered URIs disappear with their networks.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use prometheus::{Counter, Encoder, Opts, Registry, TextEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Which counter family a URI gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsKind {
    /// The `/networks` listing endpoint.
    Networks,
    /// A configured JSON-RPC network.
    Generic,
    /// The `/custom` endpoint, with URL-validation counters.
    Custom,
}

/// Counters for one URI.
pub struct QueryMetrics {
    total: Counter,
    successful: Counter,
    failed_empty: Option<Counter>,
    failed_rpc: Option<Counter>,
    failed_invalid_url: Option<Counter>,
    failed_unreachable_url: Option<Counter>,
    failed_generic: Option<Counter>,
}

impl QueryMetrics {
    fn build(uri: &str, kind: MetricsKind) -> Result<Self, prometheus::Error> {
        let flat = uri.replace('/', "_");
        let counter = |suffix: &str, help: &str| {
            Counter::with_opts(Opts::new(
                format!("requests{flat}_{suffix}"),
                format!("{help} for {uri}"),
            ))
        };

        let mut metrics = Self {
            total: counter("total", "Total number of requests")?,
            successful: counter("successful", "Total number of successful requests")?,
            failed_empty: None,
            failed_rpc: None,
            failed_invalid_url: None,
            failed_unreachable_url: None,
            failed_generic: None,
        };
        match kind {
            MetricsKind::Networks => {
                metrics.failed_generic = Some(counter(
                    "failed_generic",
                    "Total number of requests failed with a generic error",
                )?);
            }
            MetricsKind::Generic | MetricsKind::Custom => {
                metrics.failed_empty = Some(counter(
                    "failed_empty",
                    "Total number of requests failed with an empty body",
                )?);
                metrics.failed_rpc = Some(counter(
                    "failed_rpc",
                    "Total number of requests failed with an RPC error",
                )?);
            }
        }
        if kind == MetricsKind::Custom {
            metrics.failed_invalid_url = Some(counter(
                "failed_invalid_url",
                "Total number of requests failed with an invalid URL",
            )?);
            metrics.failed_unreachable_url = Some(counter(
                "failed_unreachable_url",
                "Total number of requests failed with an unreachable URL",
            )?);
        }
        Ok(metrics)
    }

    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        for counter in [Some(&self.total), Some(&self.successful)]
            .into_iter()
            .flatten()
            .chain(self.failed_empty.iter())
            .chain(self.failed_rpc.iter())
            .chain(self.failed_invalid_url.iter())
            .chain(self.failed_unreachable_url.iter())
            .chain(self.failed_generic.iter())
        {
            registry.register(Box::new(counter.clone()))?;
        }
        Ok(())
    }

    /// Counters wired to no registry. Used by tests and as the fallback
    /// when registration fails.
    pub fn detached(kind: MetricsKind) -> Self {
        Self::build("/detached", kind).expect("static metric options are valid")
    }

    pub fn inc_total(&self) {
        self.total.inc();
    }

    pub fn inc_successful(&self) {
        self.successful.inc();
    }

    pub fn inc_failed_empty(&self) {
        if let Some(counter) = &self.failed_empty {
            counter.inc();
        }
    }

    pub fn inc_failed_rpc(&self) {
        if let Some(counter) = &self.failed_rpc {
            counter.inc();
        }
    }

    pub fn inc_failed_invalid_url(&self) {
        if let Some(counter) = &self.failed_invalid_url {
            counter.inc();
        }
    }

    pub fn inc_failed_unreachable_url(&self) {
        if let Some(counter) = &self.failed_unreachable_url {
            counter.inc();
        }
    }

    pub fn inc_failed_generic(&self) {
        if let Some(counter) = &self.failed_generic {
            counter.inc();
        }
    }
}

/// Owner of the live metric registry.
pub struct MetricsHub {
    registry: RwLock<Registry>,
}

impl MetricsHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Registry::new()),
        })
    }

    /// Drop every registered counter. Called before a registry rebuild.
    pub fn reset(&self) {
        *self.registry.write() = Registry::new();
    }

    /// Create and register the counter family for one URI.
    pub fn for_uri(&self, uri: &str, kind: MetricsKind) -> QueryMetrics {
        match QueryMetrics::build(uri, kind) {
            Ok(metrics) => {
                if let Err(error) = metrics.register(&self.registry.read()) {
                    warn!(%uri, %error, "metric registration failed");
                }
                metrics
            }
            Err(error) => {
                warn!(%uri, %error, "metric creation failed");
                QueryMetrics::detached(kind)
            }
        }
    }

    /// Render the current registry in Prometheus text format.
    pub fn encode(&self) -> String {
        let families = self.registry.read().gather();
        let mut buffer = Vec::new();
        if let Err(error) = TextEncoder::new().encode(&families, &mut buffer) {
            warn!(%error, "metrics encoding failed");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Plain-text HTTP listener serving `/metrics`.
pub struct MetricsServer {
    hub: Arc<MetricsHub>,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl MetricsServer {
    pub fn new(hub: Arc<MetricsHub>) -> Self {
        Self {
            hub,
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub async fn start(&self, port: u16) -> crate::Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!(%addr, "starting metrics HTTP server");

        let hub = self.hub.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let hub = hub.clone();
                tokio::spawn(async move {
                    if let Err(error) = Self::serve_connection(stream, hub).await {
                        warn!(%error, "metrics connection error");
                    }
                });
            }
        });
        *self.task.lock() = Some(task);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!("metrics HTTP server stopped");
    }

    async fn serve_connection(
        mut stream: tokio::net::TcpStream,
        hub: Arc<MetricsHub>,
    ) -> std::io::Result<()> {
        // One GET per connection; read until the header section ends.
        let mut buf = Vec::with_capacity(512);
        let mut chunk = [0u8; 512];
        let path = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() > 8192 {
                return Ok(());
            }
            let mut headers = [httparse::EMPTY_HEADER; 16];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(&buf) {
                Ok(httparse::Status::Complete(_)) => {
                    break request.path.unwrap_or_default().to_string();
                }
                Ok(httparse::Status::Partial) => continue,
                Err(_) => return Ok(()),
            }
        };

        let (code, body) = if path == "/metrics" {
            (200u16, hub.encode())
        } else {
            (404u16, String::new())
        };
        let reason = if code == 200 { "OK" } else { "Not Found" };
        let response = format!(
            "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len(),
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_flattening_in_metric_names() {
        let hub = MetricsHub::new();
        let metrics = hub.for_uri("/ethereum/goerli", MetricsKind::Generic);
        metrics.inc_total();
        metrics.inc_successful();

        let text = hub.encode();
        assert!(text.contains("requests_ethereum_goerli_total"));
        assert!(text.contains("requests_ethereum_goerli_successful"));
        assert!(text.contains("requests_ethereum_goerli_failed_rpc"));
    }

    #[test]
    fn test_custom_kind_has_url_counters() {
        let hub = MetricsHub::new();
        let metrics = hub.for_uri("/custom", MetricsKind::Custom);
        metrics.inc_failed_invalid_url();
        metrics.inc_failed_unreachable_url();

        let text = hub.encode();
        assert!(text.contains("requests_custom_failed_invalid_url 1"));
        assert!(text.contains("requests_custom_failed_unreachable_url 1"));
    }

    #[test]
    fn test_networks_kind_has_generic_counter_only() {
        let hub = MetricsHub::new();
        let metrics = hub.for_uri("/networks", MetricsKind::Networks);
        metrics.inc_failed_generic();
        // These are no-ops for the networks kind.
        metrics.inc_failed_empty();
        metrics.inc_failed_rpc();

        let text = hub.encode();
        assert!(text.contains("requests_networks_failed_generic 1"));
        assert!(!text.contains("requests_networks_failed_empty"));
    }

    #[test]
    fn test_reset_drops_counters() {
        let hub = MetricsHub::new();
        let metrics = hub.for_uri("/ethereum/goerli", MetricsKind::Generic);
        metrics.inc_total();
        assert!(hub.encode().contains("requests_ethereum_goerli_total"));

        hub.reset();
        assert!(!hub.encode().contains("requests_ethereum_goerli_total"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        let hub = MetricsHub::new();
        hub.for_uri("/custom", MetricsKind::Custom).inc_total();

        let server = MetricsServer::new(hub);
        let addr = server.start(0).await.unwrap();

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("requests_custom_total 1"));

        let status = reqwest::get(format!("http://{addr}/other"))
            .await
            .unwrap()
            .status();
        assert_eq!(status.as_u16(), 404);

        server.stop().await;
    }
}
