//! JSON-RPC query execution.
//!
//! One [`Network`] serves one registered URI. It picks an endpoint
//! uniformly at random, performs the JSON-RPC POST, and packs the
//! upstream body and status into the reply envelope. The `/custom`
//! network has no configured endpoints: its target arrives in the
//! request headers and must be a reachable HTTPS URL.

use async_trait::async_trait;
use mixgate_core::errors::{
    ERR_CUSTOM_INVALID_URL, ERR_CUSTOM_UNREACHABLE, ERR_EMPTY_CONTENT, ERR_RPC_QUERY_PREFIX,
};
use mixgate_core::{RequestEnvelope, ResponseEnvelope, CUSTOM_URI};
use mixgate_transport::RestHandler;
use rand::seq::IndexedRandom;
use tracing::{debug, info, warn};
use url::Url;

use crate::metrics::QueryMetrics;

/// The canonical probe request: a well-formed JSON-RPC envelope with an
/// empty method. Healthy endpoints answer 200 or 400.
pub const TEST_REQUEST: &[u8] = br#"{"id":"1", "jsonrpc":"2.0", "method": "", "params":[]}"#;

/// Probe an endpoint with the canonical test request.
pub async fn test_connect_json_rpc(http: &reqwest::Client, url: &str) -> bool {
    match query_json_rpc(http, url, TEST_REQUEST.to_vec()).await {
        Err(error) => {
            debug!(%url, %error, "endpoint probe failed");
            false
        }
        Ok((_, code)) => {
            if code == 200 || code == 400 {
                true
            } else {
                info!(%url, code, "endpoint returned unexpected code");
                false
            }
        }
    }
}

/// One JSON-RPC POST. Returns the body and the upstream status.
async fn query_json_rpc(
    http: &reqwest::Client,
    url: &str,
    data: Vec<u8>,
) -> Result<(Vec<u8>, u16), reqwest::Error> {
    let response = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(data)
        .send()
        .await?;
    let code = response.status().as_u16();
    let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
    Ok((body, code))
}

/// Pick one endpoint at random and query it.
async fn do_query(
    http: &reqwest::Client,
    endpoints: &[String],
    data: Vec<u8>,
) -> Result<(Vec<u8>, u16), String> {
    let endpoint = endpoints
        .choose(&mut rand::rng())
        .ok_or_else(|| "no endpoints available".to_string())?;
    query_json_rpc(http, endpoint, data)
        .await
        .map_err(|error| error.to_string())
}

/// Extract and validate the `/custom` target URL from request headers.
fn endpoint_from_headers(headers: &[u8]) -> Option<String> {
    if headers.is_empty() {
        info!("empty headers in custom URI request");
        return None;
    }
    let raw = std::str::from_utf8(headers).ok()?;
    let parsed = match Url::parse(raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            info!(%error, "couldn't parse URL from headers");
            return None;
        }
    };
    if parsed.scheme() != "https" {
        info!(scheme = parsed.scheme(), "URL is not HTTPS");
        return None;
    }
    Some(raw.to_string())
}

/// A registered network endpoint on the relay.
pub struct Network {
    uri: String,
    endpoints: Vec<String>,
    http: reqwest::Client,
    metrics: QueryMetrics,
}

impl Network {
    pub fn new(
        uri: impl Into<String>,
        endpoints: Vec<String>,
        http: reqwest::Client,
        metrics: QueryMetrics,
    ) -> Self {
        Self {
            uri: uri.into(),
            endpoints,
            http,
            metrics,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl RestHandler for Network {
    async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        info!(uri = %self.uri, "request received over mixnet");
        self.metrics.inc_total();
        if request.uri != self.uri {
            warn!(uri = %self.uri, received = %request.uri, "received URI doesn't match this query");
        }

        let mut code = 400u16;
        let mut error = String::new();
        let mut endpoints = self.endpoints.clone();

        if request.data.is_empty() {
            warn!(uri = %self.uri, "got empty request");
            error = ERR_EMPTY_CONTENT.to_string();
            self.metrics.inc_failed_empty();
        } else if self.uri == CUSTOM_URI {
            match endpoint_from_headers(&request.headers) {
                None => {
                    warn!(uri = %self.uri, "no valid endpoint URL in request headers");
                    error = ERR_CUSTOM_INVALID_URL.to_string();
                    self.metrics.inc_failed_invalid_url();
                }
                Some(endpoint) => {
                    if test_connect_json_rpc(&self.http, &endpoint).await {
                        endpoints = vec![endpoint];
                    } else {
                        warn!(uri = %self.uri, "couldn't connect to custom endpoint URL");
                        error = ERR_CUSTOM_UNREACHABLE.to_string();
                        self.metrics.inc_failed_unreachable_url();
                    }
                }
            }
        }

        let mut content = Vec::new();
        if error.is_empty() {
            match do_query(&self.http, &endpoints, request.data).await {
                Err(message) => {
                    error = format!("{ERR_RPC_QUERY_PREFIX}: {message}");
                    warn!(uri = %self.uri, %error, "query failed");
                    code = 500;
                    self.metrics.inc_failed_rpc();
                }
                Ok((body, status)) => {
                    debug!(uri = %self.uri, status, "query answered");
                    content = body;
                    code = status;
                }
            }
        }

        if error.is_empty() {
            self.metrics.inc_successful();
            ResponseEnvelope::with_status(content, code)
        } else {
            ResponseEnvelope::error(error, code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsKind;
    use mixgate_core::{status, Method};

    fn network(uri: &str, endpoints: Vec<String>) -> Network {
        let kind = if uri == CUSTOM_URI {
            MetricsKind::Custom
        } else {
            MetricsKind::Generic
        };
        Network::new(
            uri,
            endpoints,
            reqwest::Client::new(),
            QueryMetrics::detached(kind),
        )
    }

    #[test]
    fn test_endpoint_from_headers_accepts_https() {
        assert_eq!(
            endpoint_from_headers(b"https://rpc.example.org/v1"),
            Some("https://rpc.example.org/v1".to_string())
        );
    }

    #[test]
    fn test_endpoint_from_headers_rejects_http_and_garbage() {
        assert_eq!(endpoint_from_headers(b"http://rpc.example.org/v1"), None);
        assert_eq!(endpoint_from_headers(b""), None);
        assert_eq!(endpoint_from_headers(b"not a url"), None);
        assert_eq!(endpoint_from_headers(b"ftp://example.org"), None);
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let network = network("/ethereum/goerli", vec!["https://unused.example".into()]);
        let request = RequestEnvelope::new(Method::Post, "/ethereum/goerli");
        let response = network.handle(request).await;
        assert_eq!(response.error, ERR_EMPTY_CONTENT);
        assert_eq!(status::decode(&response.headers), Some(400));
    }

    #[tokio::test]
    async fn test_custom_without_headers_makes_no_upstream_request() {
        let network = network(CUSTOM_URI, Vec::new());
        let request =
            RequestEnvelope::new(Method::Post, CUSTOM_URI).with_data(b"{}".to_vec());
        let response = network.handle(request).await;
        assert_eq!(response.error, ERR_CUSTOM_INVALID_URL);
        assert_eq!(status::decode(&response.headers), Some(400));
    }

    #[tokio::test]
    async fn test_custom_rejects_plain_http_scheme() {
        let network = network(CUSTOM_URI, Vec::new());
        let request = RequestEnvelope::new(Method::Post, CUSTOM_URI)
            .with_data(b"{}".to_vec())
            .with_headers(b"http://rpc.example.org/v1".to_vec());
        let response = network.handle(request).await;
        assert_eq!(response.error, ERR_CUSTOM_INVALID_URL);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_rpc_error() {
        // Nothing listens on this port.
        let network = network("/ethereum/goerli", vec!["http://127.0.0.1:1/rpc".into()]);
        let request = RequestEnvelope::new(Method::Post, "/ethereum/goerli")
            .with_data(b"{}".to_vec());
        let response = network.handle(request).await;
        assert!(response.error.starts_with(ERR_RPC_QUERY_PREFIX));
        assert_eq!(status::decode(&response.headers), Some(500));
    }

    #[tokio::test]
    async fn test_query_against_local_server() {
        // A local HTTP server standing in for a JSON-RPC endpoint.
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let body = br#"{"jsonrpc":"2.0","result":"0x1","id":1}"#;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                });
            }
        });

        let network = network("/ethereum/goerli", vec![format!("http://{addr}/rpc")]);
        let request = RequestEnvelope::new(Method::Post, "/ethereum/goerli")
            .with_data(br#"{"method":"eth_blockNumber"}"#.to_vec());
        let response = network.handle(request).await;
        assert!(!response.is_error());
        assert_eq!(status::decode(&response.headers), Some(200));
        assert_eq!(response.content, br#"{"jsonrpc":"2.0","result":"0x1","id":1}"#);
    }

    #[tokio::test]
    async fn test_probe_accepts_400_responses() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                });
            }
        });

        let http = reqwest::Client::new();
        assert!(test_connect_json_rpc(&http, &format!("http://{addr}/rpc")).await);
        assert!(!test_connect_json_rpc(&http, "http://127.0.0.1:1/rpc").await);
    }
}
