//! The network registry.
//!
//! Builds the relay's endpoint table from the networks configuration:
//! one `(uri, POST)` handler per network whose endpoints survive the
//! startup probe, plus the always-present `/custom`, `/proxy`, and
//! `/networks` endpoints. A reload deregisters everything this registry
//! added, resets the metrics, and rebuilds from the new configuration.

use std::sync::Arc;

use async_trait::async_trait;
use mixgate_core::errors::ERR_INTERNAL;
use mixgate_core::{
    Method, RequestEnvelope, ResponseEnvelope, CUSTOM_URI, NETWORKS_URI, PROXY_URI,
};
use mixgate_transport::{Endpoints, RestHandler};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::NetworksConfig;
use crate::forwarder::HttpForwarder;
use crate::metrics::{MetricsHub, MetricsKind, QueryMetrics};
use crate::network::{test_connect_json_rpc, Network};

/// Owns the registered networks and the handlers derived from them.
pub struct NetworkManager {
    endpoints: Arc<Endpoints>,
    metrics: Arc<MetricsHub>,
    http: reqwest::Client,
    /// URIs advertised by `/networks`, in registration order. Shared with
    /// the listing handler.
    networks: Arc<RwLock<Vec<String>>>,
    /// Every `(uri, method)` this manager added, for deregistration.
    registered: Mutex<Vec<(String, Method)>>,
}

impl NetworkManager {
    /// Build the registry and register all handlers.
    pub async fn new(
        endpoints: Arc<Endpoints>,
        metrics: Arc<MetricsHub>,
        config: NetworksConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            endpoints,
            metrics,
            http: reqwest::Client::new(),
            networks: Arc::new(RwLock::new(Vec::new())),
            registered: Mutex::new(Vec::new()),
        });
        manager.init_networks(config).await;
        manager
    }

    /// Tear down every registered handler and rebuild from `config`.
    pub async fn reload(&self, config: NetworksConfig) {
        info!("reloading network manager");
        self.endpoints.remove(NETWORKS_URI, Method::Get);
        {
            let mut registered = self.registered.lock();
            for (uri, method) in registered.drain(..) {
                self.endpoints.remove(&uri, method);
            }
        }
        self.networks.write().clear();
        self.metrics.reset();

        self.init_networks(config).await;
    }

    /// The URIs currently advertised by `/networks`.
    pub fn networks(&self) -> Vec<String> {
        self.networks.read().clone()
    }

    async fn init_networks(&self, config: NetworksConfig) {
        for (network_name, subnets) in config {
            for subnet in subnets {
                let uri = format!("/{}/{}", network_name, subnet.name);

                let mut endpoints = Vec::with_capacity(subnet.endpoints.len());
                for url in subnet.endpoints {
                    if test_connect_json_rpc(&self.http, &url).await {
                        endpoints.push(url);
                    } else {
                        info!(%uri, %url, "endpoint is unreachable, will be ignored");
                    }
                }

                if endpoints.is_empty() {
                    warn!(%uri, "network has no valid endpoints, not supporting this network");
                    continue;
                }

                info!(%uri, endpoints = endpoints.len(), "creating network");
                let network = Network::new(
                    &uri,
                    endpoints,
                    self.http.clone(),
                    self.metrics.for_uri(&uri, MetricsKind::Generic),
                );
                self.register(uri, Method::Post, Arc::new(network));
            }
        }

        info!("creating network: {CUSTOM_URI}");
        let custom = Network::new(
            CUSTOM_URI,
            Vec::new(),
            self.http.clone(),
            self.metrics.for_uri(CUSTOM_URI, MetricsKind::Custom),
        );
        self.register(CUSTOM_URI.to_string(), Method::Post, Arc::new(custom));

        info!("creating endpoint: {PROXY_URI}");
        let forwarder = HttpForwarder::new(self.http.clone());
        self.register(PROXY_URI.to_string(), Method::Post, Arc::new(forwarder));

        info!("creating endpoint: {NETWORKS_URI}");
        let listing = NetworksHandler {
            networks: self.networks.clone(),
            metrics: self.metrics.for_uri(NETWORKS_URI, MetricsKind::Networks),
        };
        self.endpoints
            .add(NETWORKS_URI, Method::Get, Arc::new(listing));
    }

    fn register(&self, uri: String, method: Method, handler: Arc<dyn RestHandler>) {
        self.endpoints.add(&uri, method, handler);
        self.networks.write().push(uri.clone());
        self.registered.lock().push((uri, method));
    }
}

/// GET `/networks`: the JSON array of registered URIs.
struct NetworksHandler {
    networks: Arc<RwLock<Vec<String>>>,
    metrics: QueryMetrics,
}

#[async_trait]
impl RestHandler for NetworksHandler {
    async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        info!(uri = NETWORKS_URI, "request received over mixnet");
        self.metrics.inc_total();
        if request.uri != NETWORKS_URI {
            warn!(received = %request.uri, "received URI doesn't match this query");
        }

        let networks = self.networks.read().clone();
        match serde_json::to_vec(&networks) {
            Err(error) => {
                warn!(%error, "error marshalling networks list");
                self.metrics.inc_failed_generic();
                ResponseEnvelope::error(ERR_INTERNAL, 500)
            }
            Ok(data) => {
                self.metrics.inc_successful();
                ResponseEnvelope::with_status(data, 200)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubnetConfig;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// A fake JSON-RPC endpoint answering 200 to every POST.
    async fn healthy_endpoint() -> String {
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
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                        .await;
                });
            }
        });
        format!("http://{addr}/rpc")
    }

    fn config_with(network: &str, subnet: &str, endpoints: Vec<String>) -> NetworksConfig {
        let mut config = BTreeMap::new();
        config.insert(
            network.to_string(),
            vec![SubnetConfig {
                name: subnet.to_string(),
                endpoints,
            }],
        );
        config
    }

    async fn listing(endpoints: &Arc<Endpoints>) -> Vec<String> {
        let request = RequestEnvelope::new(Method::Get, NETWORKS_URI);
        let response = endpoints.dispatch(request).await.unwrap();
        serde_json::from_slice(&response.content).unwrap()
    }

    #[tokio::test]
    async fn test_init_registers_probed_network_and_builtins() {
        let endpoint = healthy_endpoint().await;
        let endpoints = Endpoints::new();
        let manager = NetworkManager::new(
            endpoints.clone(),
            MetricsHub::new(),
            config_with("ethereum", "goerli", vec![endpoint]),
        )
        .await;

        assert!(endpoints.contains("/ethereum/goerli", Method::Post));
        assert!(endpoints.contains(CUSTOM_URI, Method::Post));
        assert!(endpoints.contains(PROXY_URI, Method::Post));
        assert!(endpoints.contains(NETWORKS_URI, Method::Get));

        let networks = listing(&endpoints).await;
        assert_eq!(networks, manager.networks());
        assert!(networks.contains(&"/ethereum/goerli".to_string()));
        assert!(networks.contains(&CUSTOM_URI.to_string()));
        assert!(networks.contains(&PROXY_URI.to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_endpoints_drop_the_network() {
        let endpoints = Endpoints::new();
        let _manager = NetworkManager::new(
            endpoints.clone(),
            MetricsHub::new(),
            config_with("ethereum", "goerli", vec!["http://127.0.0.1:1/rpc".into()]),
        )
        .await;

        assert!(!endpoints.contains("/ethereum/goerli", Method::Post));
        // The built-ins are registered regardless.
        assert!(endpoints.contains(CUSTOM_URI, Method::Post));
        assert!(endpoints.contains(NETWORKS_URI, Method::Get));
    }

    #[tokio::test]
    async fn test_reload_replaces_registrations() {
        let endpoint = healthy_endpoint().await;
        let endpoints = Endpoints::new();
        let manager = NetworkManager::new(
            endpoints.clone(),
            MetricsHub::new(),
            config_with("ethereum", "goerli", vec![endpoint.clone()]),
        )
        .await;
        assert!(endpoints.contains("/ethereum/goerli", Method::Post));

        manager
            .reload(config_with("bitcoin", "mainnet", vec![endpoint]))
            .await;

        // Nothing from the old configuration survives.
        assert!(!endpoints.contains("/ethereum/goerli", Method::Post));
        assert!(endpoints.contains("/bitcoin/mainnet", Method::Post));
        assert!(endpoints.contains(CUSTOM_URI, Method::Post));
        assert!(endpoints.contains(NETWORKS_URI, Method::Get));

        let networks = listing(&endpoints).await;
        assert!(!networks.contains(&"/ethereum/goerli".to_string()));
        assert!(networks.contains(&"/bitcoin/mainnet".to_string()));
    }

    #[tokio::test]
    async fn test_networks_listing_metrics() {
        let hub = MetricsHub::new();
        let endpoints = Endpoints::new();
        let _manager =
            NetworkManager::new(endpoints.clone(), hub.clone(), BTreeMap::new()).await;

        listing(&endpoints).await;
        assert!(hub.encode().contains("requests_networks_successful 1"));
    }
}
