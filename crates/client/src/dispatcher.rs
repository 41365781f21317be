//! Request dispatch across the relay pool.
//!
//! The dispatcher owns one [`RelayTracker`] per configured relay and an
//! `active` map fed by tracker callbacks. Each request snapshots the
//! active relays supporting the target URI, shuffles them once, and
//! rotates through the shuffled order on retries. Only transport
//! failures rotate; an error envelope from a relay is a real answer and
//! propagates immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mixgate_core::{status, Method, RequestEnvelope, ResponseEnvelope, CUSTOM_URI, PROXY_URI};
use mixgate_transport::{Contact, MixClient};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::tracker::{RelayTracker, UpdateCallback};
use crate::{ClientError, Result};

/// Default retry budget per request.
pub const DEFAULT_RETRIES: usize = 3;

/// One configured relay server.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub name: String,
    pub contact: Contact,
}

#[derive(Clone)]
pub struct DispatcherConfig {
    pub retries: usize,
    pub relays: Vec<RelayInfo>,
}

/// Routes single-use requests to healthy relays.
pub struct Dispatcher {
    client: Arc<dyn MixClient>,
    retries: usize,
    relays: HashMap<String, Arc<RelayTracker>>,
    active: RwLock<HashMap<String, bool>>,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn MixClient>, config: DispatcherConfig) -> Arc<Self> {
        let retries = config.retries.max(1);
        let mut relays = HashMap::with_capacity(config.relays.len());
        let mut active = HashMap::with_capacity(config.relays.len());
        for relay in config.relays {
            let tracker = RelayTracker::new(&relay.name, relay.contact, client.clone(), retries);
            relays.insert(relay.name.clone(), tracker);
            active.insert(relay.name, false);
        }
        Arc::new(Self {
            client,
            retries,
            relays,
            active: RwLock::new(active),
        })
    }

    /// Start the transport and every tracker, then block until at least
    /// one relay reports up.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.client.start().await?;

        let callback: UpdateCallback = {
            let dispatcher = Arc::downgrade(self);
            Arc::new(move |name: &str, up: bool| {
                if let Some(dispatcher) = dispatcher.upgrade() {
                    dispatcher.update_relay(name, up);
                }
            })
        };
        for tracker in self.relays.values() {
            tracker.start(callback.clone());
        }

        info!("waiting for an active relay");
        loop {
            if !self.active_trackers().is_empty() {
                info!("connected");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Mark every relay inactive, stop the trackers, then the transport.
    /// No request may send a mixnet message after this returns.
    pub async fn disconnect(&self) {
        {
            let mut active = self.active.write();
            for up in active.values_mut() {
                *up = false;
            }
        }

        let stops = self.relays.values().map(|tracker| tracker.stop());
        futures::future::join_all(stops).await;

        self.client.stop().await;
        info!("disconnected");
    }

    /// The deduplicated union of every tracker's advertised networks,
    /// in first-seen order.
    pub fn networks(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut networks = Vec::new();
        for tracker in self.relays.values() {
            for network in tracker.networks() {
                if seen.insert(network.clone()) {
                    networks.push(network);
                }
            }
        }
        networks
    }

    /// POST `data` to a network URI and return `(status, body)`.
    ///
    /// `/custom/<url>` targets are split here: the suffix moves into the
    /// envelope headers and the URI collapses to `/custom`.
    pub async fn request(&self, uri: &str, data: Vec<u8>) -> Result<(u16, Vec<u8>)> {
        let response = self
            .do_request(Method::Post, uri, data, Vec::new())
            .await?;
        let code = status::decode_or_server_error(&response.headers);
        if response.is_error() {
            warn!(code, error = %response.error, "response error");
            return Err(ClientError::Response {
                code,
                message: response.error,
            });
        }
        Ok((code, response.content))
    }

    /// Send a `/proxy` envelope carrying a packed header list. The reply
    /// envelope is returned untouched; its headers are JSON, not a
    /// status code.
    pub async fn request_proxy(
        &self,
        data: Vec<u8>,
        header_json: Vec<u8>,
    ) -> Result<ResponseEnvelope> {
        self.do_request(Method::Post, PROXY_URI, data, header_json)
            .await
    }

    fn update_relay(&self, name: &str, up: bool) {
        debug!(relay = %name, up, "relay status update");
        self.active.write().insert(name.to_string(), up);
    }

    fn active_trackers(&self) -> Vec<Arc<RelayTracker>> {
        let active = self.active.read();
        self.relays
            .iter()
            .filter(|(name, _)| active.get(*name).copied().unwrap_or(false))
            .map(|(_, tracker)| tracker.clone())
            .collect()
    }

    async fn do_request(
        &self,
        method: Method,
        uri: &str,
        data: Vec<u8>,
        headers: Vec<u8>,
    ) -> Result<ResponseEnvelope> {
        let (uri, headers) = match split_custom_uri(uri) {
            Some(endpoint) => (CUSTOM_URI.to_string(), endpoint.into_bytes()),
            None => (uri.to_string(), headers),
        };

        let active = self.active_trackers();
        if active.is_empty() {
            error!("no active relays");
            return Err(ClientError::NoActiveRelays);
        }

        let mut candidates: Vec<_> = active
            .into_iter()
            .filter(|tracker| tracker.supports(&uri))
            .collect();
        if candidates.is_empty() {
            error!(%uri, "network is not supported");
            return Err(ClientError::UnsupportedNetwork);
        }
        if candidates.len() > 1 {
            candidates.shuffle(&mut rand::rng());
        }

        let request = RequestEnvelope {
            method,
            uri,
            data,
            headers,
        };

        for attempt in 0..self.retries {
            let tracker = &candidates[attempt % candidates.len()];
            match tracker.request(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    warn!(relay = %tracker.name(), attempt, %error, "request attempt failed");
                }
            }
        }

        error!(retries = self.retries, "failed to send request, bailing");
        Err(ClientError::RetriesExhausted)
    }
}

/// Extract the target URL from a `/custom/<url>` URI.
fn split_custom_uri(uri: &str) -> Option<String> {
    let mut parts = uri.splitn(3, '/');
    parts.next()?;
    if parts.next()? != "custom" {
        return None;
    }
    let endpoint = parts.next()?;
    (!endpoint.is_empty()).then(|| endpoint.to_string())
}
