//! Per-relay health tracking.
//!
//! Each configured relay gets one tracker task: probe `/networks` at
//! startup, then every 60 seconds. A successful probe replaces the
//! relay's advertised network list and reports the relay up; exhausting
//! the retry budget reports it down. The dispatcher reads the network set
//! under the read lock while selecting relays.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mixgate_core::{status, Method, RequestEnvelope, ResponseEnvelope, NETWORKS_URI};
use mixgate_transport::{Contact, MixClient};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{ClientError, Result};

/// How often a relay's `/networks` endpoint is re-probed.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Callback invoked with `(relay name, up)` after every probe cycle.
pub type UpdateCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Default)]
struct NetworkSet {
    /// Advertised URIs in the order the relay lists them.
    networks: Vec<String>,
    /// The same URIs as a set, for dispatch lookups.
    supported: HashSet<String>,
}

/// Health and network tracking for one relay server.
pub struct RelayTracker {
    name: String,
    contact: Contact,
    client: Arc<dyn MixClient>,
    retries: usize,
    state: RwLock<NetworkSet>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayTracker {
    pub fn new(
        name: impl Into<String>,
        contact: Contact,
        client: Arc<dyn MixClient>,
        retries: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            contact,
            client,
            retries: retries.max(1),
            state: RwLock::new(NetworkSet::default()),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the probe loop. `callback` receives every up/down transition.
    pub fn start(self: &Arc<Self>, callback: UpdateCallback) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        *self.stop_tx.lock() = Some(stop_tx);
        let tracker = self.clone();
        *self.task.lock() = Some(tokio::spawn(tracker.run(callback, stop_rx)));
    }

    /// Stop the probe loop and wait for it to finish. Safe to call more
    /// than once; late probes never fire the callback after this begins.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(()).await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// The networks this relay advertised on its last successful probe.
    pub fn networks(&self) -> Vec<String> {
        self.state.read().networks.clone()
    }

    pub fn supports(&self, uri: &str) -> bool {
        self.state.read().supported.contains(uri)
    }

    /// One single-use round trip to this relay. Transport failures only;
    /// the caller interprets the envelope.
    pub async fn request(&self, request: RequestEnvelope) -> Result<ResponseEnvelope> {
        self.client
            .request(&self.contact, request)
            .await
            .map_err(|error| {
                error!(relay = %self.name, %error, "error sending request to relay");
                ClientError::Transport(error)
            })
    }

    async fn run(self: Arc<Self>, callback: UpdateCallback, mut stop_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    debug!(relay = %self.name, "tracker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if self.probe(&callback, &mut stop_rx).await.is_none() {
                        return;
                    }
                }
            }
        }
    }

    /// One probe cycle. Returns `None` when a stop was observed.
    async fn probe(
        &self,
        callback: &UpdateCallback,
        stop_rx: &mut mpsc::Receiver<()>,
    ) -> Option<()> {
        let mut result = self.fetch_networks().await;
        let mut tries = 1;
        while result.is_err() && tries < self.retries {
            match stop_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            result = self.fetch_networks().await;
            tries += 1;
        }

        // A stop may have arrived while the last attempt was in flight;
        // never fire the callback after shutdown begins.
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }

        let content = match result {
            Err(_) => {
                warn!(
                    relay = %self.name,
                    retries = self.retries,
                    "failed to contact relay server"
                );
                callback(&self.name, false);
                return Some(());
            }
            Ok(content) => content,
        };

        let networks: Vec<String> = match serde_json::from_slice(&content) {
            Err(error) => {
                error!(relay = %self.name, %error, "couldn't parse supported networks");
                return Some(());
            }
            Ok(networks) => networks,
        };

        {
            let mut state = self.state.write();
            state.supported = networks.iter().cloned().collect();
            state.networks = networks;
        }
        callback(&self.name, true);
        Some(())
    }

    async fn fetch_networks(&self) -> Result<Vec<u8>> {
        let request = RequestEnvelope::new(Method::Get, NETWORKS_URI);
        let response = self.request(request).await?;
        if response.is_error() {
            let code = status::decode_or_server_error(&response.headers);
            return Err(ClientError::Response {
                code,
                message: response.error,
            });
        }
        Ok(response.content)
    }
}
