//! In-process transport backend.
//!
//! A [`MemoryBroker`] wires client and relay halves together inside one
//! process. Requests are dispatched straight into the server's endpoint
//! registry; end-to-end connections are paired message queues. Used by the
//! integration tests and the `dev` command.
//!
//! Test hooks: a server can be marked unreachable ([`MemoryServer::set_down`])
//! or made to fail a fixed number of upcoming requests
//! ([`MemoryServer::fail_requests`]), and it counts the single-use requests
//! it served ([`MemoryServer::request_count`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use mixgate_core::{RequestEnvelope, ResponseEnvelope};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    Contact, ConnectionHandler, E2eConnection, E2eListener, Endpoints, HealthCallback,
    IncomingMessage, MixClient, RestServer, SendReport, TransportError,
};

/// Registry of in-process servers, keyed by contact id.
#[derive(Default)]
pub struct MemoryBroker {
    servers: RwLock<HashMap<String, Arc<ServerState>>>,
}

struct ServerState {
    endpoints: Arc<Endpoints>,
    connection_handler: RwLock<Option<Arc<dyn ConnectionHandler>>>,
    down: AtomicBool,
    fail_next: AtomicUsize,
    request_count: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create (and register) a server under `id`.
    pub fn server(self: &Arc<Self>, id: &str) -> Arc<MemoryServer> {
        let state = Arc::new(ServerState {
            endpoints: Endpoints::new(),
            connection_handler: RwLock::new(None),
            down: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            request_count: AtomicUsize::new(0),
        });
        self.servers.write().insert(id.to_string(), state.clone());
        Arc::new(MemoryServer {
            id: id.to_string(),
            state,
        })
    }

    /// Create a client attached to this broker.
    pub fn client(self: &Arc<Self>) -> Arc<MemoryClient> {
        Arc::new(MemoryClient {
            broker: self.clone(),
            started: AtomicBool::new(false),
            health_callbacks: Mutex::new(Vec::new()),
        })
    }

    fn lookup(&self, id: &str) -> Option<Arc<ServerState>> {
        self.servers.read().get(id).cloned()
    }
}

/// Relay half of the in-process backend.
pub struct MemoryServer {
    id: String,
    state: Arc<ServerState>,
}

impl MemoryServer {
    /// The contact clients use to reach this server.
    pub fn contact(&self) -> Contact {
        Contact::new(&self.id, "")
    }

    /// Make every request to this server fail until cleared.
    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` requests, then recover.
    pub fn fail_requests(&self, n: usize) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of single-use requests this server has served or rejected.
    pub fn request_count(&self) -> usize {
        self.state.request_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RestServer for MemoryServer {
    fn endpoints(&self) -> Arc<Endpoints> {
        self.state.endpoints.clone()
    }

    fn set_connection_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        *self.state.connection_handler.write() = Some(handler);
    }

    async fn start(&self) -> Result<(), TransportError> {
        debug!(id = %self.id, "memory server started");
        Ok(())
    }

    async fn stop(&self) {
        debug!(id = %self.id, "memory server stopped");
    }
}

/// Client half of the in-process backend.
pub struct MemoryClient {
    broker: Arc<MemoryBroker>,
    started: AtomicBool,
    health_callbacks: Mutex<Vec<HealthCallback>>,
}

#[async_trait]
impl MixClient for MemoryClient {
    async fn start(&self) -> Result<(), TransportError> {
        self.started.store(true, Ordering::SeqCst);
        for callback in self.health_callbacks.lock().iter() {
            callback(true);
        }
        Ok(())
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        for callback in self.health_callbacks.lock().iter() {
            callback(false);
        }
    }

    fn add_health_callback(&self, callback: HealthCallback) {
        self.health_callbacks.lock().push(callback);
    }

    async fn request(
        &self,
        contact: &Contact,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        let server = self
            .broker
            .lookup(contact.id())
            .ok_or_else(|| TransportError::UnknownPeer(contact.id().to_string()))?;

        server.request_count.fetch_add(1, Ordering::SeqCst);

        if server.down.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(contact.id().to_string()));
        }
        if server
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Unreachable(contact.id().to_string()));
        }

        let uri = request.uri.clone();
        let method = request.method;
        match server.endpoints.dispatch(request).await {
            Some(response) => Ok(response),
            None => {
                warn!(%uri, %method, "no handler registered");
                Ok(ResponseEnvelope::error(
                    format!("no handler for {method} {uri}"),
                    404,
                ))
            }
        }
    }

    async fn connect(&self, contact: &Contact) -> Result<Arc<dyn E2eConnection>, TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        let server = self
            .broker
            .lookup(contact.id())
            .ok_or_else(|| TransportError::UnknownPeer(contact.id().to_string()))?;
        if server.down.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(contact.id().to_string()));
        }

        let handler = server
            .connection_handler
            .read()
            .clone()
            .ok_or_else(|| TransportError::Unreachable(contact.id().to_string()))?;

        let (client_end, server_end) =
            MemoryConnection::pair("client".to_string(), contact.id().to_string());
        handler.connected(server_end);
        Ok(client_end)
    }
}

/// One end of a paired in-process connection.
pub struct MemoryConnection {
    /// Identity of the remote peer.
    partner: String,
    peer: OnceLock<Weak<MemoryConnection>>,
    listeners: RwLock<HashMap<u8, Arc<dyn E2eListener>>>,
    /// Local identity, stamped as `sender` on delivered messages.
    local: String,
    next_message_id: AtomicU64,
}

impl MemoryConnection {
    fn pair(client_id: String, server_id: String) -> (Arc<Self>, Arc<Self>) {
        let client_end = Arc::new(Self {
            partner: server_id.clone(),
            peer: OnceLock::new(),
            listeners: RwLock::new(HashMap::new()),
            local: client_id.clone(),
            next_message_id: AtomicU64::new(0),
        });
        let server_end = Arc::new(Self {
            partner: client_id,
            peer: OnceLock::new(),
            listeners: RwLock::new(HashMap::new()),
            local: server_id,
            next_message_id: AtomicU64::new(0),
        });
        client_end
            .peer
            .set(Arc::downgrade(&server_end))
            .ok()
            .expect("peer set once");
        server_end
            .peer
            .set(Arc::downgrade(&client_end))
            .ok()
            .expect("peer set once");
        (client_end, server_end)
    }
}

#[async_trait]
impl E2eConnection for MemoryConnection {
    async fn send(&self, message_type: u8, payload: Vec<u8>) -> Result<SendReport, TransportError> {
        let peer = self
            .peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::SendFailed("peer gone".to_string()))?;

        let listener = peer.listeners.read().get(&message_type).cloned();
        let Some(listener) = listener else {
            return Err(TransportError::SendFailed(format!(
                "no listener for message type {message_type}"
            )));
        };

        let message = IncomingMessage {
            sender: self.local.clone(),
            payload,
        };
        // Deliver on a fresh task so a send never re-enters the caller.
        tokio::spawn(async move { listener.hear(message) });

        Ok(SendReport {
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
            rounds: Vec::new(),
        })
    }

    fn register_listener(&self, message_type: u8, listener: Arc<dyn E2eListener>) {
        self.listeners.write().insert(message_type, listener);
    }

    fn partner(&self) -> String {
        self.partner.clone()
    }
}
