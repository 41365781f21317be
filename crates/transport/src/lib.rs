//! Mixnet transport contract
//!
//! The anonymising transport itself lives outside this repository; this
//! crate pins down the contract the rest of the system consumes:
//!
//! - [`MixClient`]: the client half, single-use request/response plus
//!   persistent end-to-end connections with typed listeners.
//! - [`RestServer`]: the relay half, an [`Endpoints`] registry of
//!   per-URI handlers and a hook for incoming end-to-end connections.
//! - [`Contact`]: the serialised identity of a peer.
//!
//! Two in-tree backends implement the contract: [`memory`] wires both
//! halves together inside one process (tests, the `dev` command) and
//! [`socket`] carries the same frames over a local TCP socket so the two
//! roles can run as separate processes during development.

pub mod contact;
pub mod endpoints;
pub mod memory;
pub mod socket;

pub use contact::Contact;
pub use endpoints::{Endpoints, RestHandler};

use std::sync::Arc;

use async_trait::async_trait;
use mixgate_core::{RequestEnvelope, ResponseEnvelope};
use thiserror::Error;

/// How long to wait for the transport to report healthy on startup.
pub const STARTUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid contact data: {0}")]
    InvalidContact(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("transport not started")]
    NotStarted,

    #[error("timed out waiting for network health")]
    StartupTimeout,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] mixgate_core::CodecError),
}

/// Delivery report for an end-to-end send.
#[derive(Debug, Clone, Default)]
pub struct SendReport {
    pub message_id: u64,
    pub rounds: Vec<u64>,
}

/// A message delivered to a registered listener.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Identity of the sending peer, for logging.
    pub sender: String,
    pub payload: Vec<u8>,
}

/// Receiver of end-to-end messages for one message-type tag.
pub trait E2eListener: Send + Sync {
    fn hear(&self, message: IncomingMessage);

    /// Used for logging only.
    fn name(&self) -> &str;
}

/// A persistent bidirectional connection to one peer.
#[async_trait]
pub trait E2eConnection: Send + Sync {
    async fn send(&self, message_type: u8, payload: Vec<u8>)
        -> Result<SendReport, TransportError>;

    fn register_listener(&self, message_type: u8, listener: Arc<dyn E2eListener>);

    /// Identity of the remote peer, for logging.
    fn partner(&self) -> String;
}

/// Callback invoked on network health transitions.
pub type HealthCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Client half of the transport.
#[async_trait]
pub trait MixClient: Send + Sync {
    /// Start the network follower and block until the network reports
    /// healthy, bounded by [`STARTUP_TIMEOUT`].
    async fn start(&self) -> Result<(), TransportError>;

    async fn stop(&self);

    /// Subscribe to health transitions. Callbacks fire on every change.
    fn add_health_callback(&self, callback: HealthCallback);

    /// Send a single-use request and wait for its one reply. Each call
    /// uses a fresh ephemeral reception identity.
    async fn request(
        &self,
        contact: &Contact,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, TransportError>;

    /// Open a persistent end-to-end connection to a peer.
    async fn connect(&self, contact: &Contact) -> Result<Arc<dyn E2eConnection>, TransportError>;
}

/// Handler for end-to-end connections arriving at a server.
pub trait ConnectionHandler: Send + Sync {
    fn connected(&self, connection: Arc<dyn E2eConnection>);
}

/// Relay half of the transport.
#[async_trait]
pub trait RestServer: Send + Sync {
    /// The live endpoint registry; handlers may be added and removed
    /// while the server runs.
    fn endpoints(&self) -> Arc<Endpoints>;

    /// Accept incoming end-to-end connections with `handler`.
    fn set_connection_handler(&self, handler: Arc<dyn ConnectionHandler>);

    /// Start serving and block until the network reports healthy,
    /// bounded by [`STARTUP_TIMEOUT`].
    async fn start(&self) -> Result<(), TransportError>;

    async fn stop(&self);
}
