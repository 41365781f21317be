//! Mixgate client
//!
//! The user-side half of the proxy. Exposes a plain HTTP(S) proxy on
//! localhost, packages each incoming request as a single-use mixnet
//! message, dispatches it to one of the configured relay servers, and
//! returns the reply. CONNECT requests become tunnels: ordered byte
//! streams carried over end-to-end mixnet messages.
//!
//! Components, leaves first:
//! - [`tracker`]: one health loop per configured relay, probing
//!   `/networks` and keeping that relay's supported-network set.
//! - [`dispatcher`]: relay selection, retry rotation, and the
//!   single-use request path.
//! - [`proxy`]: the local HTTP proxy listener (normal requests and
//!   CONNECT hand-off).
//! - [`rpc`]: the local JSON-RPC listener routing by request path.
//! - [`tunnel`]: the client end of CONNECT tunnels.

pub mod dispatcher;
mod listener;
pub mod parse;
pub mod proxy;
pub mod rpc;
pub mod tracker;
pub mod tunnel;

pub use dispatcher::{Dispatcher, DispatcherConfig, RelayInfo};
pub use proxy::HttpProxy;
pub use rpc::RpcProxy;
pub use tracker::RelayTracker;
pub use tunnel::TunnelSession;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// No relay is currently reachable. Maps to HTTP 500.
    #[error("no active relays")]
    NoActiveRelays,

    /// No active relay advertises the requested URI. Maps to HTTP 400.
    #[error("unsupported network")]
    UnsupportedNetwork,

    /// Every attempt in the retry budget failed. Maps to HTTP 500.
    #[error("request exhausted number of retries")]
    RetriesExhausted,

    /// The relay answered with an error envelope.
    #[error("response error: {message}")]
    Response { code: u16, message: String },

    #[error(transparent)]
    Transport(#[from] mixgate_transport::TransportError),

    #[error(transparent)]
    Tunnel(#[from] mixgate_tunnel::TunnelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,
}

impl ClientError {
    /// The HTTP status this error surfaces as on the local proxy.
    pub fn status(&self) -> u16 {
        match self {
            ClientError::UnsupportedNetwork => 400,
            ClientError::Response { code, .. } => *code,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
