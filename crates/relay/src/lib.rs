//! Mixgate relay server
//!
//! The exit side of the proxy. A relay has a stable mixnet identity,
//! serves a registry of blockchain JSON-RPC endpoints keyed by URI,
//! forwards `/proxy` envelopes to arbitrary HTTP URLs, and carries
//! CONNECT tunnels to raw TCP peers.
//!
//! Components:
//! - [`config`]: the networks configuration file and its change watcher.
//! - [`registry`]: per-URI handler registration, endpoint probing, and
//!   live reload.
//! - [`network`]: the JSON-RPC query executor, including `/custom`.
//! - [`forwarder`]: the `/proxy` HTTP forwarder.
//! - [`tunnel`]: the relay end of CONNECT tunnels.
//! - [`metrics`]: per-URI Prometheus counters and the metrics listener.

pub mod config;
pub mod forwarder;
pub mod metrics;
pub mod network;
pub mod registry;
pub mod tunnel;

pub use config::{load_networks, ConfigWatcher, NetworksConfig, SubnetConfig};
pub use forwarder::HttpForwarder;
pub use metrics::{MetricsHub, MetricsServer};
pub use registry::NetworkManager;
pub use tunnel::ConnectServer;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid networks file: {0}")]
    ParseConfig(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] mixgate_transport::TransportError),

    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
