//! Mixgate core wire types
//!
//! Shared types for the request/response envelopes carried over the mixnet,
//! the header and status codecs used by the HTTP forwarding path, and the
//! tunnel message format used by CONNECT tunnels.
//!
//! Everything in this crate is pure data: no I/O, no tasks. Both sides of
//! the proxy (client and relay) depend on it, so wire compatibility lives
//! here and nowhere else.

pub mod envelope;
pub mod errors;
pub mod headers;
pub mod status;
pub mod tunnel;
pub mod uris;

pub mod base64_bytes;

pub use envelope::{Method, RequestEnvelope, ResponseEnvelope};
pub use headers::{Header, PROXY_METHOD_HEADER, PROXY_RESPCODE_HEADER, PROXY_URL_HEADER};
pub use tunnel::{TunnelCommand, TunnelMessage, TUNNEL_MSG_TYPE};
pub use uris::{CUSTOM_URI, NETWORKS_URI, PROXY_URI};

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header name or value")]
    InvalidHeader,
}
