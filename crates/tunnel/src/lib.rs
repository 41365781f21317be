//! Ordered byte streams over unordered mixnet messages.
//!
//! A CONNECT tunnel pairs one TCP socket with one stream of end-to-end
//! mixnet messages. The mixnet delivers messages out of order, so each
//! side stamps outbound `data` with a monotonically increasing counter and
//! holds inbound messages in a reorder buffer until the next expected
//! counter arrives. [`TunnelConn`] implements the per-connection machinery
//! shared by both sides of the proxy; the client and relay crates wrap it
//! with their session management.

mod conn;

pub use conn::{RemoveFn, TunnelConn};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("tunnel send failed: {0}")]
    Send(#[from] mixgate_transport::TransportError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("connection already stopped")]
    Stopped,
}
