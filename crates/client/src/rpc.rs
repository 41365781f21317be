//! The local JSON-RPC listener.
//!
//! Wallets that speak plain JSON-RPC point at this listener and select
//! the chain by path: `POST /ethereum/goerli`, `POST /custom/<url>`, and
//! so on. The body travels opaque through the dispatcher; the reply is
//! the upstream body with the upstream status.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::listener::LocalServer;
use crate::parse::{read_request, write_simple_response};
use crate::{Dispatcher, Result};

/// Local JSON-RPC ingress routing by request path.
pub struct RpcProxy {
    dispatcher: Arc<Dispatcher>,
    server: LocalServer,
}

impl RpcProxy {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            server: LocalServer::new("rpc"),
        })
    }

    /// Bind and serve on `127.0.0.1:port`; port 0 picks a free one.
    pub async fn start(self: &Arc<Self>, port: u16) -> Result<SocketAddr> {
        let this = self.clone();
        self.server
            .start(port, move |stream| {
                let this = this.clone();
                async move {
                    if let Err(error) = this.serve_connection(stream).await {
                        debug!(%error, "rpc connection error");
                    }
                }
            })
            .await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub async fn stop(&self) -> Result<()> {
        self.server.stop().await
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> Result<()> {
        let Some(request) = read_request(&mut stream).await? else {
            return Ok(());
        };

        if request.body.is_empty() {
            warn!("empty body request");
            write_simple_response(&mut stream, 400, b"").await?;
            return Ok(());
        }

        info!(target = %request.target, "rpc request");
        match self.dispatcher.request(&request.target, request.body).await {
            Ok((code, content)) => {
                write_simple_response(&mut stream, code, &content).await?;
            }
            Err(error) => {
                error!(%error, "request returned an error");
                write_simple_response(&mut stream, error.status(), error.to_string().as_bytes())
                    .await?;
            }
        }
        Ok(())
    }
}
