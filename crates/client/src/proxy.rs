//! The local HTTP proxy.
//!
//! Ordinary requests are packed whole (headers, method, absolute URL,
//! body) into a `/proxy` envelope and answered from the relay's reply.
//! CONNECT requests hand their socket to the tunnel session.

use std::net::SocketAddr;
use std::sync::Arc;

use mixgate_core::headers::{self, Header};
use mixgate_core::{PROXY_METHOD_HEADER, PROXY_RESPCODE_HEADER, PROXY_URL_HEADER};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::listener::LocalServer;
use crate::parse::{read_request, write_response, write_simple_response, ParsedRequest};
use crate::{Dispatcher, Result, TunnelSession};

/// Local HTTP(S) proxy server.
pub struct HttpProxy {
    dispatcher: Arc<Dispatcher>,
    tunnels: Option<Arc<TunnelSession>>,
    server: LocalServer,
}

impl HttpProxy {
    /// `tunnels` is optional: without a tunnel session CONNECT requests
    /// are refused with 501.
    pub fn new(dispatcher: Arc<Dispatcher>, tunnels: Option<Arc<TunnelSession>>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            tunnels,
            server: LocalServer::new("proxy"),
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
                        debug!(%error, "proxy connection error");
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

        if request.method == "CONNECT" {
            match &self.tunnels {
                Some(session) => {
                    let target = request.target.clone();
                    session.handle_connect(stream, target).await;
                }
                None => {
                    warn!("CONNECT received but tunnelling is not configured");
                    write_simple_response(&mut stream, 501, b"CONNECT not supported").await?;
                }
            }
            return Ok(());
        }

        self.forward_request(&mut stream, request).await
    }

    async fn forward_request(&self, stream: &mut TcpStream, request: ParsedRequest) -> Result<()> {
        info!(method = %request.method, target = %request.target, "proxying request");

        // Addressed by path means the proxy was used as the origin; the
        // Host header then names the real target.
        let url = if request.target.starts_with('/') {
            format!("{}{}", request.host().unwrap_or_default(), request.target)
        } else {
            request.target.clone()
        };

        let mut header_list = headers::from_header_map(&request.headers);
        header_list.push(Header::new(PROXY_URL_HEADER, url));
        header_list.push(Header::new(PROXY_METHOD_HEADER, request.method.as_str()));
        let header_json = match headers::encode(&header_list) {
            Ok(header_json) => header_json,
            Err(error) => {
                error!(%error, "error marshalling headers");
                write_simple_response(stream, 500, b"").await?;
                return Ok(());
            }
        };

        let response = match self.dispatcher.request_proxy(request.body, header_json).await {
            Ok(response) => response,
            Err(error) => {
                error!(%error, "request error");
                write_simple_response(stream, error.status(), error.to_string().as_bytes())
                    .await?;
                return Ok(());
            }
        };

        // No headers at all means the relay failed before it could even
        // report a status.
        if response.headers.is_empty() {
            error!("no headers in response");
            write_simple_response(stream, 500, b"").await?;
            return Ok(());
        }
        let header_list = match headers::decode(&response.headers) {
            Ok(header_list) => header_list,
            Err(error) => {
                error!(%error, "error unmarshalling response headers");
                write_simple_response(stream, 500, b"").await?;
                return Ok(());
            }
        };
        let mut header_map = headers::to_header_map(&header_list);
        let code = header_map
            .get(PROXY_RESPCODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(500);
        header_map.remove(PROXY_RESPCODE_HEADER);

        write_response(stream, code, &header_map, &response.content).await?;
        Ok(())
    }
}
