//! The `/proxy` forwarder.
//!
//! Rebuilds a full HTTP request from the envelope (URL and method from
//! the synthetic headers, remaining headers and body as-is), performs it,
//! and packs the upstream response back: every response header plus the
//! synthetic `X-PROXXY-RESPCODE` carrying the status.

use async_trait::async_trait;
use mixgate_core::headers::{self, Header};
use mixgate_core::{
    RequestEnvelope, ResponseEnvelope, PROXY_METHOD_HEADER, PROXY_RESPCODE_HEADER,
    PROXY_URL_HEADER,
};
use mixgate_transport::RestHandler;
use tracing::{error, info};

pub struct HttpForwarder {
    http: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn forward(
        &self,
        header_map: &http::HeaderMap,
        body: Vec<u8>,
    ) -> Result<(Vec<Header>, Vec<u8>, u16), String> {
        let url = header_map
            .get(PROXY_URL_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or("missing target URL header")?;
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("http://{url}")
        };
        let method = header_map
            .get(PROXY_METHOD_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|error| error.to_string())?;

        let mut upstream_headers = header_map.clone();
        for name in [
            PROXY_URL_HEADER,
            PROXY_METHOD_HEADER,
            "host",
            "content-length",
            "connection",
            "proxy-connection",
        ] {
            upstream_headers.remove(name);
        }

        info!(%method, %url, "performing HTTP request");
        let response = self
            .http
            .request(method, &url)
            .headers(upstream_headers)
            .body(body)
            .send()
            .await
            .map_err(|error| error.to_string())?;

        let code = response.status().as_u16();
        let response_headers = headers::from_header_map(response.headers());
        let content = response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default();
        Ok((response_headers, content, code))
    }
}

#[async_trait]
impl RestHandler for HttpForwarder {
    async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        info!("request received over mixnet");

        let mut response_headers: Vec<Header> = Vec::new();
        let mut content = Vec::new();
        // 400 until the envelope parses, 500 for upstream failures.
        let mut code = "400".to_string();

        match headers::decode(&request.headers) {
            Err(error) => {
                error!(%error, "error parsing request headers");
            }
            Ok(header_list) => {
                let header_map = headers::to_header_map(&header_list);
                match self.forward(&header_map, request.data).await {
                    Err(error) => {
                        error!(%error, "error performing HTTP request");
                        code = "500".to_string();
                    }
                    Ok((upstream_headers, body, status)) => {
                        response_headers = upstream_headers;
                        content = body;
                        code = status.to_string();
                    }
                }
            }
        }

        response_headers.push(Header::new(PROXY_RESPCODE_HEADER, code));
        let headers = match headers::encode(&response_headers) {
            Ok(headers) => headers,
            Err(error) => {
                // The client reads empty headers as an internal error.
                error!(%error, "error marshalling response headers");
                Vec::new()
            }
        };

        ResponseEnvelope {
            content,
            headers,
            error: String::new(),
        }
    }
}
