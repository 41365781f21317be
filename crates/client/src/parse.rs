//! Minimal HTTP/1.x reading and writing over raw streams.
//!
//! The local proxy cannot sit behind a full HTTP server because CONNECT
//! needs to take the connection over, so requests are parsed by hand with
//! `httparse` and responses written directly. One request is served per
//! connection; every response carries `Connection: close`.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the request line plus header section.
pub const HEADER_SECTION_LIMIT: usize = 8192;

const MAX_HEADERS: usize = 64;

/// A fully read HTTP request.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    /// The request target exactly as received: origin-form (`/path`),
    /// absolute-form (`http://…`), or authority-form (`host:port`).
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Bytes read past the header section that are not part of the body.
    /// Relevant for CONNECT, where anything after the header section
    /// already belongs to the tunnel.
    pub leftover: Vec<u8>,
}

impl ParsedRequest {
    pub fn host(&self) -> Option<String> {
        self.headers
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn content_length(headers: &HeaderMap) -> usize {
        headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}

/// Read one request from `stream`. Returns `None` on a clean EOF before
/// any bytes arrive.
pub async fn read_request(
    stream: &mut (impl AsyncRead + Unpin),
) -> std::io::Result<Option<ParsedRequest>> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let (header_len, method, target, headers) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > HEADER_SECTION_LIMIT {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request header section too large",
            ));
        }

        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut header_storage);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(header_len)) => {
                let method = request.method.unwrap_or_default().to_string();
                let target = request.path.unwrap_or_default().to_string();
                let mut headers = HeaderMap::new();
                for header in request.headers.iter() {
                    let Ok(name) = HeaderName::from_bytes(header.name.as_bytes()) else {
                        continue;
                    };
                    let Ok(value) = HeaderValue::from_bytes(header.value) else {
                        continue;
                    };
                    headers.append(name, value);
                }
                break (header_len, method, target, headers);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(error) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid HTTP request: {error}"),
                ));
            }
        }
    };

    let mut rest = buf.split_off(header_len);

    if method == "CONNECT" {
        return Ok(Some(ParsedRequest {
            method,
            target,
            headers,
            body: Vec::new(),
            leftover: rest,
        }));
    }

    let content_length = ParsedRequest::content_length(&headers);
    while rest.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        rest.extend_from_slice(&chunk[..n]);
    }
    let leftover = rest.split_off(content_length.min(rest.len()));

    Ok(Some(ParsedRequest {
        method,
        target,
        headers,
        body: rest,
        leftover,
    }))
}

/// Write a response with headers and a body, closing the exchange.
///
/// Length-related and connection-management headers from `headers` are
/// replaced with our own: the body is written whole.
pub async fn write_response(
    stream: &mut (impl AsyncWrite + Unpin),
    code: u16,
    headers: &HeaderMap,
    body: &[u8],
) -> std::io::Result<()> {
    let reason = StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("");
    let mut out = format!("HTTP/1.1 {code} {reason}\r\n").into_bytes();

    for (name, value) in headers {
        if *name == http::header::CONTENT_LENGTH
            || *name == http::header::TRANSFER_ENCODING
            || *name == http::header::CONNECTION
        {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);

    stream.write_all(&out).await?;
    stream.flush().await
}

/// Write a bare response with no extra headers.
pub async fn write_simple_response(
    stream: &mut (impl AsyncWrite + Unpin),
    code: u16,
    body: &[u8],
) -> std::io::Result<()> {
    write_response(stream, code, &HeaderMap::new(), body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &[u8]) -> ParsedRequest {
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);
        client.write_all(raw).await.unwrap();
        client.shutdown().await.unwrap();
        read_request(&mut server).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_parse_post_with_body() {
        let request = parse(
            b"POST /ethereum/goerli HTTP/1.1\r\nHost: localhost:9296\r\nContent-Length: 7\r\n\r\n{\"a\":1}",
        )
        .await;
        assert_eq!(request.method, "POST");
        assert_eq!(request.target, "/ethereum/goerli");
        assert_eq!(request.host().as_deref(), Some("localhost:9296"));
        assert_eq!(request.body, b"{\"a\":1}");
        assert!(request.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_parse_connect() {
        let request =
            parse(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").await;
        assert_eq!(request.method, "CONNECT");
        assert_eq!(request.target, "example.com:443");
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_parse_absolute_form() {
        let request = parse(b"GET http://example.com/page HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await;
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "http://example.com/page");
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_eof_before_request_returns_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert!(read_request(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort")
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        assert!(read_request(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_write_response_sets_length_and_close() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut headers = HeaderMap::new();
        headers.insert("x-upstream", HeaderValue::from_static("yes"));
        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_static("999"),
        );
        write_response(&mut client, 200, &headers, b"hello").await.unwrap();
        drop(client);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("x-upstream: yes\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.contains("999"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("hello"));
    }
}
