//! Header list codec for the `/proxy` forwarding path.
//!
//! HTTP headers cross the mixnet as a JSON array of `{key, values}` pairs.
//! The request carries two synthetic entries naming the target URL and
//! method; the reply carries one naming the upstream status code.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::CodecError;

/// Synthetic request header carrying the absolute target URL.
pub const PROXY_URL_HEADER: &str = "X-PROXXY-URL";
/// Synthetic request header carrying the HTTP method name.
pub const PROXY_METHOD_HEADER: &str = "X-PROXXY-METHOD";
/// Synthetic response header carrying the upstream status as decimal text.
pub const PROXY_RESPCODE_HEADER: &str = "X-PROXXY-RESPCODE";

/// One HTTP header with all of its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub values: Vec<String>,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: vec![value.into()],
        }
    }
}

/// Encode a header list as JSON bytes for an envelope `headers` field.
pub fn encode(headers: &[Header]) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(headers)?)
}

/// Decode a header list from an envelope `headers` field.
pub fn decode(data: &[u8]) -> Result<Vec<Header>, CodecError> {
    Ok(serde_json::from_slice(data)?)
}

/// Fold a decoded header list into a canonical header map.
///
/// Entries with names or values that are not valid HTTP are skipped.
pub fn to_header_map(headers: &[Header]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for header in headers {
        let Ok(name) = HeaderName::from_bytes(header.key.as_bytes()) else {
            continue;
        };
        for value in &header.values {
            if let Ok(value) = HeaderValue::from_str(value) {
                map.append(name.clone(), value);
            }
        }
    }
    map
}

/// Flatten a header map back into a header list, grouping values by name.
pub fn from_header_map(map: &HeaderMap) -> Vec<Header> {
    let mut headers: Vec<Header> = Vec::with_capacity(map.keys_len());
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match headers.iter_mut().find(|h| h.key == name.as_str()) {
            Some(existing) => existing.values.push(value),
            None => headers.push(Header {
                key: name.as_str().to_string(),
                values: vec![value],
            }),
        }
    }
    headers
}
