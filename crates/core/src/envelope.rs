//! Request and response envelopes carried as mixnet payloads.
//!
//! One envelope maps to one single-use mixnet round trip. The `headers`
//! field is deliberately opaque bytes: its interpretation depends on the
//! URI (see [`crate::headers`] and [`crate::status`]).

use serde::{Deserialize, Serialize};

/// Request verb understood by the relay-side endpoint registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    #[default]
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// A single request sent to a relay over the mixnet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: Method,
    pub uri: String,
    /// Opaque body bytes, typically a JSON-RPC payload.
    #[serde(with = "crate::base64_bytes")]
    pub data: Vec<u8>,
    /// Opaque header bytes. For `/custom` this is the target HTTPS URL,
    /// for `/proxy` a JSON header list, otherwise empty.
    #[serde(with = "crate::base64_bytes")]
    pub headers: Vec<u8>,
}

impl RequestEnvelope {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            data: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_headers(mut self, headers: Vec<u8>) -> Self {
        self.headers = headers;
        self
    }
}

/// The reply to a [`RequestEnvelope`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Opaque body bytes.
    #[serde(with = "crate::base64_bytes")]
    pub content: Vec<u8>,
    /// Opaque header bytes. For JSON-RPC replies a 2-byte little-endian
    /// status code, for `/proxy` replies a JSON header list.
    #[serde(with = "crate::base64_bytes")]
    pub headers: Vec<u8>,
    /// Human-readable error description, empty on success.
    #[serde(default)]
    pub error: String,
}

impl ResponseEnvelope {
    /// A successful reply carrying `content` and a status code.
    pub fn with_status(content: Vec<u8>, code: u16) -> Self {
        Self {
            content,
            headers: crate::status::encode(code).to_vec(),
            error: String::new(),
        }
    }

    /// A failed reply carrying an error string and a status code.
    pub fn error(message: impl Into<String>, code: u16) -> Self {
        Self {
            content: Vec::new(),
            headers: crate::status::encode(code).to_vec(),
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
