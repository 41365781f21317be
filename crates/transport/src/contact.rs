//! Serialised peer identities.

use serde::{Deserialize, Serialize};

use crate::TransportError;

/// A peer's serialised identity, as written to and read from contact
/// files. Opaque to everything above the transport: the dispatcher and
/// trackers only pass it back into [`crate::MixClient`] calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    /// Stable peer identity.
    id: String,
    /// Backend-specific reachability data. Empty for the in-process
    /// backend; a socket address for the socket backend.
    #[serde(default)]
    address: String,
}

impl Contact {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }

    /// Parse a contact from the bytes of a contact file.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(data).map_err(|e| TransportError::InvalidContact(e.to_string()))
    }

    /// Serialise for writing to a contact file.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).expect("contact serializes")
    }

    /// Load a contact file from disk.
    pub fn load(path: &std::path::Path) -> Result<Self, TransportError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_file_round_trip() {
        let contact = Contact::new("relay-1", "127.0.0.1:7001");
        let parsed = Contact::from_bytes(&contact.to_bytes()).unwrap();
        assert_eq!(parsed, contact);
        assert_eq!(parsed.id(), "relay-1");
        assert_eq!(parsed.address(), "127.0.0.1:7001");
    }

    #[test]
    fn test_invalid_contact_bytes() {
        assert!(matches!(
            Contact::from_bytes(b"\x00\x01garbage"),
            Err(TransportError::InvalidContact(_))
        ));
    }

    #[test]
    fn test_missing_address_defaults_empty() {
        let parsed = Contact::from_bytes(br#"{"id":"relay-2"}"#).unwrap();
        assert_eq!(parsed.address(), "");
    }
}
