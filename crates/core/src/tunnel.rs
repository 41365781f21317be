//! Tunnel message format for CONNECT byte streams.
//!
//! Tunnel traffic rides end-to-end mixnet messages as JSON. Messages are
//! unordered on the wire; the per-direction `counter` restores ordering at
//! the receiver.

use serde::{Deserialize, Serialize};

/// Mixnet message type tag for tunnel traffic.
pub const TUNNEL_MSG_TYPE: u8 = 3;

/// Tunnel control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelCommand {
    /// Open a connection; `data` carries the `host:port` target.
    Connect,
    /// Relay accepted the connection.
    Ack,
    /// Raw TCP bytes in `data`.
    Data,
    /// Tear the connection down.
    Close,
}

/// One tunnel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    pub command: TunnelCommand,
    pub id: u32,
    #[serde(with = "crate::base64_bytes", default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub counter: u32,
}

impl TunnelMessage {
    pub fn connect(id: u32, target: &str) -> Self {
        Self {
            command: TunnelCommand::Connect,
            id,
            data: target.as_bytes().to_vec(),
            counter: 0,
        }
    }

    pub fn ack(id: u32) -> Self {
        Self {
            command: TunnelCommand::Ack,
            id,
            data: Vec::new(),
            counter: 0,
        }
    }

    pub fn data(id: u32, counter: u32, data: Vec<u8>) -> Self {
        Self {
            command: TunnelCommand::Data,
            id,
            data,
            counter,
        }
    }

    pub fn close(id: u32, counter: u32) -> Self {
        Self {
            command: TunnelCommand::Close,
            id,
            data: Vec::new(),
            counter,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("tunnel message serializes")
    }

    pub fn decode(payload: &[u8]) -> Result<Self, crate::CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_names() {
        let message = TunnelMessage::connect(7, "example.com:443");
        let json = String::from_utf8(message.encode()).unwrap();
        assert!(json.contains("\"command\":\"connect\""));
        assert!(json.contains("\"id\":7"));

        assert!(String::from_utf8(TunnelMessage::ack(0).encode())
            .unwrap()
            .contains("\"ack\""));
        assert!(String::from_utf8(TunnelMessage::close(0, 3).encode())
            .unwrap()
            .contains("\"close\""));
    }

    #[test]
    fn test_data_round_trip() {
        let message = TunnelMessage::data(1, 42, vec![0x00, 0xff, 0x7f]);
        let decoded = TunnelMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.counter, 42);
    }

    #[test]
    fn test_connect_target_is_payload() {
        let message = TunnelMessage::connect(0, "example.com:443");
        let decoded = TunnelMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.data, b"example.com:443");
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let err = TunnelMessage::decode(br#"{"command":"open","id":0,"data":"","counter":0}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_counter_defaults_to_zero() {
        let decoded = TunnelMessage::decode(br#"{"command":"ack","id":9,"data":""}"#).unwrap();
        assert_eq!(decoded.counter, 0);
        assert_eq!(decoded.command, TunnelCommand::Ack);
    }
}
