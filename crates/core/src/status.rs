//! Little-endian status-code codec for JSON-RPC reply headers.
//!
//! JSON-RPC replies squeeze the upstream HTTP status into the first two
//! bytes of the envelope's `headers` field. Anything shorter decodes to
//! `None` and callers fall back to 500.

/// Encode a status code as two little-endian bytes.
pub fn encode(code: u16) -> [u8; 2] {
    code.to_le_bytes()
}

/// Decode a status code from the first two bytes of `headers`.
pub fn decode(headers: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = headers.get(..2)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

/// Decode a status code, defaulting to 500 when absent.
pub fn decode_or_server_error(headers: &[u8]) -> u16 {
    decode(headers).unwrap_or(500)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_codes() {
        for code in [0u16, 1, 200, 400, 404, 500, 599, u16::MAX] {
            assert_eq!(decode(&encode(code)), Some(code));
        }
    }

    #[test]
    fn test_short_headers_decode_to_none() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(&[0xc8]), None);
        assert_eq!(decode_or_server_error(&[]), 500);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut headers = encode(204).to_vec();
        headers.extend_from_slice(b"junk");
        assert_eq!(decode(&headers), Some(204));
    }
}
