//! Protocol error strings shared by both sides of the proxy.
//!
//! These strings cross the wire in response envelopes and reach end users,
//! so both sides and the tests reference these constants rather than
//! re-typing them.

/// No active relay advertises the requested network URI. Status 400.
pub const ERR_UNSUPPORTED_NETWORK: &str = "unsupported network";

/// No relay is currently reachable at all. Status 500.
pub const ERR_NO_ACTIVE_RELAYS: &str = "no active relays";

/// The retry budget ran out without a successful mixnet round trip.
/// Status 500.
pub const ERR_RETRIES_EXHAUSTED: &str = "request exhausted number of retries";

/// A JSON-RPC request arrived with an empty body.
pub const ERR_EMPTY_CONTENT: &str = "Request content cannot be empty";

/// A `/custom` request carried no parseable HTTPS URL in its headers.
pub const ERR_CUSTOM_INVALID_URL: &str =
    "Request doesn't have a valid custom endpoint URL in request Headers";

/// The `/custom` target URL failed the reachability probe.
pub const ERR_CUSTOM_UNREACHABLE: &str = "Provided custom endpoint URL is unreachable";

/// Prefix for upstream JSON-RPC failures reported by the relay.
pub const ERR_RPC_QUERY_PREFIX: &str = "Error in JSON-RPC query";

/// Relay-internal failure while building a reply.
pub const ERR_INTERNAL: &str = "Internal server error";
