//! Well-known URIs on the relay's endpoint registry.

/// GET returns the JSON array of registered network URIs.
pub const NETWORKS_URI: &str = "/networks";

/// POST queries a caller-supplied HTTPS endpoint named in the request
/// headers.
pub const CUSTOM_URI: &str = "/custom";

/// POST forwards a reconstructed HTTP request to an arbitrary URL.
pub const PROXY_URI: &str = "/proxy";
