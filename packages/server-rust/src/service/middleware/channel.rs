//! Middleware channel names.
//!
//! The bootstrap set is created with every pipeline; services may register
//! more at runtime. Names are case-insensitive and stored upper-cased.

/// Inbound request, before the service's dispatch entry runs.
pub const REQUEST: &str = "REQUEST";
/// Outbound response, after the service's dispatch entry returns.
pub const RESPONSE: &str = "RESPONSE";
/// Api call envelope before the handler runs.
pub const PRE_API_CALL: &str = "PRE_API_CALL";
/// Api call envelope after the handler returns.
pub const POST_API_CALL: &str = "POST_API_CALL";

/// Channels every pipeline starts with, in creation order.
pub const BOOTSTRAP_CHANNELS: [&str; 4] = [REQUEST, RESPONSE, PRE_API_CALL, POST_API_CALL];

/// Canonical form of a channel name.
#[must_use]
pub fn normalize(channel: &str) -> String {
    channel.trim().to_ascii_uppercase()
}
