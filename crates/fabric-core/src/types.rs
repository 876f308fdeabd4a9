//! Core shared types for the fabric protocol
//!
//! Well-known peer names and the millisecond timestamp used by replicated records.

use core::fmt;
use core::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Well-known Names
// ----------------------------------------------------------------------------

/// Name the hub answers to, both as a forward target and as a dispatch sender
pub const HUB_NAME: &str = "proxy";

/// Forward target meaning every leaf
pub const BROADCAST_TARGET: &str = "all";

/// Prefix for peer-to-peer key publication channels
pub const PEER_AUTH_CHANNEL_PREFIX: &str = "peer-auth:";

/// Channel name carrying a p2p key for a given context token
pub fn peer_auth_channel(token: &str) -> String {
    format!("{}{}", PEER_AUTH_CHANNEL_PREFIX, token)
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Get the raw millisecond value
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let earlier = Timestamp::new(1_000);
        let later = earlier + 250;
        assert_eq!(later - earlier, 250);
        assert_eq!(earlier - later, 0);
        assert!(later > earlier);
    }

    #[test]
    fn test_peer_auth_channel() {
        assert_eq!(peer_auth_channel("abc"), "peer-auth:abc");
    }
}
