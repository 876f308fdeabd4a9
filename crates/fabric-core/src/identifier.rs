//! Message identifiers
//!
//! An [`Identifier`] packs the issuing peer's connection id into the top 16
//! bits and a per-provider sequence number into the low 48 bits. Receivers
//! split it back apart to run the replay window per connection id.

use core::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Width of the sequence field
pub const SEQUENCE_BITS: u32 = 48;

/// Mask selecting the sequence field
pub const SEQUENCE_MASK: u64 = (1u64 << SEQUENCE_BITS) - 1;

/// Fold an arbitrary integer into the signed 16-bit connection id range
pub fn normalize_connection_id(raw: i64) -> i16 {
    // two's complement truncation is a modular rollover
    raw as i16
}

// ----------------------------------------------------------------------------
// Identifier
// ----------------------------------------------------------------------------

/// Combined (connection id, sequence) message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(i64);

impl Identifier {
    /// Combine a connection id and a sequence number
    pub fn compose(connection_id: i16, sequence: u64) -> Self {
        let high = (connection_id as i64) << SEQUENCE_BITS;
        Self(high | (sequence & SEQUENCE_MASK) as i64)
    }

    /// Wrap a raw wire value
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Raw wire value
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Connection id of the issuing provider
    pub fn connection_id(&self) -> i16 {
        // arithmetic shift keeps the sign of negative connection ids
        (self.0 >> SEQUENCE_BITS) as i16
    }

    /// Sequence number within the issuing provider
    pub fn sequence(&self) -> u64 {
        (self.0 as u64) & SEQUENCE_MASK
    }

    /// Split into `(connection_id, sequence)`
    pub fn parts(&self) -> (i16, u64) {
        (self.connection_id(), self.sequence())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id(), self.sequence())
    }
}

// ----------------------------------------------------------------------------
// Providers
// ----------------------------------------------------------------------------

/// Issues strictly increasing identifiers for one connection id
#[derive(Debug)]
pub struct IdProvider {
    connection_id: i16,
    next_sequence: u64,
}

impl IdProvider {
    /// Create a provider; the connection id is normalized into 16 bits
    pub fn new(connection_id: i64) -> Self {
        Self {
            connection_id: normalize_connection_id(connection_id),
            next_sequence: 0,
        }
    }

    pub fn connection_id(&self) -> i16 {
        self.connection_id
    }

    /// Issue the next identifier
    pub fn next_id(&mut self) -> Identifier {
        let id = Identifier::compose(self.connection_id, self.next_sequence);
        self.next_sequence = (self.next_sequence + 1) & SEQUENCE_MASK;
        id
    }

    /// Inverse of [`IdProvider::next_id`]
    pub fn parse(combined: i64) -> (i16, u64) {
        Identifier::from_raw(combined).parts()
    }
}

/// Thread-safe provider shared by several connections
#[derive(Debug)]
pub struct IdSource {
    inner: Mutex<IdProvider>,
}

impl IdSource {
    pub fn new(connection_id: i64) -> Self {
        Self {
            inner: Mutex::new(IdProvider::new(connection_id)),
        }
    }

    pub fn connection_id(&self) -> i16 {
        self.lock().connection_id()
    }

    pub fn next_id(&self) -> Identifier {
        self.lock().next_id()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdProvider> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_starts_at_zero() {
        let mut provider = IdProvider::new(7);
        let first = provider.next_id();
        let second = provider.next_id();
        assert_eq!(first.parts(), (7, 0));
        assert_eq!(second.parts(), (7, 1));
    }

    #[test]
    fn test_negative_connection_id_round_trips() {
        let id = Identifier::compose(-3, 42);
        assert!(id.as_i64() < 0);
        assert_eq!(IdProvider::parse(id.as_i64()), (-3, 42));
    }

    #[test]
    fn test_connection_id_rollover() {
        assert_eq!(normalize_connection_id(32_768), i16::MIN);
        assert_eq!(normalize_connection_id(65_537), 1);
        assert_eq!(IdProvider::new(65_536).connection_id(), 0);
    }

    #[test]
    fn test_shared_source_never_repeats() {
        let source = std::sync::Arc::new(IdSource::new(1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let source = source.clone();
                std::thread::spawn(move || (0..250).map(|_| source.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = std::collections::HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate identifier {id}");
            }
        }
        assert_eq!(all.len(), 1000);
    }
}
