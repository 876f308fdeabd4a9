//! Replay defense
//!
//! Each receiving connection remembers the most recent sequence numbers it
//! accepted per sender connection id. A sequence already seen is a duplicate;
//! a sequence at or below the oldest retained one that also trails the newest
//! by more than the tolerance is stale. Anything else is accepted.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::config::ReplayConfig;
use crate::errors::ProtocolError;
use crate::identifier::Identifier;

// ----------------------------------------------------------------------------
// Verdicts
// ----------------------------------------------------------------------------

/// Outcome of a replay window check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    Accepted,
    Duplicate,
    Stale,
}

impl ReplayVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReplayVerdict::Accepted)
    }

    fn reason(&self) -> &'static str {
        match self {
            ReplayVerdict::Accepted => "accepted",
            ReplayVerdict::Duplicate => "duplicate sequence",
            ReplayVerdict::Stale => "sequence outside tolerance",
        }
    }
}

// ----------------------------------------------------------------------------
// Replay Window
// ----------------------------------------------------------------------------

/// Sliding window over one sender's sequence numbers
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    recent: BTreeSet<u64>,
    capacity: usize,
    tolerance: u64,
}

impl ReplayWindow {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            recent: BTreeSet::new(),
            capacity: config.capacity.max(1),
            tolerance: config.tolerance,
        }
    }

    /// Check a sequence and remember it when accepted
    pub fn check_and_record(&mut self, sequence: u64) -> ReplayVerdict {
        let (oldest, newest) = match (self.recent.first(), self.recent.last()) {
            (Some(&oldest), Some(&newest)) => (oldest, newest),
            _ => {
                self.recent.insert(sequence);
                return ReplayVerdict::Accepted;
            }
        };

        if self.recent.contains(&sequence) {
            return ReplayVerdict::Duplicate;
        }
        if sequence <= oldest && newest.saturating_sub(sequence) > self.tolerance {
            return ReplayVerdict::Stale;
        }

        self.recent.insert(sequence);
        while self.recent.len() > self.capacity {
            self.recent.pop_first();
        }
        ReplayVerdict::Accepted
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn newest(&self) -> Option<u64> {
        self.recent.last().copied()
    }

    pub fn oldest(&self) -> Option<u64> {
        self.recent.first().copied()
    }
}

// ----------------------------------------------------------------------------
// Per-connection Guard
// ----------------------------------------------------------------------------

/// Replay windows for every sender seen on one connection, keyed by connection id
#[derive(Debug)]
pub struct ReplayGuard {
    windows: HashMap<i16, ReplayWindow>,
    config: ReplayConfig,
}

impl ReplayGuard {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            windows: HashMap::new(),
            config,
        }
    }

    /// Accept or reject an inbound identifier
    pub fn check(&mut self, id: Identifier) -> Result<(), ProtocolError> {
        let (connection_id, sequence) = id.parts();
        let config = self.config;
        let verdict = self
            .windows
            .entry(connection_id)
            .or_insert_with(|| ReplayWindow::new(config))
            .check_and_record(sequence);

        if verdict.is_accepted() {
            Ok(())
        } else {
            Err(ProtocolError::ReplayRejected {
                connection_id,
                sequence,
                reason: verdict.reason(),
            })
        }
    }

    /// Forget everything remembered for one connection id
    pub fn reset(&mut self, connection_id: i16) {
        if self.windows.remove(&connection_id).is_some() {
            debug!("Reset replay window for connection id {}", connection_id);
        }
    }

    pub fn tracked_connections(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> ReplayWindow {
        ReplayWindow::new(ReplayConfig::default())
    }

    #[test]
    fn test_empty_window_accepts_anything() {
        let mut w = window();
        assert_eq!(w.check_and_record(1_000), ReplayVerdict::Accepted);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut w = window();
        assert!(w.check_and_record(5).is_accepted());
        assert_eq!(w.check_and_record(5), ReplayVerdict::Duplicate);
    }

    #[test]
    fn test_window_trims_to_capacity() {
        let mut w = window();
        for seq in 0..25 {
            assert!(w.check_and_record(seq).is_accepted());
        }
        assert_eq!(w.len(), 10);
        assert_eq!(w.oldest(), Some(15));
        assert_eq!(w.newest(), Some(24));
    }

    #[test]
    fn test_old_sequence_within_tolerance_accepted() {
        let mut w = window();
        for seq in 0..25 {
            w.check_and_record(seq);
        }
        // oldest retained is 15, newest 24: 14 trails by exactly the tolerance
        assert_eq!(w.check_and_record(14), ReplayVerdict::Accepted);
    }

    #[test]
    fn test_old_sequence_beyond_tolerance_rejected() {
        let mut w = window();
        for seq in 0..25 {
            w.check_and_record(seq);
        }
        assert_eq!(w.check_and_record(13), ReplayVerdict::Stale);
        assert_eq!(w.check_and_record(0), ReplayVerdict::Stale);
    }

    #[test]
    fn test_gap_above_newest_accepted() {
        let mut w = window();
        w.check_and_record(3);
        assert!(w.check_and_record(500).is_accepted());
    }

    #[test]
    fn test_guard_keys_windows_by_connection_id() {
        let mut guard = ReplayGuard::new(ReplayConfig::default());
        assert!(guard.check(Identifier::compose(1, 0)).is_ok());
        assert!(guard.check(Identifier::compose(2, 0)).is_ok());
        assert!(guard.check(Identifier::compose(1, 0)).is_err());
        assert_eq!(guard.tracked_connections(), 2);
    }

    #[test]
    fn test_guard_reset_forgets_window() {
        let mut guard = ReplayGuard::new(ReplayConfig::default());
        for seq in 0..30 {
            guard.check(Identifier::compose(4, seq)).unwrap();
        }
        assert!(guard.check(Identifier::compose(4, 0)).is_err());

        guard.reset(4);
        assert!(guard.check(Identifier::compose(4, 0)).is_ok());
    }
}
