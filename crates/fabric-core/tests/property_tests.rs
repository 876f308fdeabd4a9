//! Property-based tests for identifiers and the replay window
//!
//! These tests verify identifier round-trips and stress the replay window
//! with reordering right at the tolerance boundary.

use fabric_core::{
    identifier::{IdProvider, Identifier, SEQUENCE_MASK},
    ReplayConfig, ReplayVerdict, ReplayWindow,
};
use proptest::prelude::*;

/// Generate arbitrary sequence numbers in the 48-bit range
fn arb_sequence() -> impl Strategy<Value = u64> {
    0u64..=SEQUENCE_MASK
}

/// Generate arbitrary replay window sizing
fn arb_replay_config() -> impl Strategy<Value = ReplayConfig> {
    (1usize..=20, 0u64..=20).prop_map(|(capacity, tolerance)| ReplayConfig {
        capacity,
        tolerance,
    })
}

/// Deliver `0..len` with every element displaced by at most `max_displacement`
fn bounded_reordering(len: u64, max_displacement: u64, keys: &[u32]) -> Vec<u64> {
    let chunk = (max_displacement + 1) as usize;
    let mut order: Vec<u64> = (0..len).collect();
    for block in order.chunks_mut(chunk) {
        block.sort_by_key(|seq| keys[*seq as usize % keys.len()]);
    }
    order
}

proptest! {
    /// Property: parse(next()) returns the connection id and sequence that went in
    #[test]
    fn identifier_round_trips(connection_id in any::<i16>(), sequence in arb_sequence()) {
        let id = Identifier::compose(connection_id, sequence);
        prop_assert_eq!(IdProvider::parse(id.as_i64()), (connection_id, sequence));
        prop_assert_eq!(Identifier::from_raw(id.as_i64()), id);
    }

    /// Property: one provider issues strictly increasing, never repeated sequences
    #[test]
    fn provider_sequences_strictly_increase(raw_id in any::<i64>(), count in 1usize..500) {
        let mut provider = IdProvider::new(raw_id);
        let mut last: Option<u64> = None;
        for _ in 0..count {
            let id = provider.next_id();
            prop_assert_eq!(id.connection_id(), raw_id as i16);
            if let Some(previous) = last {
                prop_assert!(id.sequence() > previous);
            }
            last = Some(id.sequence());
        }
    }

    /// Property: reordering that never trails the newest by more than the tolerance is accepted
    #[test]
    fn reordering_within_tolerance_is_accepted(
        config in arb_replay_config(),
        len in 1u64..300,
        keys in prop::collection::vec(any::<u32>(), 1..64),
    ) {
        let mut window = ReplayWindow::new(config);
        for seq in bounded_reordering(len, config.tolerance, &keys) {
            prop_assert_eq!(window.check_and_record(seq), ReplayVerdict::Accepted, "seq {}", seq);
        }
    }

    /// Property: a sequence trailing past the tolerance below every retained sequence is rejected
    #[test]
    fn reordering_past_tolerance_is_rejected(
        config in arb_replay_config(),
        base in 0u64..1_000,
        extra in 1u64..50,
    ) {
        let mut window = ReplayWindow::new(config);
        let newest = base + config.tolerance + extra;
        prop_assert!(window.check_and_record(newest).is_accepted());
        prop_assert_eq!(window.check_and_record(base), ReplayVerdict::Stale);
    }

    /// Property: replaying anything already accepted never gets through twice while retained
    #[test]
    fn replays_are_rejected(config in arb_replay_config(), len in 1u64..200, pick in any::<prop::sample::Index>()) {
        let mut window = ReplayWindow::new(config);
        for seq in 0..len {
            prop_assert!(window.check_and_record(seq).is_accepted());
        }
        let replayed = pick.index(len as usize) as u64;
        let newest = len - 1;
        let verdict = window.check_and_record(replayed);
        let retained = newest - replayed < config.capacity as u64;
        if retained {
            prop_assert_eq!(verdict, ReplayVerdict::Duplicate);
        } else if newest - replayed > config.tolerance {
            prop_assert_eq!(verdict, ReplayVerdict::Stale);
        }
    }

    /// Property: the window never retains more than its capacity
    #[test]
    fn window_respects_capacity(config in arb_replay_config(), seqs in prop::collection::vec(0u64..500, 0..300)) {
        let mut window = ReplayWindow::new(config);
        for seq in seqs {
            window.check_and_record(seq);
            prop_assert!(window.len() <= config.capacity);
        }
    }
}
