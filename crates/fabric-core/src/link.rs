//! Leaf link state machine
//!
//! The leaf's connection to the hub moves through
//! `Disconnected -> Connecting -> Handshaking -> Authenticated -> Disconnected`
//! and ends in `Closed` on explicit shutdown or a fatal handshake refusal.
//! Transitions not listed here are rejected.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::StateTransitionError;

// ----------------------------------------------------------------------------
// States and Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Handshaking,
    Authenticated,
    /// Terminal
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEvent {
    /// Supervisor starts dialing
    Dial,
    /// TCP connection established
    Connected,
    /// Handshake completed
    Authenticated,
    /// Dial failed, handshake aborted, or the established link dropped
    Lost,
    /// Hub refused us (unauthorized or protocol mismatch)
    Rejected,
    /// Explicit shutdown
    Close,
}

impl LinkState {
    pub fn transition(self, event: LinkEvent) -> Result<LinkState, StateTransitionError> {
        use LinkEvent as E;
        use LinkState as S;

        let next = match (self, event) {
            (S::Closed, E::Close) => S::Closed,
            (S::Closed, _) => return Err(invalid(self, event)),
            (_, E::Close) => S::Closed,

            (S::Disconnected, E::Dial) => S::Connecting,
            (S::Connecting, E::Connected) => S::Handshaking,
            (S::Connecting, E::Lost) => S::Disconnected,
            (S::Handshaking, E::Authenticated) => S::Authenticated,
            (S::Handshaking, E::Lost) => S::Disconnected,
            (S::Handshaking, E::Rejected) => S::Closed,
            (S::Authenticated, E::Lost) => S::Disconnected,

            _ => return Err(invalid(self, event)),
        };
        Ok(next)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, LinkState::Authenticated)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "Disconnected",
            LinkState::Connecting => "Connecting",
            LinkState::Handshaking => "Handshaking",
            LinkState::Authenticated => "Authenticated",
            LinkState::Closed => "Closed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn invalid(from: LinkState, event: LinkEvent) -> StateTransitionError {
    StateTransitionError {
        from: from.to_string(),
        event: format!("{:?}", event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_cycle() {
        let state = LinkState::Disconnected
            .transition(LinkEvent::Dial)
            .and_then(|s| s.transition(LinkEvent::Connected))
            .and_then(|s| s.transition(LinkEvent::Authenticated))
            .unwrap();
        assert!(state.is_authenticated());
        assert_eq!(
            state.transition(LinkEvent::Lost).unwrap(),
            LinkState::Disconnected
        );
    }

    #[test]
    fn test_rejection_is_terminal() {
        let state = LinkState::Handshaking.transition(LinkEvent::Rejected).unwrap();
        assert!(state.is_terminal());
        assert!(state.transition(LinkEvent::Dial).is_err());
        assert_eq!(state.transition(LinkEvent::Close).unwrap(), LinkState::Closed);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(LinkState::Disconnected
            .transition(LinkEvent::Authenticated)
            .is_err());
        assert!(LinkState::Authenticated.transition(LinkEvent::Dial).is_err());
        assert!(LinkState::Connecting.transition(LinkEvent::Rejected).is_err());
    }
}
