//! Error types for the fabric protocol
//!
//! This module contains all error types used throughout the fabric core,
//! including cryptographic, transport, protocol and handshake errors, and the
//! main `FabricError` type that unifies them.

use core::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Disconnect Reasons
// ----------------------------------------------------------------------------

/// Why a handshake refused to produce an authenticated connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The peers declared different protocol versions
    ProtocolMismatch,
    /// Unknown identity, or a decrypt/verify step failed
    Unauthorized,
    /// I/O failure or timeout in the middle of the exchange
    ErrorDuringHandshake,
}

impl DisconnectReason {
    /// Whether a dialer should give up instead of reconnecting
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ProtocolMismatch | DisconnectReason::Unauthorized
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ProtocolMismatch => "PROTOCOL_MISMATCH",
            DisconnectReason::Unauthorized => "UNAUTHORIZED",
            DisconnectReason::ErrorDuringHandshake => "ERROR_DURING_HANDSHAKE",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific cryptographic error types
#[derive(Debug, thiserror::Error)]
pub enum CryptographicError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key format")]
    InvalidKeyFormat,
    #[error("Sealed payload too short ({actual} bytes)")]
    SealedPayloadTooShort { actual: usize },
}

/// Specific transport error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Not connected to {peer}")]
    NotConnected { peer: String },
    #[error("Connection closed")]
    Closed,
}

/// Specific protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Declared frame length {declared} outside 0..={max}")]
    InvalidFrameLength { declared: i64, max: usize },
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    #[error("Envelope of kind {kind} has no response id")]
    MissingResponseId { kind: String },
    #[error("Unknown message kind: {kind}")]
    UnknownMessageKind { kind: u8 },
    #[error("Unexpected payload: expected {expected}, got {actual}")]
    UnexpectedKind { expected: String, actual: String },
    #[error("Replay rejected for connection {connection_id}, sequence {sequence}: {reason}")]
    ReplayRejected {
        connection_id: i16,
        sequence: u64,
        reason: &'static str,
    },
    #[error("A response envelope cannot carry its own response handler")]
    ResponseWithHandler,
    #[error("{field} is already assigned")]
    AlreadyAssigned { field: &'static str },
    #[error("Connection is not authenticated yet")]
    NotAuthenticated,
}

/// Invalid state machine transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid transition from {from} on {event}")]
pub struct StateTransitionError {
    pub from: String,
    pub event: String,
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error types for the fabric protocol
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    /// Handshake refused or aborted
    #[error("Handshake failed ({reason}): {detail}")]
    Handshake {
        reason: DisconnectReason,
        detail: String,
    },

    /// Bounded lock acquisition gave up
    #[error("Timed out after {waited_ms}ms waiting for {resource}")]
    LockTimeout { resource: String, waited_ms: u64 },

    /// Key file or key directory problem
    #[error("Key material error: {reason}")]
    KeyMaterial { reason: String },

    /// Record store rejected an operation
    #[error("Record error: {reason}")]
    Record { reason: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Error surfaced by an external handler
    #[error("Handler error: {message}")]
    Handler { message: String },
}

impl From<std::io::Error> for FabricError {
    fn from(err: std::io::Error) -> Self {
        FabricError::Transport(TransportError::NetworkIo(err))
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl FabricError {
    /// Create a malformed envelope error
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        FabricError::Protocol(ProtocolError::MalformedEnvelope {
            reason: reason.into(),
        })
    }

    /// Create a handshake error with a disconnect reason
    pub fn handshake<T: Into<String>>(reason: DisconnectReason, detail: T) -> Self {
        FabricError::Handshake {
            reason,
            detail: detail.into(),
        }
    }

    /// Create an unauthorized handshake error
    pub fn unauthorized<T: Into<String>>(detail: T) -> Self {
        Self::handshake(DisconnectReason::Unauthorized, detail)
    }

    /// Create a connection failed error
    pub fn connection_failed<P: Into<String>, R: Into<String>>(peer: P, reason: R) -> Self {
        FabricError::Transport(TransportError::ConnectionFailed {
            peer: peer.into(),
            reason: reason.into(),
        })
    }

    /// Create a not connected error
    pub fn not_connected<P: Into<String>>(peer: P) -> Self {
        FabricError::Transport(TransportError::NotConnected { peer: peer.into() })
    }

    /// Create a closed connection error
    pub fn closed() -> Self {
        FabricError::Transport(TransportError::Closed)
    }

    /// Create a timeout error
    pub fn timeout(duration: core::time::Duration) -> Self {
        FabricError::Transport(TransportError::Timeout {
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Create a lock timeout error
    pub fn lock_timeout<T: Into<String>>(resource: T, waited: core::time::Duration) -> Self {
        FabricError::LockTimeout {
            resource: resource.into(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a key material error
    pub fn key_error<T: Into<String>>(reason: T) -> Self {
        FabricError::KeyMaterial {
            reason: reason.into(),
        }
    }

    /// Create a record error
    pub fn record_error<T: Into<String>>(reason: T) -> Self {
        FabricError::Record {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        FabricError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a handler error with a message
    pub fn handler_error<T: Into<String>>(message: T) -> Self {
        FabricError::Handler {
            message: message.into(),
        }
    }

    /// Disconnect reason carried by a handshake error
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            FabricError::Handshake { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether this error came from the transport (recoverable by reconnecting)
    pub fn is_transport(&self) -> bool {
        matches!(self, FabricError::Transport(_))
    }

    /// Fold an error raised in the middle of a handshake into the handshake taxonomy
    pub fn into_handshake_failure(self) -> Self {
        match self {
            FabricError::Handshake { .. } => self,
            FabricError::Crypto(err) => Self::unauthorized(err.to_string()),
            other => Self::handshake(DisconnectReason::ErrorDuringHandshake, other.to_string()),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, FabricError>;
pub type FabricResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_failure_classification() {
        let io = FabricError::from(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ));
        assert_eq!(
            io.into_handshake_failure().disconnect_reason(),
            Some(DisconnectReason::ErrorDuringHandshake)
        );

        let crypto = FabricError::from(CryptographicError::DecryptionFailed);
        assert_eq!(
            crypto.into_handshake_failure().disconnect_reason(),
            Some(DisconnectReason::Unauthorized)
        );

        let mismatch = FabricError::handshake(DisconnectReason::ProtocolMismatch, "v1 != v2");
        assert_eq!(
            mismatch.into_handshake_failure().disconnect_reason(),
            Some(DisconnectReason::ProtocolMismatch)
        );
    }

    #[test]
    fn test_fatal_reasons() {
        assert!(DisconnectReason::Unauthorized.is_fatal());
        assert!(DisconnectReason::ProtocolMismatch.is_fatal());
        assert!(!DisconnectReason::ErrorDuringHandshake.is_fatal());
        assert_eq!(DisconnectReason::ProtocolMismatch.to_string(), "PROTOCOL_MISMATCH");
    }
}
