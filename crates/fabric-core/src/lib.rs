//! Fabric Core Protocol Implementation
//!
//! Foundational types for the authenticated hub/leaf message fabric:
//! identifiers and replay defense, framing, cryptographic primitives and key
//! files, envelopes and typed messages, event dispatch, replicated session
//! records, the leaf link state machine, and configuration.
//!
//! Everything that owns a socket or a task lives in `fabric-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod errors;
pub mod identifier;
pub mod keys;
pub mod link;
pub mod message;
pub mod records;
pub mod replay;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    ConnectionConfig, FabricConfig, HubConfig, LeafConfig, ReplayConfig, ReplicationConfig,
    PROTOCOL_VERSION,
};
pub use crypto::{
    IdentityKey, KeyExchangeParams, KeyExchangeReply, PublicIdentity, SessionCipher,
    ACK_LITERAL, KEY_EXCHANGE_SUITE, P2P_TEST_LITERAL,
};
pub use dispatch::{EventDispatcher, Listener, ListenerId};
pub use envelope::{Envelope, ForwardTarget, Payload};
pub use errors::{
    CryptographicError, DisconnectReason, FabricError, FabricResult, ProtocolError, Result,
    StateTransitionError, TransportError,
};
pub use identifier::{IdProvider, IdSource, Identifier};
pub use keys::{KeyDirectory, KeyFile, KeyKind, PeerKey};
pub use link::{LinkEvent, LinkState};
pub use message::{
    ChatMessage, Command, ConnectionIdReset, Message, MessageKind, MessageRegistry, PeerAuth,
    PermissionCheck, Ping, PlaySound, ServerEntry, ServerList, ShowTitle,
};
pub use records::{
    FieldKey, RecordMessage, RecordTable, SessionRecord, StandardField, Variable, Versioned,
};
pub use replay::{ReplayGuard, ReplayVerdict, ReplayWindow};
pub use types::{Timestamp, BROADCAST_TARGET, HUB_NAME};
