//! Fabric Runtime Engine
//!
//! Everything in the fabric that owns a socket or a task:
//! - `Connection`: one sealed duplex link with request/response correlation
//! - `Hub`: the acceptor and router every leaf authenticates against
//! - `Leaf`: the dialer that keeps its hub link alive and opens direct
//!   channels to siblings
//! - `RecordStore`: the replicated player-session table
//!
//! `fabric-core` provides the wire formats and types these build on.

mod connection;
pub mod handshake;
mod hub;
mod leaf;
mod peer;
mod registry;
pub mod replication;
pub mod services;

pub use connection::{Connection, ResponseCallback, ResponseHandler, TimeoutCallback};
pub use handshake::{Admitted, Welcome};
pub use hub::Hub;
pub use leaf::{Leaf, ReadyOutcome};
pub use registry::ConnectionIdRegistry;
pub use replication::{PresenceCheck, RecordStore, StoreRole};
pub use services::{typed_payload, Endpoint, PermissionCheckFn};

// Re-export core types for convenience
pub use fabric_core::{
    DisconnectReason, Envelope, EventDispatcher, FabricConfig, FabricError, FabricResult,
    ForwardTarget, IdentityKey, KeyDirectory, LinkState, MessageKind, Payload, HUB_NAME,
};
