//! Message kinds and typed payloads
//!
//! [`MessageKind`] is the wire discriminant. [`Message`] is the typed view of
//! an envelope: one variant per kind, each with its own payload struct, built
//! from an envelope by a decoder looked up in a [`MessageRegistry`].

use core::fmt;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{Envelope, Payload};
use crate::errors::{FabricResult, ProtocolError};
use crate::records::RecordMessage;

// ----------------------------------------------------------------------------
// Message Kinds
// ----------------------------------------------------------------------------

/// Wire discriminant of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    KeepAlive = 0,
    Ping = 1,
    ServerList = 2,
    PlayerData = 3,
    PeerAuth = 4,
    ConnectionIdReset = 5,
    Api = 6,
    ApiWithBlob = 7,
    Command = 8,
    ChatMessage = 9,
    PlaySound = 10,
    ShowTitle = 11,
    HasPermission = 12,
}

impl MessageKind {
    pub const ALL: [MessageKind; 13] = [
        MessageKind::KeepAlive,
        MessageKind::Ping,
        MessageKind::ServerList,
        MessageKind::PlayerData,
        MessageKind::PeerAuth,
        MessageKind::ConnectionIdReset,
        MessageKind::Api,
        MessageKind::ApiWithBlob,
        MessageKind::Command,
        MessageKind::ChatMessage,
        MessageKind::PlaySound,
        MessageKind::ShowTitle,
        MessageKind::HasPermission,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether a raw blob frame follows the header
    pub fn carries_blob(self) -> bool {
        matches!(self, MessageKind::ApiWithBlob)
    }

    /// Every kind except keep-alive is correlated
    pub fn requires_id(self) -> bool {
        !matches!(self, MessageKind::KeepAlive)
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::KeepAlive => "keep-alive",
            MessageKind::Ping => "ping",
            MessageKind::ServerList => "server-list",
            MessageKind::PlayerData => "player-data",
            MessageKind::PeerAuth => "peer-auth",
            MessageKind::ConnectionIdReset => "connection-id-reset",
            MessageKind::Api => "api",
            MessageKind::ApiWithBlob => "api-with-blob",
            MessageKind::Command => "command",
            MessageKind::ChatMessage => "chat-message",
            MessageKind::PlaySound => "play-sound",
            MessageKind::ShowTitle => "show-title",
            MessageKind::HasPermission => "has-permission",
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(ProtocolError::UnknownMessageKind { kind: value })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Typed Payloads
// ----------------------------------------------------------------------------

/// Round-trip probe; the reply echoes `sent_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub sent_at: u64,
}

/// One roster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Roster broadcast by the hub, or a p2p port announcement from a leaf
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerList {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p2p_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p2p_host: Option<String>,
}

impl ServerList {
    pub fn roster(servers: Vec<ServerEntry>) -> Self {
        Self {
            servers,
            ..Self::default()
        }
    }

    pub fn announce(p2p_port: u16, p2p_host: Option<String>) -> Self {
        Self {
            p2p_port: Some(p2p_port),
            p2p_host,
            ..Self::default()
        }
    }
}

/// Symmetric key for a p2p channel, base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAuth {
    pub key: String,
}

/// A peer reconnected; forget its replay window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionIdReset {
    pub connection_id: i16,
}

/// Console or player command to run on the receiving side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<Uuid>,
}

/// Chat line for some or all players
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    /// Empty means everyone
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaySound {
    pub player: Uuid,
    pub sound: String,
    #[serde(default = "default_unit")]
    pub volume: f32,
    #[serde(default = "default_unit")]
    pub pitch: f32,
}

fn default_unit() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowTitle {
    pub player: Uuid,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub fade_in_ticks: u32,
    #[serde(default)]
    pub stay_ticks: u32,
    #[serde(default)]
    pub fade_out_ticks: u32,
}

/// Permission query and its answer share one kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionCheck {
    Query { player: Uuid, permission: String },
    Answer { result: bool },
}

// ----------------------------------------------------------------------------
// Message Union
// ----------------------------------------------------------------------------

/// Typed view of an envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Ping(Ping),
    ServerList(ServerList),
    PlayerData(RecordMessage),
    PeerAuth(PeerAuth),
    ConnectionIdReset(ConnectionIdReset),
    Api(Payload),
    ApiWithBlob { data: Payload, blob: Vec<u8> },
    Command(Command),
    ChatMessage(ChatMessage),
    PlaySound(PlaySound),
    ShowTitle(ShowTitle),
    HasPermission(PermissionCheck),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::KeepAlive => MessageKind::KeepAlive,
            Message::Ping(_) => MessageKind::Ping,
            Message::ServerList(_) => MessageKind::ServerList,
            Message::PlayerData(_) => MessageKind::PlayerData,
            Message::PeerAuth(_) => MessageKind::PeerAuth,
            Message::ConnectionIdReset(_) => MessageKind::ConnectionIdReset,
            Message::Api(_) => MessageKind::Api,
            Message::ApiWithBlob { .. } => MessageKind::ApiWithBlob,
            Message::Command(_) => MessageKind::Command,
            Message::ChatMessage(_) => MessageKind::ChatMessage,
            Message::PlaySound(_) => MessageKind::PlaySound,
            Message::ShowTitle(_) => MessageKind::ShowTitle,
            Message::HasPermission(_) => MessageKind::HasPermission,
        }
    }

    /// Build an unaddressed envelope carrying this message
    pub fn into_envelope(self) -> FabricResult<Envelope> {
        let envelope = Envelope::new(self.kind());
        match self {
            Message::KeepAlive => Ok(envelope),
            Message::Ping(p) => envelope.with_typed_payload(&p),
            Message::ServerList(p) => envelope.with_typed_payload(&p),
            Message::PlayerData(p) => envelope.with_typed_payload(&p),
            Message::PeerAuth(p) => envelope.with_typed_payload(&p),
            Message::ConnectionIdReset(p) => envelope.with_typed_payload(&p),
            Message::Api(data) => Ok(envelope.with_payload(data)),
            Message::ApiWithBlob { data, blob } => Ok(envelope.with_payload(data).with_blob(blob)),
            Message::Command(p) => envelope.with_typed_payload(&p),
            Message::ChatMessage(p) => envelope.with_typed_payload(&p),
            Message::PlaySound(p) => envelope.with_typed_payload(&p),
            Message::ShowTitle(p) => envelope.with_typed_payload(&p),
            Message::HasPermission(p) => envelope.with_typed_payload(&p),
        }
    }

    /// Decode with the standard decoders
    pub fn decode(envelope: &Envelope) -> FabricResult<Self> {
        standard_decoder(envelope.kind())(envelope)
    }
}

// ----------------------------------------------------------------------------
// Decoder Registry
// ----------------------------------------------------------------------------

/// Turns an envelope of one kind into a typed message
pub type Decoder = fn(&Envelope) -> FabricResult<Message>;

fn standard_decoder(kind: MessageKind) -> Decoder {
    match kind {
        MessageKind::KeepAlive => |_| Ok(Message::KeepAlive),
        MessageKind::Ping => |e| Ok(Message::Ping(e.decode()?)),
        MessageKind::ServerList => |e| Ok(Message::ServerList(e.decode()?)),
        MessageKind::PlayerData => |e| Ok(Message::PlayerData(e.decode()?)),
        MessageKind::PeerAuth => |e| Ok(Message::PeerAuth(e.decode()?)),
        MessageKind::ConnectionIdReset => |e| Ok(Message::ConnectionIdReset(e.decode()?)),
        MessageKind::Api => |e| Ok(Message::Api(e.payload().clone())),
        MessageKind::ApiWithBlob => |e| {
            Ok(Message::ApiWithBlob {
                data: e.payload().clone(),
                blob: e.blob().map(<[u8]>::to_vec).unwrap_or_default(),
            })
        },
        MessageKind::Command => |e| Ok(Message::Command(e.decode()?)),
        MessageKind::ChatMessage => |e| Ok(Message::ChatMessage(e.decode()?)),
        MessageKind::PlaySound => |e| Ok(Message::PlaySound(e.decode()?)),
        MessageKind::ShowTitle => |e| Ok(Message::ShowTitle(e.decode()?)),
        MessageKind::HasPermission => |e| Ok(Message::HasPermission(e.decode()?)),
    }
}

/// Kind-indexed decoder table; starts with the standard decoders
#[derive(Clone)]
pub struct MessageRegistry {
    decoders: HashMap<MessageKind, Decoder>,
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("MessageRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        let decoders = MessageKind::ALL
            .iter()
            .map(|&kind| (kind, standard_decoder(kind)))
            .collect();
        Self { decoders }
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the decoder for one kind
    pub fn register(&mut self, kind: MessageKind, decoder: Decoder) {
        self.decoders.insert(kind, decoder);
    }

    pub fn decode(&self, envelope: &Envelope) -> FabricResult<Message> {
        let decoder = self.decoders.get(&envelope.kind()).ok_or(
            ProtocolError::UnknownMessageKind {
                kind: envelope.kind().as_u8(),
            },
        )?;
        decoder(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FabricError;

    #[test]
    fn test_kind_discriminants_are_stable() {
        for (index, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.as_u8() as usize, index);
            assert_eq!(MessageKind::from_u8(index as u8), Some(*kind));
        }
        assert!(MessageKind::try_from(13).is_err());
        assert!(MessageKind::ApiWithBlob.carries_blob());
        assert!(!MessageKind::Api.carries_blob());
        assert!(!MessageKind::KeepAlive.requires_id());
    }

    #[test]
    fn test_typed_message_through_envelope() {
        let player = Uuid::new_v4();
        let message = Message::ShowTitle(ShowTitle {
            player,
            title: "Welcome".into(),
            subtitle: "to the lobby".into(),
            fade_in_ticks: 10,
            stay_ticks: 40,
            fade_out_ticks: 10,
        });
        let envelope = message.clone().into_envelope().unwrap();
        assert_eq!(envelope.kind(), MessageKind::ShowTitle);
        assert_eq!(Message::decode(&envelope).unwrap(), message);
    }

    #[test]
    fn test_permission_query_and_answer_share_kind() {
        let query = PermissionCheck::Query {
            player: Uuid::new_v4(),
            permission: "fabric.admin".into(),
        };
        let envelope = Message::HasPermission(query.clone()).into_envelope().unwrap();
        assert_eq!(Message::decode(&envelope).unwrap(), Message::HasPermission(query));

        let answer = Envelope::new(MessageKind::HasPermission)
            .with_typed_payload(&PermissionCheck::Answer { result: true })
            .unwrap();
        assert_eq!(
            answer.decode::<PermissionCheck>().unwrap(),
            PermissionCheck::Answer { result: true }
        );
    }

    #[test]
    fn test_blob_message_keeps_blob() {
        let envelope = Message::ApiWithBlob {
            data: Payload::new(),
            blob: vec![1, 2, 3],
        }
        .into_envelope()
        .unwrap();
        assert_eq!(envelope.blob(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_registry_override() {
        let mut registry = MessageRegistry::new();
        registry.register(MessageKind::Command, |_| {
            Err(FabricError::handler_error("commands disabled"))
        });
        let envelope = Message::Command(Command {
            command: "say hi".into(),
            player: None,
        })
        .into_envelope()
        .unwrap();
        assert!(registry.decode(&envelope).is_err());
        assert!(Message::decode(&envelope).is_ok());
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let envelope = Envelope::new(MessageKind::Ping)
            .with_payload(serde_json::json!({"sent_at": "soon"}).as_object().unwrap().clone());
        assert!(Message::decode(&envelope).is_err());
    }
}
