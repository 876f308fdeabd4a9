//! Envelopes
//!
//! An [`Envelope`] is one addressed, typed, optionally correlated message.
//! On the wire it is a JSON header document, followed by a raw blob frame for
//! the kinds that carry one.

use core::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{FabricError, FabricResult, ProtocolError};
use crate::identifier::Identifier;
use crate::message::MessageKind;
use crate::types::{BROADCAST_TARGET, HUB_NAME};

/// Untyped payload object
pub type Payload = Map<String, Value>;

// ----------------------------------------------------------------------------
// Forward Target
// ----------------------------------------------------------------------------

/// Where the hub should deliver an envelope next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardTarget {
    /// Every leaf except the sender
    All,
    /// Named peers; `proxy` names the hub itself
    Peers(Vec<String>),
}

impl ForwardTarget {
    /// Parse the wire form: `all`, a name, or a comma list. Empty means none.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.eq_ignore_ascii_case(BROADCAST_TARGET) {
            return Some(ForwardTarget::All);
        }
        let names: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(ForwardTarget::Peers(names))
        }
    }

    /// A single named peer
    pub fn peer(name: impl Into<String>) -> Self {
        ForwardTarget::Peers(vec![name.into()])
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ForwardTarget::All)
    }

    /// The only named peer, if exactly one is named
    pub fn single_peer(&self) -> Option<&str> {
        match self {
            ForwardTarget::Peers(names) if names.len() == 1 => Some(names[0].as_str()),
            _ => None,
        }
    }

    /// Whether `name` is addressed
    pub fn includes(&self, name: &str) -> bool {
        match self {
            ForwardTarget::All => name != HUB_NAME,
            ForwardTarget::Peers(names) => names.iter().any(|n| n == name),
        }
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardTarget::All => f.write_str(BROADCAST_TARGET),
            ForwardTarget::Peers(names) => f.write_str(&names.join(",")),
        }
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// One addressed message
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    kind: MessageKind,
    channel: Option<String>,
    payload: Payload,
    origin: Option<String>,
    forward: Option<ForwardTarget>,
    id: Option<Identifier>,
    reply_to: Option<Identifier>,
    blob: Option<Vec<u8>>,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            channel: None,
            payload: Payload::new(),
            origin: None,
            forward: None,
            id: None,
            reply_to: None,
            blob: None,
        }
    }

    pub fn keep_alive() -> Self {
        Self::new(MessageKind::KeepAlive)
    }

    /// Start a response to `request`, correlated by its id
    pub fn reply(request: &Envelope) -> FabricResult<Self> {
        let id = request
            .id
            .ok_or_else(|| ProtocolError::MissingResponseId {
                kind: request.kind.to_string(),
            })?;
        let mut reply = Self::new(request.kind);
        reply.channel = request.channel.clone();
        reply.reply_to = Some(id);
        Ok(reply)
    }

    // Builders --------------------------------------------------------------

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize a typed payload into the envelope
    pub fn with_typed_payload<T: Serialize>(mut self, payload: &T) -> FabricResult<Self> {
        self.payload = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Payload::new(),
            other => {
                return Err(FabricError::malformed(format!(
                    "payload must be a JSON object, got {}",
                    other
                )))
            }
        };
        Ok(self)
    }

    pub fn with_forward(mut self, forward: ForwardTarget) -> Self {
        self.forward = Some(forward);
        self
    }

    /// Address a single peer
    pub fn to(self, name: impl Into<String>) -> Self {
        self.with_forward(ForwardTarget::peer(name))
    }

    /// Address every leaf
    pub fn to_all(self) -> Self {
        self.with_forward(ForwardTarget::All)
    }

    pub fn with_blob(mut self, blob: Vec<u8>) -> Self {
        self.blob = Some(blob);
        self
    }

    // Accessors -------------------------------------------------------------

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn forward(&self) -> Option<&ForwardTarget> {
        self.forward.as_ref()
    }

    pub fn id(&self) -> Option<Identifier> {
        self.id
    }

    pub fn reply_to(&self) -> Option<Identifier> {
        self.reply_to
    }

    pub fn blob(&self) -> Option<&[u8]> {
        self.blob.as_deref()
    }

    pub fn is_response(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Deserialize the payload into a typed struct
    pub fn decode<T: DeserializeOwned>(&self) -> FabricResult<T> {
        Ok(serde_json::from_value(Value::Object(self.payload.clone()))?)
    }

    /// Dispatch sender implied by the forward field of an envelope relayed by the hub
    pub fn relayed_sender(&self) -> &str {
        match &self.forward {
            Some(ForwardTarget::Peers(names)) if !names.is_empty() => names[0].as_str(),
            _ => HUB_NAME,
        }
    }

    // Set-once fields -------------------------------------------------------

    /// Assign the response id; fails if one is already present
    pub fn assign_id(&mut self, id: Identifier) -> Result<(), ProtocolError> {
        if self.id.is_some() {
            return Err(ProtocolError::AlreadyAssigned { field: "response id" });
        }
        self.id = Some(id);
        Ok(())
    }

    /// Record the first sender; later calls keep the original
    pub fn ensure_origin(&mut self, name: &str) {
        if self.origin.is_none() {
            self.origin = Some(name.to_string());
        }
    }

    /// Replace the forward target with the name of the peer that sent it
    pub fn rewrite_forward(&mut self, sender: &str) {
        self.forward = Some(ForwardTarget::peer(sender));
    }

    // Wire codec ------------------------------------------------------------

    /// Serialize the header document
    pub fn encode_header(&self) -> FabricResult<Vec<u8>> {
        if self.kind.requires_id() && self.id.is_none() {
            return Err(ProtocolError::MissingResponseId {
                kind: self.kind.to_string(),
            }
            .into());
        }
        let header = EnvelopeHeader {
            kind: self.kind.as_u8(),
            id: self.id.map(|id| id.as_i64()),
            reply_to: self.reply_to.map(|id| id.as_i64()),
            channel: self.channel.clone(),
            payload: if self.payload.is_empty() {
                None
            } else {
                Some(self.payload.clone())
            },
            forward: self.forward.as_ref().map(ToString::to_string),
            origin: self.origin.clone(),
        };
        Ok(serde_json::to_vec(&header)?)
    }

    /// Parse a header document; the blob, if any, is attached separately
    pub fn decode_header(bytes: &[u8]) -> FabricResult<Self> {
        let header: EnvelopeHeader = serde_json::from_slice(bytes)
            .map_err(|e| FabricError::malformed(e.to_string()))?;
        let kind = MessageKind::from_u8(header.kind)
            .ok_or(ProtocolError::UnknownMessageKind { kind: header.kind })?;
        if kind.requires_id() && header.id.is_none() {
            return Err(ProtocolError::MissingResponseId {
                kind: kind.to_string(),
            }
            .into());
        }
        Ok(Self {
            kind,
            channel: header.channel,
            payload: header.payload.unwrap_or_default(),
            origin: header.origin,
            forward: header.forward.as_deref().and_then(ForwardTarget::parse),
            id: header.id.map(Identifier::from_raw),
            reply_to: header.reply_to.map(Identifier::from_raw),
            blob: None,
        })
    }

    /// Attach a blob read from the frame after the header
    pub fn attach_blob(&mut self, blob: Vec<u8>) {
        self.blob = Some(blob);
    }
}

/// JSON header document
#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeHeader {
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    forward: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_request() -> Envelope {
        let mut envelope = Envelope::new(MessageKind::Api)
            .with_channel("shop:buy")
            .with_payload(json!({"item": "sword"}).as_object().unwrap().clone())
            .to("lobby");
        envelope.assign_id(Identifier::compose(2, 9)).unwrap();
        envelope.ensure_origin("games");
        envelope
    }

    #[test]
    fn test_forward_target_parsing() {
        assert_eq!(ForwardTarget::parse("all"), Some(ForwardTarget::All));
        assert_eq!(ForwardTarget::parse(""), None);
        assert_eq!(
            ForwardTarget::parse("a, b,,c"),
            Some(ForwardTarget::Peers(vec!["a".into(), "b".into(), "c".into()]))
        );
        assert_eq!(ForwardTarget::peer("a").to_string(), "a");
    }

    #[test]
    fn test_header_round_trip() {
        let envelope = create_test_request();
        let bytes = envelope.encode_header().unwrap();
        let decoded = Envelope::decode_header(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_id_and_origin_are_set_once() {
        let mut envelope = create_test_request();
        assert!(envelope.assign_id(Identifier::compose(2, 10)).is_err());
        envelope.ensure_origin("someone-else");
        assert_eq!(envelope.origin(), Some("games"));
        assert_eq!(envelope.id(), Some(Identifier::compose(2, 9)));
    }

    #[test]
    fn test_missing_id_rejected_except_keep_alive() {
        assert!(Envelope::new(MessageKind::Api).encode_header().is_err());
        let keep_alive = Envelope::keep_alive().encode_header().unwrap();
        let decoded = Envelope::decode_header(&keep_alive).unwrap();
        assert_eq!(decoded.kind(), MessageKind::KeepAlive);

        let err = Envelope::decode_header(br#"{"kind": 6}"#).unwrap_err();
        assert!(matches!(
            err,
            FabricError::Protocol(ProtocolError::MissingResponseId { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Envelope::decode_header(br#"{"kind": 200, "id": 1}"#).unwrap_err();
        assert!(matches!(
            err,
            FabricError::Protocol(ProtocolError::UnknownMessageKind { kind: 200 })
        ));
    }

    #[test]
    fn test_reply_correlates_to_request() {
        let request = create_test_request();
        let reply = Envelope::reply(&request).unwrap();
        assert_eq!(reply.reply_to(), request.id());
        assert_eq!(reply.kind(), MessageKind::Api);
        assert!(reply.is_response());
        assert!(reply.id().is_none());

        assert!(Envelope::reply(&Envelope::new(MessageKind::Ping)).is_err());
    }

    #[test]
    fn test_relayed_sender() {
        let mut envelope = create_test_request();
        envelope.rewrite_forward("games");
        assert_eq!(envelope.relayed_sender(), "games");
        assert_eq!(Envelope::new(MessageKind::Ping).relayed_sender(), HUB_NAME);
    }
}
