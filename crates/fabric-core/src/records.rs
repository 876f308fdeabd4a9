//! Replicated session records
//!
//! A [`SessionRecord`] describes one live subject (a connected player): an
//! immutable UUID and display name, a set of standard typed fields, and
//! custom fields namespaced by the plugin that owns them. Every field carries
//! its own timestamp and merges last-writer-wins.
//!
//! The [`RecordTable`] digest hashes values only, in canonical order, so two
//! replicas holding the same data agree regardless of insertion order or of
//! the timestamps their writers stamped.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::errors::{FabricError, FabricResult};
use crate::message::MessageKind;
use crate::types::{Timestamp, HUB_NAME};

// ----------------------------------------------------------------------------
// Values
// ----------------------------------------------------------------------------

/// Typed field value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Variable {
    Text(String),
    Flag(bool),
    Uuids(BTreeSet<Uuid>),
    Strings(BTreeSet<String>),
    Blob(#[serde(with = "blob_base64")] Vec<u8>),
}

impl Variable {
    fn tag(&self) -> u8 {
        match self {
            Variable::Text(_) => 0,
            Variable::Flag(_) => 1,
            Variable::Uuids(_) => 2,
            Variable::Strings(_) => 3,
            Variable::Blob(_) => 4,
        }
    }

    fn digest_into(&self, hasher: &mut Sha256) {
        hasher.update([self.tag()]);
        match self {
            Variable::Text(text) => hash_str(hasher, text),
            Variable::Flag(flag) => hasher.update([*flag as u8]),
            Variable::Uuids(set) => {
                hasher.update((set.len() as u64).to_be_bytes());
                for uuid in set {
                    hasher.update(uuid.as_bytes());
                }
            }
            Variable::Strings(set) => {
                hasher.update((set.len() as u64).to_be_bytes());
                for item in set {
                    hash_str(hasher, item);
                }
            }
            Variable::Blob(bytes) => {
                hasher.update((bytes.len() as u64).to_be_bytes());
                hasher.update(bytes);
            }
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Variable::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Variable::Flag(flag) => Some(*flag),
            _ => None,
        }
    }
}

fn hash_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

mod blob_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Value plus the time it was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: Variable,
    pub updated_at: Timestamp,
}

impl Versioned {
    pub fn new(value: Variable, updated_at: Timestamp) -> Self {
        Self { value, updated_at }
    }

    pub fn now(value: Variable) -> Self {
        Self::new(value, Timestamp::now())
    }
}

// ----------------------------------------------------------------------------
// Field Keys
// ----------------------------------------------------------------------------

/// Fields every record understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardField {
    /// Leaf the subject is currently on (text)
    Server,
    /// Hidden from other players (flag)
    Vanished,
    /// Subjects this one ignores (uuid set)
    Ignoring,
    /// Free-form tags (string set)
    Tags,
    /// Skin texture (blob)
    Texture,
}

impl StandardField {
    pub fn accepts(&self, value: &Variable) -> bool {
        matches!(
            (self, value),
            (StandardField::Server, Variable::Text(_))
                | (StandardField::Vanished, Variable::Flag(_))
                | (StandardField::Ignoring, Variable::Uuids(_))
                | (StandardField::Tags, Variable::Strings(_))
                | (StandardField::Texture, Variable::Blob(_))
        )
    }

    fn tag(&self) -> u8 {
        *self as u8
    }
}

/// Address of one field inside a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    Standard(StandardField),
    Custom { owner: String, name: String },
}

impl FieldKey {
    pub fn custom(owner: impl Into<String>, name: impl Into<String>) -> Self {
        FieldKey::Custom {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, FieldKey::Custom { .. })
    }
}

impl From<StandardField> for FieldKey {
    fn from(field: StandardField) -> Self {
        FieldKey::Standard(field)
    }
}

// ----------------------------------------------------------------------------
// Session Record
// ----------------------------------------------------------------------------

/// One replicated subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    id: Uuid,
    name: String,
    #[serde(default)]
    fields: BTreeMap<StandardField, Versioned>,
    #[serde(default)]
    custom: BTreeMap<String, BTreeMap<String, Versioned>>,
}

impl SessionRecord {
    pub fn new(id: Uuid, name: impl Into<String>, server: impl Into<String>, now: Timestamp) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            StandardField::Server,
            Versioned::new(Variable::Text(server.into()), now),
        );
        Self {
            id,
            name: name.into(),
            fields,
            custom: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning leaf
    pub fn server(&self) -> Option<&str> {
        self.fields
            .get(&StandardField::Server)
            .and_then(|v| v.value.as_text())
    }

    pub fn get(&self, key: &FieldKey) -> Option<&Versioned> {
        match key {
            FieldKey::Standard(field) => self.fields.get(field),
            FieldKey::Custom { owner, name } => self.custom.get(owner).and_then(|vars| vars.get(name)),
        }
    }

    /// Whether `sender` may write `key` on this record
    pub fn may_update(&self, key: &FieldKey, sender: &str) -> bool {
        key.is_custom() || sender == HUB_NAME || self.server() == Some(sender)
    }

    /// Last-writer-wins merge; returns whether the value was taken
    pub fn apply(&mut self, key: &FieldKey, incoming: Versioned) -> FabricResult<bool> {
        if let FieldKey::Standard(field) = key {
            if !field.accepts(&incoming.value) {
                return Err(FabricError::record_error(format!(
                    "{:?} cannot hold {:?}",
                    field, incoming.value
                )));
            }
        }
        if let Some(current) = self.get(key) {
            if incoming.updated_at < current.updated_at {
                return Ok(false);
            }
        }
        self.put(key, Some(incoming));
        Ok(true)
    }

    /// Overwrite or clear a field without merge rules (used for rollback)
    pub fn put(&mut self, key: &FieldKey, value: Option<Versioned>) {
        match (key, value) {
            (FieldKey::Standard(field), Some(value)) => {
                self.fields.insert(*field, value);
            }
            (FieldKey::Standard(field), None) => {
                self.fields.remove(field);
            }
            (FieldKey::Custom { owner, name }, Some(value)) => {
                self.custom
                    .entry(owner.clone())
                    .or_default()
                    .insert(name.clone(), value);
            }
            (FieldKey::Custom { owner, name }, None) => {
                if let Some(vars) = self.custom.get_mut(owner) {
                    vars.remove(name);
                    if vars.is_empty() {
                        self.custom.remove(owner);
                    }
                }
            }
        }
    }

    fn digest_into(&self, hasher: &mut Sha256) {
        hasher.update(self.id.as_bytes());
        hash_str(hasher, &self.name);
        hasher.update((self.fields.len() as u64).to_be_bytes());
        for (field, versioned) in &self.fields {
            hasher.update([field.tag()]);
            versioned.value.digest_into(hasher);
        }
        hasher.update((self.custom.len() as u64).to_be_bytes());
        for (owner, vars) in &self.custom {
            hash_str(hasher, owner);
            hasher.update((vars.len() as u64).to_be_bytes());
            for (name, versioned) in vars {
                hash_str(hasher, name);
                versioned.value.digest_into(hasher);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Record Table
// ----------------------------------------------------------------------------

/// All records known to one replica
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordTable {
    records: BTreeMap<Uuid, SessionRecord>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record; returns the replaced one
    pub fn insert(&mut self, record: SessionRecord) -> Option<SessionRecord> {
        self.records.insert(record.id(), record)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<SessionRecord> {
        self.records.remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&SessionRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut SessionRecord> {
        self.records.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionRecord> {
        self.records.values()
    }

    pub fn snapshot(&self) -> Vec<SessionRecord> {
        self.records.values().cloned().collect()
    }

    /// Replace the whole table with a snapshot
    pub fn replace_all(&mut self, records: Vec<SessionRecord>) {
        self.records = records.into_iter().map(|r| (r.id(), r)).collect();
    }

    /// Keep only records matching `keep`; returns the removed ones
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<SessionRecord>
    where
        F: FnMut(&SessionRecord) -> bool,
    {
        let doomed: Vec<Uuid> = self
            .records
            .values()
            .filter(|r| !keep(r))
            .map(SessionRecord::id)
            .collect();
        doomed
            .iter()
            .filter_map(|id| self.records.remove(id))
            .collect()
    }

    /// Apply a remote field update attested as coming from `sender`
    ///
    /// Returns `Ok(false)` for unknown records and stale values, and an error
    /// when the sender may not write the field.
    pub fn apply_update(
        &mut self,
        sender: &str,
        id: &Uuid,
        key: &FieldKey,
        value: Versioned,
    ) -> FabricResult<bool> {
        let record = match self.records.get_mut(id) {
            Some(record) => record,
            None => return Ok(false),
        };
        if !record.may_update(key, sender) {
            return Err(FabricError::record_error(format!(
                "{} may not update {:?} of {} owned by {}",
                sender,
                key,
                id,
                record.server().unwrap_or("nobody")
            )));
        }
        record.apply(key, value)
    }

    /// Hex SHA-256 over every record's values in id order
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.records.len() as u64).to_be_bytes());
        for record in self.records.values() {
            record.digest_into(&mut hasher);
        }
        hex::encode(hasher.finalize())
    }
}

// ----------------------------------------------------------------------------
// Replication Messages
// ----------------------------------------------------------------------------

/// Payload of `player-data` envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecordMessage {
    Join {
        record: SessionRecord,
    },
    Quit {
        id: Uuid,
    },
    Update {
        id: Uuid,
        field: FieldKey,
        value: Versioned,
    },
    Hash {
        digest: String,
    },
    SnapshotRequest,
    Snapshot {
        records: Vec<SessionRecord>,
    },
}

impl RecordMessage {
    pub fn into_envelope(self) -> FabricResult<Envelope> {
        Envelope::new(MessageKind::PlayerData).with_typed_payload(&self)
    }

    pub fn from_envelope(envelope: &Envelope) -> FabricResult<Self> {
        if envelope.kind() != MessageKind::PlayerData {
            return Err(crate::errors::ProtocolError::UnexpectedKind {
                expected: MessageKind::PlayerData.to_string(),
                actual: envelope.kind().to_string(),
            }
            .into());
        }
        envelope.decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_record(server: &str) -> SessionRecord {
        SessionRecord::new(Uuid::new_v4(), "Steve", server, Timestamp::new(1_000))
    }

    #[test]
    fn test_last_writer_wins() {
        let mut record = create_test_record("lobby");
        let key = FieldKey::Standard(StandardField::Vanished);

        assert!(record
            .apply(&key, Versioned::new(Variable::Flag(true), Timestamp::new(2_000)))
            .unwrap());
        assert!(!record
            .apply(&key, Versioned::new(Variable::Flag(false), Timestamp::new(1_500)))
            .unwrap());
        assert_eq!(record.get(&key).unwrap().value, Variable::Flag(true));
    }

    #[test]
    fn test_standard_fields_are_typed() {
        let mut record = create_test_record("lobby");
        let key = FieldKey::Standard(StandardField::Vanished);
        assert!(record
            .apply(&key, Versioned::now(Variable::Text("yes".into())))
            .is_err());
    }

    #[test]
    fn test_spoofed_update_rejected_without_mutation() {
        let mut table = RecordTable::new();
        let record = create_test_record("lobby");
        let id = record.id();
        table.insert(record);
        let before = table.clone();

        let key = FieldKey::Standard(StandardField::Vanished);
        let value = Versioned::new(Variable::Flag(true), Timestamp::new(5_000));
        assert!(table.apply_update("games", &id, &key, value.clone()).is_err());
        assert_eq!(table, before);

        assert!(table.apply_update("lobby", &id, &key, value.clone()).unwrap());
        assert!(table
            .apply_update(HUB_NAME, &id, &key, Versioned::new(Variable::Flag(false), Timestamp::new(6_000)))
            .unwrap());
    }

    #[test]
    fn test_custom_fields_skip_owner_check() {
        let mut table = RecordTable::new();
        let record = create_test_record("lobby");
        let id = record.id();
        table.insert(record);

        let key = FieldKey::custom("economy", "balance");
        assert!(table
            .apply_update("games", &id, &key, Versioned::now(Variable::Text("12".into())))
            .unwrap());
        assert_eq!(
            table.get(&id).unwrap().get(&key).unwrap().value,
            Variable::Text("12".into())
        );
    }

    #[test]
    fn test_digest_ignores_insertion_order_and_timestamps() {
        let a = SessionRecord::new(Uuid::new_v4(), "Alex", "lobby", Timestamp::new(1));
        let b = SessionRecord::new(Uuid::new_v4(), "Sam", "games", Timestamp::new(2));

        let mut first = RecordTable::new();
        first.insert(a.clone());
        first.insert(b.clone());

        let mut second = RecordTable::new();
        second.insert(b);
        let mut restamped = a;
        restamped.put(
            &StandardField::Server.into(),
            Some(Versioned::new(Variable::Text("lobby".into()), Timestamp::new(99))),
        );
        second.insert(restamped);

        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn test_digest_changes_with_values() {
        let mut table = RecordTable::new();
        let record = create_test_record("lobby");
        let id = record.id();
        table.insert(record);
        let before = table.digest();

        table
            .get_mut(&id)
            .unwrap()
            .apply(
                &FieldKey::Standard(StandardField::Tags),
                Versioned::now(Variable::Strings(["vip".to_string()].into())),
            )
            .unwrap();
        assert_ne!(before, table.digest());
    }

    #[test]
    fn test_retain_returns_removed() {
        let mut table = RecordTable::new();
        table.insert(create_test_record("lobby"));
        table.insert(create_test_record("games"));

        let removed = table.retain(|r| r.server() == Some("lobby"));
        assert_eq!(removed.len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_record_message_wire_shape() {
        let record = create_test_record("lobby");
        let envelope = RecordMessage::Join {
            record: record.clone(),
        }
        .into_envelope()
        .unwrap();
        assert_eq!(envelope.payload()["action"], "join");
        assert_eq!(
            RecordMessage::from_envelope(&envelope).unwrap(),
            RecordMessage::Join { record }
        );

        let texture = Variable::Blob(vec![0xde, 0xad]);
        let json = serde_json::to_value(&texture).unwrap();
        assert_eq!(json["value"], "3q0=");
    }
}
