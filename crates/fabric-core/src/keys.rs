//! Key files and the hub's key directory
//!
//! Key material is stored as small JSON documents:
//! `{"type": "private"|"public", "uuid": ..., "name": ..., "key": <base64>}`.
//! A leaf keeps its private file; the hub reads a directory of public files
//! and admits only the UUIDs it finds there.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::{IdentityKey, PublicIdentity};
use crate::errors::{FabricError, FabricResult};

// ----------------------------------------------------------------------------
// Key Files
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Private,
    Public,
}

/// On-disk key document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFile {
    #[serde(rename = "type")]
    pub kind: KeyKind,
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub key: String,
}

impl KeyFile {
    /// Private key document for a leaf identity
    pub fn private(identity: &IdentityKey, name: Option<String>) -> Self {
        Self {
            kind: KeyKind::Private,
            uuid: identity.uuid(),
            name,
            key: STANDARD.encode(identity.private_key_bytes()),
        }
    }

    /// Public key document for the hub's directory
    pub fn public(identity: &PublicIdentity, name: impl Into<String>) -> Self {
        Self {
            kind: KeyKind::Public,
            uuid: identity.uuid(),
            name: Some(name.into()),
            key: STANDARD.encode(identity.public_key_bytes()),
        }
    }

    pub fn from_json(json: &str) -> FabricResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> FabricResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> FabricResult<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            FabricError::key_error(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: &Path) -> FabricResult<()> {
        fs::write(path, self.to_json()?).map_err(|e| {
            FabricError::key_error(format!("cannot write {}: {}", path.display(), e))
        })
    }

    fn key_bytes(&self) -> FabricResult<[u8; 32]> {
        let bytes = STANDARD
            .decode(self.key.trim())
            .map_err(|e| FabricError::key_error(format!("invalid base64 key: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| FabricError::key_error("key must be 32 bytes"))
    }

    /// Decode a private key document
    pub fn into_identity(self) -> FabricResult<IdentityKey> {
        if self.kind != KeyKind::Private {
            return Err(FabricError::key_error(format!(
                "key {} is not a private key",
                self.uuid
            )));
        }
        Ok(IdentityKey::from_bytes(self.uuid, self.key_bytes()?))
    }

    /// Decode a public key document; a private document yields its public half
    pub fn to_public(&self) -> FabricResult<PublicIdentity> {
        let bytes = self.key_bytes()?;
        match self.kind {
            KeyKind::Public => Ok(PublicIdentity::from_bytes(self.uuid, bytes)),
            KeyKind::Private => Ok(IdentityKey::from_bytes(self.uuid, bytes).public_identity()),
        }
    }
}

// ----------------------------------------------------------------------------
// Key Directory
// ----------------------------------------------------------------------------

/// Admitted leaf identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerKey {
    pub name: String,
    pub identity: PublicIdentity,
}

/// UUID-indexed public keys the hub admits
#[derive(Debug, Clone, Default)]
pub struct KeyDirectory {
    entries: HashMap<Uuid, PeerKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every `*.json` key document in a directory
    ///
    /// Entries without a name fall back to the file stem. Unreadable files are
    /// skipped with a warning.
    pub fn load(dir: &Path) -> FabricResult<Self> {
        let mut directory = Self::new();
        let entries = fs::read_dir(dir).map_err(|e| {
            FabricError::key_error(format!("cannot list {}: {}", dir.display(), e))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let file = match KeyFile::load(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("Skipping key file {}: {}", path.display(), e);
                    continue;
                }
            };
            let name = match file.name.clone().or_else(|| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            }) {
                Some(name) => name,
                None => continue,
            };
            match file.to_public() {
                Ok(identity) => {
                    debug!("Loaded key for {} ({})", name, identity.uuid());
                    directory.insert(name, identity);
                }
                Err(e) => warn!("Skipping key file {}: {}", path.display(), e),
            }
        }
        Ok(directory)
    }

    pub fn insert(&mut self, name: impl Into<String>, identity: PublicIdentity) {
        self.entries.insert(
            identity.uuid(),
            PeerKey {
                name: name.into(),
                identity,
            },
        );
    }

    pub fn lookup(&self, uuid: &Uuid) -> Option<&PeerKey> {
        self.entries.get(uuid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
