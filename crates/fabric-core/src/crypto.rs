//! Cryptographic primitives for the fabric
//!
//! Thin wrappers over X25519 agreement, SHA-256 key derivation and
//! ChaCha20-Poly1305. Everything the handshakes need is here: the session
//! cipher, the ephemeral exchange, static identity keys and the sealed box
//! used to hand a session key to a static public key.

use core::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::errors::{CryptographicError, FabricResult};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Key agreement suite advertised in the hub's first handshake frame
pub const KEY_EXCHANGE_SUITE: &str = "X25519-SHA256-ChaCha20Poly1305";

/// Symmetric key size
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce size
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag size
pub const TAG_LEN: usize = 16;

/// Literal a leaf returns under the fresh session key
pub const ACK_LITERAL: &[u8] = b"fabric-session-ack";

/// Literal bounced between p2p peers to prove key possession
pub const P2P_TEST_LITERAL: &[u8] = b"fabric-p2p-test";

const TRANSIENT_LABEL: &[u8] = b"fabric/transient";
const SEALED_BOX_LABEL: &[u8] = b"fabric/sealed-box";

// ----------------------------------------------------------------------------
// Randomness and Derivation
// ----------------------------------------------------------------------------

/// Fill a fixed-size array from the OS generator
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Random hex token used as a p2p context
pub fn random_token() -> String {
    hex::encode(random_bytes::<16>())
}

/// `SHA-256(label || salt || shared)`
pub fn derive_key(label: &[u8], salt: &[u8], shared: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(salt);
    hasher.update(shared);
    hasher.finalize().into()
}

// ----------------------------------------------------------------------------
// Session Cipher
// ----------------------------------------------------------------------------

/// Symmetric frame cipher: output is `nonce || ciphertext || tag`
#[derive(Clone)]
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Build from an untrusted key buffer
    pub fn from_slice(key: &[u8]) -> FabricResult<Self> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| CryptographicError::InvalidKeyFormat)?;
        Ok(Self::new(&key))
    }

    /// Fresh random session key
    pub fn generate_key() -> [u8; KEY_LEN] {
        random_bytes::<KEY_LEN>()
    }

    /// Encrypt a frame body; an empty body still carries nonce and tag
    pub fn seal(&self, plaintext: &[u8]) -> FabricResult<Vec<u8>> {
        let nonce = random_bytes::<NONCE_LEN>();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptographicError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a frame body produced by [`SessionCipher::seal`]
    pub fn open(&self, sealed: &[u8]) -> FabricResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptographicError::SealedPayloadTooShort {
                actual: sealed.len(),
            }
            .into());
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptographicError::DecryptionFailed)?;
        Ok(plaintext)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Ephemeral Key Exchange
// ----------------------------------------------------------------------------

/// First handshake frame sent by the hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeParams {
    pub suite: String,
    pub salt: [u8; 32],
    pub public: [u8; 32],
}

/// Leaf's answer carrying its ephemeral public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeReply {
    pub public: [u8; 32],
}

/// One side of an ephemeral X25519 exchange
pub struct EphemeralKeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyExchange {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Consume the secret and derive the transient cipher
    pub fn agree(self, peer_public: &[u8; 32], salt: &[u8]) -> FabricResult<SessionCipher> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptographicError::InvalidKeyFormat.into());
        }
        let key = derive_key(TRANSIENT_LABEL, salt, shared.as_bytes());
        Ok(SessionCipher::new(&key))
    }
}

impl fmt::Debug for EphemeralKeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyExchange")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Static Identity Keys
// ----------------------------------------------------------------------------

/// Long-term X25519 identity of a leaf, bound to its UUID
#[derive(Clone)]
pub struct IdentityKey {
    uuid: Uuid,
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKey {
    /// Generate a new random identity under a fresh UUID
    pub fn generate() -> Self {
        Self::generate_for(Uuid::new_v4())
    }

    /// Generate a new random identity for a given UUID
    pub fn generate_for(uuid: Uuid) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            uuid,
            secret,
            public,
        }
    }

    /// Rebuild from stored private key bytes
    pub fn from_bytes(uuid: Uuid, private_key: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_key);
        let public = PublicKey::from(&secret);
        Self {
            uuid,
            secret,
            public,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_identity(&self) -> PublicIdentity {
        PublicIdentity {
            uuid: self.uuid,
            public: self.public,
        }
    }

    /// Open a sealed box addressed to this identity
    pub fn open_sealed(&self, sealed: &[u8]) -> FabricResult<Vec<u8>> {
        if sealed.len() < 32 {
            return Err(CryptographicError::SealedPayloadTooShort {
                actual: sealed.len(),
            }
            .into());
        }
        let (ephemeral, body) = sealed.split_at(32);
        let ephemeral: [u8; 32] = ephemeral
            .try_into()
            .map_err(|_| CryptographicError::InvalidKeyFormat)?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(ephemeral));
        let key = sealed_box_key(&ephemeral, self.public.as_bytes(), shared.as_bytes());
        SessionCipher::new(&key)
            .open(body)
            .map_err(|_| CryptographicError::DecryptionFailed.into())
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("uuid", &self.uuid)
            .field("fingerprint", &self.public_identity().fingerprint())
            .finish_non_exhaustive()
    }
}

/// Public half of an identity, as held by the hub's key directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicIdentity {
    uuid: Uuid,
    public: PublicKey,
}

impl PublicIdentity {
    pub fn from_bytes(uuid: Uuid, public_key: [u8; 32]) -> Self {
        Self {
            uuid,
            public: PublicKey::from(public_key),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Short hex fingerprint of the public key
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.public.as_bytes());
        hex::encode(&digest[..8])
    }

    /// Seal a payload so only the matching private key can open it
    ///
    /// Layout: `ephemeral public (32) || nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> FabricResult<Vec<u8>> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.public);
        let key = sealed_box_key(
            ephemeral_public.as_bytes(),
            self.public.as_bytes(),
            shared.as_bytes(),
        );

        let body = SessionCipher::new(&key).seal(plaintext)?;
        let mut sealed = Vec::with_capacity(32 + body.len());
        sealed.extend_from_slice(ephemeral_public.as_bytes());
        sealed.extend_from_slice(&body);
        Ok(sealed)
    }
}

fn sealed_box_key(ephemeral: &[u8; 32], recipient: &[u8; 32], shared: &[u8; 32]) -> [u8; KEY_LEN] {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);
    derive_key(SEALED_BOX_LABEL, &salt, shared)
}
