//! Connection handshakes
//!
//! Three exchanges bring a [`Connection`] from raw socket to sealed session:
//!
//! - [`accept_leaf`]: the hub authenticates a leaf against its key directory
//! - [`connect_hub`]: the leaf side of the same exchange
//! - [`initiate_peer`] / [`respond_peer`]: two leaves agree a key for a direct
//!   channel, with the hub attesting who published it
//!
//! An empty frame from the hub at a point where it owes data means the leaf
//! was refused. Every failure is folded into a handshake error carrying a
//! [`DisconnectReason`](fabric_core::DisconnectReason).

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use fabric_core::{
    crypto::{random_bytes, random_token, EphemeralKeyExchange},
    types::peer_auth_channel,
    DisconnectReason, EventDispatcher, FabricError, FabricResult, IdentityKey, KeyDirectory,
    KeyExchangeParams, KeyExchangeReply, MessageKind, PeerAuth, SessionCipher, ACK_LITERAL,
    KEY_EXCHANGE_SUITE, P2P_TEST_LITERAL,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::registry::ConnectionIdRegistry;

/// Final hub frame: the name the hub knows the leaf by and its connection id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub name: String,
    pub connection_id: i16,
}

/// Outcome of a successful [`accept_leaf`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub name: String,
    pub connection_id: i16,
    /// The name held a connection id before this handshake
    pub returning: bool,
}

async fn bounded<T, F>(timeout: Duration, exchange: F) -> FabricResult<T>
where
    F: Future<Output = FabricResult<T>>,
{
    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result.map_err(FabricError::into_handshake_failure),
        Err(_) => Err(FabricError::timeout(timeout).into_handshake_failure()),
    }
}

fn protocol_mismatch(ours: &str, theirs: &[u8]) -> FabricError {
    FabricError::handshake(
        DisconnectReason::ProtocolMismatch,
        format!(
            "local version {} but peer speaks {}",
            ours,
            String::from_utf8_lossy(theirs)
        ),
    )
}

// ----------------------------------------------------------------------------
// Hub <-> Leaf
// ----------------------------------------------------------------------------

/// Hub side: authenticate a freshly accepted leaf
pub async fn accept_leaf(
    conn: &Connection,
    keys: &KeyDirectory,
    registry: &ConnectionIdRegistry,
    version: &str,
    timeout: Duration,
) -> FabricResult<Admitted> {
    bounded(timeout, async {
        let exchange = EphemeralKeyExchange::generate();
        let salt = random_bytes::<32>();
        let params = KeyExchangeParams {
            suite: KEY_EXCHANGE_SUITE.to_string(),
            salt,
            public: exchange.public_bytes(),
        };
        conn.write_raw(&bincode::serialize(&params)?).await?;

        let reply: KeyExchangeReply = bincode::deserialize(&conn.read_raw().await?)?;
        let transient = exchange.agree(&reply.public, &salt)?;
        let uuid_bytes = transient.open(&conn.read_raw().await?)?;
        let uuid = Uuid::from_slice(&uuid_bytes)
            .map_err(|_| FabricError::unauthorized("identity is not a UUID"))?;

        let peer = match keys.lookup(&uuid) {
            Some(peer) => peer.clone(),
            None => {
                conn.write_raw(&[]).await?;
                return Err(FabricError::unauthorized(format!("unknown identity {}", uuid)));
            }
        };

        let session_key = SessionCipher::generate_key();
        let wrapped = transient.seal(&peer.identity.seal(&session_key)?)?;
        conn.write_raw(&wrapped).await?;
        conn.install_cipher(SessionCipher::new(&session_key))?;

        let ack = conn.read_raw().await?;
        let verified = SessionCipher::new(&session_key)
            .open(&ack)
            .map(|plain| plain == ACK_LITERAL)
            .unwrap_or(false);
        if !verified {
            conn.write_raw(&[]).await?;
            return Err(FabricError::unauthorized(format!(
                "{} could not prove the session key",
                peer.name
            )));
        }

        conn.write_raw(version.as_bytes()).await?;
        let theirs = conn.read_raw().await?;
        if theirs != version.as_bytes() {
            return Err(protocol_mismatch(version, &theirs));
        }

        let (connection_id, returning) = registry.assign(&peer.name);
        let welcome = Welcome {
            name: peer.name.clone(),
            connection_id,
        };
        conn.write_sealed(&bincode::serialize(&welcome)?).await?;
        debug!(
            "Admitted {} ({}) as connection {}",
            peer.name, uuid, connection_id
        );

        Ok::<_, FabricError>(Admitted {
            name: peer.name,
            connection_id,
            returning,
        })
    })
    .await
}

/// Leaf side: prove our identity to the hub
pub async fn connect_hub(
    conn: &Connection,
    identity: &IdentityKey,
    version: &str,
    timeout: Duration,
) -> FabricResult<Welcome> {
    bounded(timeout, async {
        let params: KeyExchangeParams = bincode::deserialize(&conn.read_raw().await?)?;
        if params.suite != KEY_EXCHANGE_SUITE {
            return Err(FabricError::handshake(
                DisconnectReason::ProtocolMismatch,
                format!("unsupported key exchange suite {}", params.suite),
            ));
        }

        let exchange = EphemeralKeyExchange::generate();
        let reply = KeyExchangeReply {
            public: exchange.public_bytes(),
        };
        conn.write_raw(&bincode::serialize(&reply)?).await?;
        let transient = exchange.agree(&params.public, &params.salt)?;
        conn.write_raw(&transient.seal(identity.uuid().as_bytes())?)
            .await?;

        let wrapped = conn.read_raw().await?;
        if wrapped.is_empty() {
            return Err(FabricError::unauthorized(format!(
                "hub does not admit identity {}",
                identity.uuid()
            )));
        }
        let session_key = identity.open_sealed(&transient.open(&wrapped)?)?;
        conn.install_cipher(SessionCipher::from_slice(&session_key)?)?;
        conn.write_sealed(ACK_LITERAL).await?;

        let hub_version = conn.read_raw().await?;
        if hub_version.is_empty() {
            return Err(FabricError::unauthorized("hub rejected the session key"));
        }
        conn.write_raw(version.as_bytes()).await?;
        if hub_version != version.as_bytes() {
            return Err(protocol_mismatch(version, &hub_version));
        }

        let welcome: Welcome = bincode::deserialize(&conn.read_sealed().await?)?;
        Ok::<_, FabricError>(welcome)
    })
    .await
}

// ----------------------------------------------------------------------------
// Peer <-> Peer
// ----------------------------------------------------------------------------

/// Dialing side of a direct channel
///
/// `publish(token, key)` must deliver a [`PeerAuth`] carrying `key` through
/// the hub on the `peer-auth:<token>` channel, addressed to the responder.
pub async fn initiate_peer<P, Fut>(
    conn: &Connection,
    local_name: &str,
    publish: P,
    timeout: Duration,
) -> FabricResult<()>
where
    P: FnOnce(String, String) -> Fut,
    Fut: Future<Output = FabricResult<()>>,
{
    bounded(timeout, async {
        conn.write_raw(local_name.as_bytes()).await?;
        let token = conn.read_raw().await?;
        if token.is_empty() {
            return Err(FabricError::unauthorized("peer refused the channel"));
        }
        let token = String::from_utf8(token)
            .map_err(|_| FabricError::malformed("context token is not UTF-8"))?;

        let key = SessionCipher::generate_key();
        publish(token, BASE64.encode(key)).await?;
        conn.install_cipher(SessionCipher::new(&key))?;

        let probe = conn.read_sealed().await?;
        if probe != P2P_TEST_LITERAL {
            return Err(FabricError::unauthorized("peer sent the wrong test literal"));
        }
        conn.write_sealed(P2P_TEST_LITERAL).await
    })
    .await
}

/// Removes the peer-auth listener whichever way the exchange ends
struct ChannelRegistration<'a> {
    dispatcher: &'a EventDispatcher,
    channel: String,
}

impl Drop for ChannelRegistration<'_> {
    fn drop(&mut self) {
        self.dispatcher.unregister_channel(&self.channel);
    }
}

/// Accepting side of a direct channel; returns the authenticated peer name
pub async fn respond_peer(
    conn: &Connection,
    dispatcher: &EventDispatcher,
    timeout: Duration,
) -> FabricResult<String> {
    bounded(timeout, async {
        let claimed = String::from_utf8(conn.read_raw().await?)
            .map_err(|_| FabricError::malformed("peer name is not UTF-8"))?;
        if claimed.is_empty() {
            return Err(FabricError::unauthorized("peer did not name itself"));
        }

        let token = random_token();
        let channel = peer_auth_channel(&token);
        let (tx, rx) = oneshot::channel::<String>();
        let slot = Mutex::new(Some(tx));
        let expected = claimed.clone();
        dispatcher.register(MessageKind::PeerAuth, Some(&channel), move |sender, envelope| {
            if sender != expected {
                warn!("Peer key for {} published by {}", expected, sender);
                return Err(FabricError::unauthorized(format!(
                    "key published by {} instead of {}",
                    sender, expected
                )));
            }
            let auth: PeerAuth = envelope.decode()?;
            if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(auth.key);
            }
            Ok(())
        });
        let _registration = ChannelRegistration {
            dispatcher,
            channel,
        };

        conn.write_raw(token.as_bytes()).await?;
        let key = rx
            .await
            .map_err(|_| FabricError::unauthorized("peer key never arrived"))?;
        let key = BASE64
            .decode(key)
            .map_err(|_| FabricError::unauthorized("peer key is not base64"))?;
        conn.install_cipher(SessionCipher::from_slice(&key)?)?;

        conn.write_sealed(P2P_TEST_LITERAL).await?;
        let echo = conn.read_sealed().await?;
        if echo != P2P_TEST_LITERAL {
            return Err(FabricError::unauthorized("peer echoed the wrong test literal"));
        }
        Ok::<_, FabricError>(claimed)
    })
    .await
}
