//! Direct leaf-to-leaf channels
//!
//! The hub's roster tells each leaf where its siblings listen. For every pair
//! the lexically smaller name dials; the other side accepts. The symmetric key
//! travels through the hub on a one-time `peer-auth:<token>` channel so the
//! hub attests the dialer's identity. Envelopes addressed to exactly one
//! sibling take the direct channel when it is live.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fabric_core::{
    types::peer_auth_channel, Envelope, FabricError, FabricResult, Identifier, MessageKind,
    PeerAuth, ServerEntry,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::handshake::{initiate_peer, respond_peer};
use crate::leaf::Leaf;

// ----------------------------------------------------------------------------
// Channel Table
// ----------------------------------------------------------------------------

struct PeerChannel {
    conn: Arc<Connection>,
    /// Address we dialed; `None` when the sibling dialed us
    dialed: Option<String>,
}

/// Direct channels and the roster they are built from
#[derive(Default)]
pub(crate) struct PeerChannels {
    book: StdRwLock<BTreeMap<String, Option<String>>>,
    channels: DashMap<String, PeerChannel>,
    dialing: StdMutex<HashSet<String>>,
    listen_port: OnceLock<u16>,
    inbound: DashMap<Identifier, (Arc<Connection>, Instant)>,
}

impl PeerChannels {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Live channel to `name`
    pub(crate) fn live(&self, name: &str) -> Option<Arc<Connection>> {
        self.channels
            .get(name)
            .map(|channel| Arc::clone(&channel.conn))
            .filter(|conn| !conn.is_closed())
    }

    pub(crate) fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .iter()
            .filter(|entry| !entry.conn.is_closed())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    fn in_roster(&self, name: &str) -> bool {
        self.book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.channels
            .iter()
            .map(|entry| Arc::clone(&entry.conn))
            .collect()
    }

    pub(crate) fn reset_replay(&self, connection_id: i16) {
        for conn in self.connections() {
            conn.reset_replay(connection_id);
        }
    }

    /// Keep channels warm and drop the ones that went silent
    pub(crate) async fn keep_alive(&self, silent_after: Duration) {
        for conn in self.connections() {
            if conn.idle_for() > silent_after {
                debug!(
                    "Direct channel to {} silent for {:?}, closing",
                    conn.name().unwrap_or("?"),
                    conn.idle_for()
                );
                conn.close().await;
            } else if let Err(e) = conn.send_keep_alive().await {
                trace!("Direct keep-alive failed: {}", e);
            }
        }
    }

    pub(crate) async fn close_all(&self) {
        let conns = self.connections();
        self.channels.clear();
        for conn in conns {
            conn.close().await;
        }
    }

    // Inbound requests -------------------------------------------------------

    fn remember_request(&self, id: Identifier, conn: &Arc<Connection>) {
        self.inbound.insert(id, (Arc::clone(conn), Instant::now()));
    }

    /// Channel a request arrived on, if it came in directly
    pub(crate) fn take_inbound(&self, id: &Identifier) -> Option<Arc<Connection>> {
        self.inbound
            .remove(id)
            .map(|(_, (conn, _))| conn)
            .filter(|conn| !conn.is_closed())
    }

    pub(crate) fn purge_inbound(&self, ttl: Duration) {
        self.inbound
            .retain(|_, (conn, seen)| seen.elapsed() < ttl && !conn.is_closed());
    }
}

// ----------------------------------------------------------------------------
// Leaf Integration
// ----------------------------------------------------------------------------

impl Leaf {
    /// Bind the direct-channel listener once and return its port
    pub(crate) async fn ensure_p2p_listener(self: &Arc<Self>) -> FabricResult<u16> {
        if let Some(port) = self.peers.listen_port.get() {
            return Ok(*port);
        }
        let listener = TcpListener::bind(&self.config.leaf.p2p_bind_address).await?;
        let port = listener.local_addr()?.port();
        if self.peers.listen_port.set(port).is_err() {
            // another session bound first
            return self
                .peers
                .listen_port
                .get()
                .copied()
                .ok_or_else(|| FabricError::config_error("p2p listener port unset"));
        }
        info!("Direct channels listening on port {}", port);
        self.track([tokio::spawn(Arc::clone(self).p2p_accept_loop(listener))]);
        Ok(port)
    }

    async fn p2p_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if self.is_shut_down() {
                        return;
                    }
                    trace!("Direct channel attempt from {}", addr);
                    tokio::spawn(Arc::clone(&self).accept_peer(stream));
                }
                Err(e) => {
                    warn!("Direct channel accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn accept_peer(self: Arc<Self>, stream: TcpStream) {
        let result = async {
            let conn = Connection::new(stream, self.config.connection.clone(), self.config.replay)?;
            let name = respond_peer(
                &conn,
                &self.dispatcher,
                self.config.leaf.p2p_handshake_timeout(),
            )
            .await;
            let name = match name {
                Ok(name) => name,
                Err(e) => {
                    conn.close().await;
                    return Err(e);
                }
            };
            if !self.peers.in_roster(&name) {
                conn.close().await;
                return Err(FabricError::unauthorized(format!(
                    "{} is not on the roster",
                    name
                )));
            }
            conn.authenticate(name.clone(), self.current_ids()?)?;
            Ok::<_, FabricError>((name, conn))
        }
        .await;

        match result {
            Ok((name, conn)) => self.install_channel(name, Arc::new(conn), None).await,
            Err(e) => debug!("Refused direct channel: {}", e),
        }
    }

    /// Rebuild the address book from a roster and dial new siblings
    pub(crate) fn apply_roster(self: &Arc<Self>, servers: Vec<ServerEntry>) {
        let Some(me) = self.name() else {
            return;
        };
        let roster: BTreeMap<String, Option<String>> = servers
            .into_iter()
            .filter(|entry| entry.name != me)
            .map(|entry| (entry.name, entry.address))
            .collect();

        let stale: Vec<String> = self
            .peers
            .channels
            .iter()
            .filter(|entry| match roster.get(entry.key()) {
                None => true,
                Some(address) => entry.dialed.is_some() && *address != entry.dialed,
            })
            .map(|entry| entry.key().clone())
            .collect();
        for name in stale {
            if let Some((_, channel)) = self.peers.channels.remove(&name) {
                debug!("Dropping direct channel to {}", name);
                tokio::spawn(async move { channel.conn.close().await });
            }
        }

        *self
            .peers
            .book
            .write()
            .unwrap_or_else(PoisonError::into_inner) = roster.clone();

        if !self.config.leaf.p2p_enabled {
            return;
        }
        for (name, address) in roster {
            let Some(address) = address else {
                continue;
            };
            if me.as_str() >= name.as_str() || self.peers.live(&name).is_some() {
                continue;
            }
            let fresh = self
                .peers
                .dialing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.clone());
            if fresh {
                tokio::spawn(Arc::clone(self).dial_peer(name, address));
            }
        }
    }

    async fn dial_peer(self: Arc<Self>, name: String, address: String) {
        let result = self.open_channel(&name, &address).await;
        self.peers
            .dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);

        match result {
            Ok(conn) => self.install_channel(name, conn, Some(address)).await,
            Err(e) => debug!("Direct channel to {} at {} failed: {}", name, address, e),
        }
    }

    async fn open_channel(self: &Arc<Self>, name: &str, address: &str) -> FabricResult<Arc<Connection>> {
        let timeout = self.config.leaf.p2p_handshake_timeout();
        let local_name = self
            .name()
            .ok_or_else(|| FabricError::not_connected(name))?;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| FabricError::timeout(timeout))??;
        let conn = Connection::new(stream, self.config.connection.clone(), self.config.replay)?;

        let leaf = Arc::clone(self);
        let responder = name.to_string();
        let handshake = initiate_peer(
            &conn,
            &local_name,
            move |token: String, key: String| async move {
                let auth = Envelope::new(MessageKind::PeerAuth)
                    .with_channel(peer_auth_channel(&token))
                    .with_typed_payload(&PeerAuth { key })?
                    .to(responder);
                leaf.hub_connection()?.send(auth).await
            },
            timeout,
        )
        .await;
        if let Err(e) = handshake {
            conn.close().await;
            return Err(e);
        }

        conn.authenticate(name.to_string(), self.current_ids()?)?;
        Ok(Arc::new(conn))
    }

    async fn install_channel(self: Arc<Self>, name: String, conn: Arc<Connection>, dialed: Option<String>) {
        if self.is_shut_down() {
            conn.close().await;
            return;
        }
        let channel = PeerChannel {
            conn: Arc::clone(&conn),
            dialed,
        };
        if let Some(previous) = self.peers.channels.insert(name.clone(), channel) {
            previous.conn.close().await;
        }
        info!("Direct channel to {} established", name);
        tokio::spawn(self.peer_receive_loop(name, conn));
    }

    async fn peer_receive_loop(self: Arc<Self>, name: String, conn: Arc<Connection>) {
        loop {
            match conn.listen().await {
                Ok(Some(envelope)) => {
                    if envelope.is_response() {
                        continue;
                    }
                    if let Some(id) = envelope.id() {
                        self.peers.remember_request(id, &conn);
                    }
                    self.dispatch_local(&name, envelope);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Direct channel to {} ended: {}", name, e);
                    break;
                }
            }
        }

        self.peers
            .channels
            .remove_if(&name, |_, channel| Arc::ptr_eq(&channel.conn, &conn));
        conn.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_inbound_is_one_shot() {
        let channels = PeerChannels::new();
        assert!(channels.take_inbound(&Identifier::compose(1, 1)).is_none());
        assert!(channels.live_names().is_empty());
        assert!(channels.live("beta").is_none());
    }

    #[test]
    fn test_roster_membership() {
        let channels = PeerChannels::new();
        channels
            .book
            .write()
            .unwrap()
            .insert("beta".to_string(), Some("127.0.0.1:9".to_string()));
        assert!(channels.in_roster("beta"));
        assert!(!channels.in_roster("gamma"));
    }
}
