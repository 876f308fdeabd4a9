//! Leaf dialer
//!
//! A leaf keeps one authenticated link to the hub alive, reconnecting with
//! exponential backoff, and opens direct channels to siblings it learns about
//! from the hub's roster. The link follows the [`LinkState`] machine;
//! `wait_ready` resolves on the first success or the first refusal.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fabric_core::{
    ConnectionIdReset, DisconnectReason, Envelope, EventDispatcher, FabricConfig, FabricError,
    FabricResult, IdSource, IdentityKey, Identifier, LinkEvent, LinkState, MessageKind, Payload,
    ServerList, HUB_NAME,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{wait_for_flag, Connection, ResponseHandler};
use crate::handshake::connect_hub;
use crate::peer::PeerChannels;
use crate::replication::{RecordStore, StoreRole};
use crate::services::{
    install_builtin_services, permission_answer, permission_request, ping_request,
    spawn_dispatch_worker, time_ping, DispatchQueue, Endpoint, PermissionCheckFn, PermissionSlot,
};

/// First resolution of a leaf's link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    Connected,
    Rejected {
        reason: DisconnectReason,
        detail: String,
    },
}

type Inbox = mpsc::UnboundedReceiver<(String, Envelope)>;

/// A node connected to the hub
pub struct Leaf {
    pub(crate) config: FabricConfig,
    identity: IdentityKey,
    name: StdRwLock<Option<String>>,
    state: watch::Sender<LinkState>,
    ready: watch::Sender<Option<ReadyOutcome>>,
    hub: StdRwLock<Option<Arc<Connection>>>,
    ids: StdMutex<Option<Arc<IdSource>>>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    queue: DispatchQueue,
    inbox: StdMutex<Option<Inbox>>,
    records: Arc<RecordStore>,
    pub(crate) peers: PeerChannels,
    permissions: PermissionSlot,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Leaf {
    pub fn new(config: FabricConfig, identity: IdentityKey) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Leaf>| {
            let endpoint: Weak<dyn Endpoint> = weak.clone();
            let dispatcher = Arc::new(EventDispatcher::new());
            let permissions: PermissionSlot = Arc::new(StdRwLock::new(None));
            install_builtin_services(&dispatcher, endpoint.clone(), permissions.clone());

            let records = Arc::new(RecordStore::new(
                StoreRole::Leaf,
                endpoint,
                config.replication.clone(),
            ));
            let (queue, inbox) = mpsc::unbounded_channel();
            let (state, _) = watch::channel(LinkState::Disconnected);
            let (ready, _) = watch::channel(None);
            let (shutdown, _) = watch::channel(false);

            Self {
                config,
                identity,
                name: StdRwLock::new(None),
                state,
                ready,
                hub: StdRwLock::new(None),
                ids: StdMutex::new(None),
                dispatcher,
                queue,
                inbox: StdMutex::new(Some(inbox)),
                records,
                peers: PeerChannels::new(),
                permissions,
                shutdown,
                tasks: StdMutex::new(Vec::new()),
            }
        })
    }

    /// Start dialing the hub in the background
    pub fn start(self: &Arc<Self>) -> FabricResult<()> {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| FabricError::config_error("leaf already started"))?;

        let tasks = vec![
            spawn_dispatch_worker(Arc::clone(&self.dispatcher), inbox),
            self.records.attach(&self.dispatcher),
            tokio::spawn(Arc::clone(self).supervise()),
            tokio::spawn(Arc::clone(self).keep_alive_loop()),
        ];
        self.track(tasks);
        Ok(())
    }

    pub(crate) fn track(&self, tasks: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
    }

    /// Wait until the link first authenticates or is refused
    pub async fn wait_ready(&self, timeout: Duration) -> FabricResult<()> {
        let mut ready = self.ready.subscribe();
        let outcome = tokio::time::timeout(timeout, async move {
            ready
                .wait_for(Option::is_some)
                .await
                .map(|outcome| (*outcome).clone())
        })
        .await;

        match outcome {
            Err(_) => Err(FabricError::timeout(timeout)),
            Ok(Err(_)) => Err(FabricError::closed()),
            Ok(Ok(Some(ReadyOutcome::Connected))) => Ok(()),
            Ok(Ok(Some(ReadyOutcome::Rejected { reason, detail }))) => {
                Err(FabricError::handshake(reason, detail))
            }
            Ok(Ok(None)) => Err(FabricError::closed()),
        }
    }

    // Accessors --------------------------------------------------------------

    /// Name the hub admitted us under
    pub fn name(&self) -> Option<String> {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Listener registry for envelopes delivered to this leaf
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    pub fn set_permission_check(&self, check: PermissionCheckFn) {
        *self
            .permissions
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(check);
    }

    /// Siblings with a live direct channel
    pub fn direct_peers(&self) -> Vec<String> {
        self.peers.live_names()
    }

    pub(crate) fn hub_connection(&self) -> FabricResult<Arc<Connection>> {
        self.hub
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
            .ok_or_else(|| FabricError::not_connected(HUB_NAME))
    }

    pub(crate) fn current_ids(&self) -> FabricResult<Arc<IdSource>> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| FabricError::not_connected(HUB_NAME))
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn dispatch_local(&self, sender: &str, envelope: Envelope) {
        if self.queue.send((sender.to_string(), envelope)).is_err() {
            debug!("Dispatch queue closed, dropping envelope from {}", sender);
        }
    }

    fn advance(&self, event: LinkEvent) {
        self.state.send_if_modified(|state| match state.transition(event) {
            Ok(next) => {
                let changed = *state != next;
                *state = next;
                changed
            }
            Err(e) => {
                warn!("Ignoring link event: {}", e);
                false
            }
        });
    }

    fn resolve_ready(&self, outcome: ReadyOutcome) {
        self.ready.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }

    // Sending ----------------------------------------------------------------

    /// Live direct channel for an envelope addressed to exactly one sibling
    fn direct_route(&self, envelope: &Envelope) -> Option<Arc<Connection>> {
        let peer = envelope.forward()?.single_peer()?;
        self.peers.live(peer)
    }

    /// Send an envelope, directly when it targets one connected sibling
    pub async fn send(&self, mut envelope: Envelope) -> FabricResult<()> {
        if let Some(name) = self.name() {
            envelope.ensure_origin(&name);
        }
        if let Some(direct) = self.direct_route(&envelope) {
            match direct.send(envelope.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("Direct send failed, relaying through the hub: {}", e),
            }
        }
        self.hub_connection()?.send(envelope).await
    }

    /// Send and keep `handler` until the response arrives on the same link
    pub async fn send_with_handler(
        &self,
        mut envelope: Envelope,
        handler: ResponseHandler,
    ) -> FabricResult<Identifier> {
        if let Some(name) = self.name() {
            envelope.ensure_origin(&name);
        }
        let link = match self.direct_route(&envelope) {
            Some(direct) => direct,
            None => self.hub_connection()?,
        };
        link.send_with_handler(envelope, handler).await
    }

    /// Send a request and wait for its response
    pub async fn request(&self, mut envelope: Envelope, timeout: Duration) -> FabricResult<Envelope> {
        if let Some(name) = self.name() {
            envelope.ensure_origin(&name);
        }
        let link = match self.direct_route(&envelope) {
            Some(direct) => direct,
            None => self.hub_connection()?,
        };
        link.request(envelope, timeout).await
    }

    fn addressed(envelope: Envelope, target: &str) -> Envelope {
        if target == HUB_NAME {
            envelope
        } else {
            envelope.to(target)
        }
    }

    /// Round-trip time to the hub or a sibling
    pub async fn ping(&self, target: &str) -> FabricResult<Duration> {
        let timeout = self.config.connection.request_timeout();
        let probe = Self::addressed(ping_request()?, target);
        time_ping(self.request(probe, timeout)).await
    }

    /// Ask the hub or a sibling whether `player` holds `permission`
    pub async fn has_permission(&self, target: &str, player: Uuid, permission: &str) -> FabricResult<bool> {
        let timeout = self.config.connection.request_timeout();
        let query = Self::addressed(permission_request(player, permission)?, target);
        permission_answer(&self.request(query, timeout).await?)
    }

    /// Stop reconnecting and close every link
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Leaf {} closing", self.name().unwrap_or_default());
        self.advance(LinkEvent::Close);
        let hub = self
            .hub
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hub) = hub {
            hub.close().await;
        }
        self.peers.close_all().await;
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }

    // Supervisor -------------------------------------------------------------

    async fn supervise(self: Arc<Self>) {
        let mut failures: u32 = 0;
        loop {
            if self.is_shut_down() {
                return;
            }
            self.advance(LinkEvent::Dial);

            match self.dial().await {
                Ok(conn) => {
                    failures = 0;
                    self.advance(LinkEvent::Authenticated);
                    self.resolve_ready(ReadyOutcome::Connected);
                    self.run_session(conn).await;
                    if self.is_shut_down() {
                        return;
                    }
                    self.advance(LinkEvent::Lost);
                    info!("Lost connection to hub, reconnecting");
                }
                Err(e) => match e.disconnect_reason() {
                    Some(reason) if reason.is_fatal() => {
                        error!("Hub refused this leaf: {}", e);
                        self.advance(LinkEvent::Rejected);
                        self.resolve_ready(ReadyOutcome::Rejected {
                            reason,
                            detail: e.to_string(),
                        });
                        return;
                    }
                    _ => {
                        failures = failures.saturating_add(1);
                        self.advance(LinkEvent::Lost);
                        let delay = self.config.leaf.backoff_delay(failures);
                        if failures <= 3 || failures % 10 == 0 {
                            warn!(
                                "Cannot reach hub at {} (attempt {}): {}; retrying in {:?}",
                                self.config.leaf.hub_address, failures, e, delay
                            );
                        } else {
                            debug!("Hub still unreachable (attempt {}): {}", failures, e);
                        }
                        let stopped = tokio::select! {
                            _ = tokio::time::sleep(delay) => false,
                            _ = wait_for_flag(self.shutdown.subscribe()) => true,
                        };
                        if stopped {
                            return;
                        }
                    }
                },
            }
        }
    }

    async fn dial(&self) -> FabricResult<Arc<Connection>> {
        let timeout = self.config.leaf.connect_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.config.leaf.hub_address))
            .await
            .map_err(|_| FabricError::timeout(timeout))??;
        let conn = Connection::new(stream, self.config.connection.clone(), self.config.replay)?;
        self.advance(LinkEvent::Connected);

        let welcome = connect_hub(&conn, &self.identity, &self.config.protocol_version, timeout).await?;
        conn.authenticate(HUB_NAME.to_string(), self.id_source_for(welcome.connection_id))?;
        info!(
            "Connected to hub as {} (connection {})",
            welcome.name, welcome.connection_id
        );
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = Some(welcome.name);
        Ok(Arc::new(conn))
    }

    /// Keep the provider across reconnects while the hub hands back the same id
    fn id_source_for(&self, connection_id: i16) -> Arc<IdSource> {
        let mut slot = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(ids) if ids.connection_id() == connection_id => Arc::clone(ids),
            _ => {
                let fresh = Arc::new(IdSource::new(i64::from(connection_id)));
                *slot = Some(Arc::clone(&fresh));
                fresh
            }
        }
    }

    async fn run_session(self: &Arc<Self>, conn: Arc<Connection>) {
        *self.hub.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&conn));

        if self.config.leaf.p2p_enabled {
            if let Err(e) = self.announce_p2p(&conn).await {
                warn!("Direct channels unavailable: {}", e);
            }
        }

        loop {
            match conn.listen().await {
                Ok(Some(envelope)) => self.handle_from_hub(&conn, envelope),
                Ok(None) => {}
                Err(e) => {
                    debug!("Hub link ended: {}", e);
                    break;
                }
            }
        }

        {
            let mut current = self.hub.write().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().map_or(false, |held| Arc::ptr_eq(held, &conn)) {
                *current = None;
            }
        }
        conn.close().await;
    }

    async fn announce_p2p(self: &Arc<Self>, conn: &Connection) -> FabricResult<()> {
        let port = self.ensure_p2p_listener().await?;
        let announce = ServerList::announce(port, self.config.leaf.p2p_advertise_host.clone());
        conn.send(Envelope::new(MessageKind::ServerList).with_typed_payload(&announce)?)
            .await
    }

    fn handle_from_hub(self: &Arc<Self>, conn: &Connection, envelope: Envelope) {
        if envelope.is_response() {
            debug!("Dropping unmatched response relayed by the hub");
            return;
        }
        let sender = envelope.relayed_sender().to_string();

        if sender == HUB_NAME {
            match envelope.kind() {
                MessageKind::ServerList => match envelope.decode::<ServerList>() {
                    Ok(list) => self.apply_roster(list.servers),
                    Err(e) => warn!("Bad roster from hub: {}", e),
                },
                MessageKind::ConnectionIdReset => match envelope.decode::<ConnectionIdReset>() {
                    Ok(reset) => {
                        debug!("Connection {} restarted, clearing its replay window", reset.connection_id);
                        conn.reset_replay(reset.connection_id);
                        self.peers.reset_replay(reset.connection_id);
                    }
                    Err(e) => warn!("Bad connection id reset from hub: {}", e),
                },
                _ => {}
            }
        }
        self.dispatch_local(&sender, envelope);
    }

    async fn keep_alive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.leaf.keep_alive_interval());
        let silent_after = self.config.leaf.upstream_timeout();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_flag(self.shutdown.subscribe()) => return,
            }

            if let Ok(hub) = self.hub_connection() {
                if hub.idle_for() > silent_after {
                    warn!("Hub silent for {:?}, reconnecting", hub.idle_for());
                    hub.close().await;
                } else if let Err(e) = hub.send_keep_alive().await {
                    debug!("Keep-alive to hub failed: {}", e);
                }
            }
            self.peers.keep_alive(silent_after).await;
            self.peers
                .purge_inbound(self.config.connection.callback_ttl());
        }
    }
}

#[async_trait]
impl Endpoint for Leaf {
    fn local_name(&self) -> String {
        self.name().unwrap_or_default()
    }

    async fn publish(&self, envelope: Envelope) -> FabricResult<()> {
        self.send(envelope).await
    }

    async fn respond(&self, sender: &str, request: &Envelope, payload: Payload) -> FabricResult<()> {
        let reply = Envelope::reply(request)?.with_payload(payload);

        // answer on the link the request came in on
        if let Some(id) = request.id() {
            if let Some(direct) = self.peers.take_inbound(&id) {
                match direct.send(reply.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => debug!("Direct reply to {} failed, relaying: {}", sender, e),
                }
            }
        }
        self.hub_connection()?
            .send(Self::addressed(reply, sender))
            .await
    }

    async fn request_upstream(&self, envelope: Envelope, timeout: Duration) -> FabricResult<Envelope> {
        self.hub_connection()?.request(envelope, timeout).await
    }
}

impl std::fmt::Debug for Leaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leaf")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
