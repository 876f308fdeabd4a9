//! Hub acceptor and router
//!
//! The hub accepts leaf connections, authenticates them against its key
//! directory, and relays envelopes between them. Three background tasks keep
//! it healthy:
//!
//! - the listener supervisor rebinds the socket after accept failures
//! - the sweep sends keep-alives and drops silent or unauthenticated links
//! - the reconciliation tick reaps offline records and announces the digest
//!
//! Every admitted leaf gets a bounded outbound queue drained by its own writer
//! task. Relays, broadcasts and keep-alives only enqueue, so a leaf that stops
//! reading never stalls the reader of another leaf or the sweep.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fabric_core::{
    ConnectionIdReset, Envelope, EventDispatcher, FabricConfig, FabricError, FabricResult,
    ForwardTarget, IdSource, KeyDirectory, MessageKind, Payload, RecordMessage, ServerEntry,
    ServerList, HUB_NAME,
};
use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{wait_for_flag, Connection};
use crate::handshake::accept_leaf;
use crate::registry::ConnectionIdRegistry;
use crate::replication::{PresenceCheck, RecordStore, StoreRole};
use crate::services::{
    install_builtin_services, permission_answer, permission_request, ping_request,
    spawn_dispatch_worker, time_ping, DispatchQueue, Endpoint, PermissionCheckFn, PermissionSlot,
};

/// An admitted leaf and the queue its writer task drains
struct Downstream {
    conn: Arc<Connection>,
    outbound: mpsc::Sender<Envelope>,
}

impl Downstream {
    fn open(name: &str, conn: Arc<Connection>, capacity: usize) -> Self {
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        tokio::spawn(drain_outbound(name.to_string(), Arc::clone(&conn), queue));
        Self { conn, outbound }
    }

    /// Queue an envelope without waiting on the socket
    fn enqueue(&self, name: &str, envelope: Envelope) -> FabricResult<()> {
        match self.outbound.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(envelope)) => {
                warn!("Outbound queue to {} full, dropping {}", name, envelope.kind());
                Err(FabricError::connection_failed(name, "outbound queue full"))
            }
            Err(TrySendError::Closed(_)) => Err(FabricError::not_connected(name)),
        }
    }
}

async fn drain_outbound(name: String, conn: Arc<Connection>, mut queue: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = queue.recv().await {
        if let Err(e) = conn.send(envelope).await {
            debug!("Write to {} failed: {}", name, e);
            if conn.is_closed() {
                return;
            }
        }
    }
}

#[derive(Default)]
struct ConnectionSet {
    /// Accepted, handshake still running
    pending: Vec<Arc<Connection>>,
    /// Authenticated leaves by name
    named: BTreeMap<String, Downstream>,
}

type Inbox = mpsc::UnboundedReceiver<(String, Envelope)>;

/// The central relay every leaf connects to
pub struct Hub {
    config: FabricConfig,
    keys: KeyDirectory,
    registry: ConnectionIdRegistry,
    ids: Arc<IdSource>,
    dispatcher: Arc<EventDispatcher>,
    queue: DispatchQueue,
    inbox: StdMutex<Option<Inbox>>,
    records: Arc<RecordStore>,
    connections: RwLock<ConnectionSet>,
    p2p_addresses: StdMutex<HashMap<String, String>>,
    permissions: PermissionSlot,
    local_addr: OnceLock<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Create a hub admitting the identities in `keys`
    pub fn new(config: FabricConfig, keys: KeyDirectory) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Hub>| {
            let endpoint: Weak<dyn Endpoint> = weak.clone();
            let dispatcher = Arc::new(EventDispatcher::new());
            let permissions: PermissionSlot = Arc::new(StdRwLock::new(None));
            install_builtin_services(&dispatcher, endpoint.clone(), permissions.clone());

            let records = Arc::new(RecordStore::new(
                StoreRole::Hub,
                endpoint,
                config.replication.clone(),
            ));
            let (queue, inbox) = mpsc::unbounded_channel();
            let (shutdown, _) = watch::channel(false);

            Self {
                config,
                keys,
                registry: ConnectionIdRegistry::new(),
                ids: Arc::new(IdSource::new(0)),
                dispatcher,
                queue,
                inbox: StdMutex::new(Some(inbox)),
                records,
                connections: RwLock::new(ConnectionSet::default()),
                p2p_addresses: StdMutex::new(HashMap::new()),
                permissions,
                local_addr: OnceLock::new(),
                shutdown,
                tasks: StdMutex::new(Vec::new()),
            }
        })
    }

    /// Bind the listener and start the background tasks
    pub async fn start(self: &Arc<Self>) -> FabricResult<SocketAddr> {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| FabricError::config_error("hub already started"))?;

        let listener = TcpListener::bind(&self.config.hub.bind_address).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        info!("Hub listening on {} ({} identities)", addr, self.keys.len());

        let tasks = vec![
            spawn_dispatch_worker(Arc::clone(&self.dispatcher), inbox),
            self.records.attach(&self.dispatcher),
            tokio::spawn(Arc::clone(self).supervise(listener, addr)),
            tokio::spawn(Arc::clone(self).sweep_loop()),
            tokio::spawn(Arc::clone(self).reconcile_loop()),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Listener registry for envelopes dispatched on the hub
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

    /// Predicate deciding which records survive reconciliation
    pub fn set_presence_check(&self, check: PresenceCheck) {
        self.records.set_presence_check(check);
    }

    /// Names of the authenticated leaves
    pub async fn connected_servers(&self) -> Vec<String> {
        match self.connections().await {
            Some(set) => set.named.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Stop accepting, close every connection and end the background tasks
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Hub shutting down");
        let open: Vec<Arc<Connection>> = match self.connections_mut().await {
            Some(mut set) => {
                let mut open: Vec<_> = set.pending.drain(..).collect();
                open.extend(
                    std::mem::take(&mut set.named)
                        .into_values()
                        .map(|downstream| downstream.conn),
                );
                open
            }
            None => Vec::new(),
        };
        join_all(open.iter().map(|conn| conn.close())).await;
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }

    // Locking ----------------------------------------------------------------

    async fn connections(&self) -> Option<RwLockReadGuard<'_, ConnectionSet>> {
        let waited = self.config.hub.lock_timeout();
        match tokio::time::timeout(waited, self.connections.read()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("Connection set read lock not acquired after {:?}", waited);
                None
            }
        }
    }

    async fn connections_mut(&self) -> Option<RwLockWriteGuard<'_, ConnectionSet>> {
        let waited = self.config.hub.lock_timeout();
        match tokio::time::timeout(waited, self.connections.write()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("Connection set write lock not acquired after {:?}", waited);
                None
            }
        }
    }

    async fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections()
            .await?
            .named
            .get(name)
            .map(|downstream| Arc::clone(&downstream.conn))
    }

    // Sending ----------------------------------------------------------------

    /// Send to one leaf, or dispatch locally for the hub's own name
    pub async fn send_to(&self, name: &str, envelope: Envelope) -> FabricResult<()> {
        if name == HUB_NAME {
            self.dispatch_local(HUB_NAME, envelope);
            return Ok(());
        }
        let set = self
            .connections()
            .await
            .ok_or_else(|| FabricError::not_connected(name))?;
        let downstream = set
            .named
            .get(name)
            .ok_or_else(|| FabricError::not_connected(name))?;
        downstream.enqueue(name, envelope)
    }

    /// Send to every leaf
    pub async fn broadcast(&self, envelope: Envelope) -> FabricResult<()> {
        self.send_to_all(envelope, None).await;
        Ok(())
    }

    /// Send a request to one leaf and wait for its response
    pub async fn request(&self, name: &str, envelope: Envelope, timeout: Duration) -> FabricResult<Envelope> {
        let conn = self
            .connection(name)
            .await
            .ok_or_else(|| FabricError::not_connected(name))?;
        // bounds the write too, in case the leaf stopped reading
        tokio::time::timeout(timeout, conn.request(envelope, timeout))
            .await
            .unwrap_or_else(|_| Err(FabricError::timeout(timeout)))
    }

    /// Round-trip time to one leaf
    pub async fn ping(&self, name: &str) -> FabricResult<Duration> {
        let timeout = self.config.connection.request_timeout();
        time_ping(self.request(name, ping_request()?, timeout)).await
    }

    /// Ask a leaf whether `player` holds `permission`
    pub async fn has_permission(&self, name: &str, player: Uuid, permission: &str) -> FabricResult<bool> {
        let timeout = self.config.connection.request_timeout();
        let response = self
            .request(name, permission_request(player, permission)?, timeout)
            .await?;
        permission_answer(&response)
    }

    async fn send_to_all(&self, mut envelope: Envelope, except: Option<&str>) {
        if envelope.kind().requires_id() && envelope.id().is_none() {
            // one id for every copy, so relayed replies correlate
            let _ = envelope.assign_id(self.ids.next_id());
        }
        let Some(set) = self.connections().await else {
            return;
        };
        for (name, downstream) in &set.named {
            if Some(name.as_str()) == except {
                continue;
            }
            if let Err(e) = downstream.enqueue(name, envelope.clone()) {
                debug!("Broadcast of {} to {} failed: {}", envelope.kind(), name, e);
            }
        }
    }

    fn dispatch_local(&self, sender: &str, envelope: Envelope) {
        if self.queue.send((sender.to_string(), envelope)).is_err() {
            debug!("Dispatch queue closed, dropping envelope from {}", sender);
        }
    }

    // Background tasks -------------------------------------------------------

    async fn supervise(self: Arc<Self>, listener: TcpListener, addr: SocketAddr) {
        let mut listener = Some(listener);
        let delay = self.config.hub.restart_delay();
        loop {
            let current = match listener.take() {
                Some(current) => current,
                None => match TcpListener::bind(addr).await {
                    Ok(rebound) => {
                        info!("Hub listener rebound on {}", addr);
                        rebound
                    }
                    Err(e) => {
                        error!("Cannot rebind hub listener on {}: {}", addr, e);
                        if self.pause(delay).await {
                            return;
                        }
                        continue;
                    }
                },
            };

            let failure = tokio::select! {
                failure = self.accept_loop(&current) => failure,
                _ = wait_for_flag(self.shutdown.subscribe()) => return,
            };
            error!("Hub listener failed: {}; restarting in {:?}", failure, delay);
            drop(current);
            if self.pause(delay).await {
                return;
            }
        }
    }

    /// Sleep unless shut down first; returns whether shutdown was requested
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = wait_for_flag(self.shutdown.subscribe()) => true,
        }
    }

    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) -> FabricError {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = Arc::clone(self);
                    tokio::spawn(async move { hub.serve(stream, addr).await });
                }
                Err(e) => return e.into(),
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.hub.sweep_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = wait_for_flag(self.shutdown.subscribe()) => return,
            }
        }
    }

    async fn sweep(&self) {
        let silent_after = self.config.hub.downstream_timeout();
        let (silent, pending) = match self.connections().await {
            Some(set) => {
                let mut silent = Vec::new();
                for (name, downstream) in &set.named {
                    if downstream.conn.idle_for() > silent_after {
                        warn!("{} silent for {:?}, dropping", name, downstream.conn.idle_for());
                        silent.push(Arc::clone(&downstream.conn));
                    } else if let Err(e) = downstream.enqueue(name, Envelope::keep_alive()) {
                        debug!("Keep-alive to {} failed: {}", name, e);
                    }
                }
                (silent, set.pending.clone())
            }
            None => return,
        };
        for conn in silent {
            conn.close().await;
        }

        let auth_window = self.config.hub.auth_timeout();
        for conn in pending {
            if conn.age() > auth_window {
                debug!("{} never authenticated, dropping", conn.remote_addr());
                conn.close().await;
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.replication.hash_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.records.reconcile().await {
                        debug!("Record reconciliation skipped: {}", e);
                    }
                }
                _ = wait_for_flag(self.shutdown.subscribe()) => return,
            }
        }
    }

    // Per-connection lifecycle -----------------------------------------------

    async fn serve(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let conn = match Connection::new(stream, self.config.connection.clone(), self.config.replay) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                debug!("Dropping socket from {}: {}", addr, e);
                return;
            }
        };
        if let Some(mut set) = self.connections_mut().await {
            set.pending.push(Arc::clone(&conn));
        }

        let admitted = accept_leaf(
            &conn,
            &self.keys,
            &self.registry,
            &self.config.protocol_version,
            self.config.hub.auth_timeout(),
        )
        .await;
        if let Some(mut set) = self.connections_mut().await {
            set.pending.retain(|pending| !Arc::ptr_eq(pending, &conn));
        }

        let admitted = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!("Rejected connection from {}: {}", addr, e);
                conn.close().await;
                return;
            }
        };
        let name = admitted.name;
        if let Err(e) = conn.authenticate(name.clone(), Arc::clone(&self.ids)) {
            warn!("Cannot register {}: {}", name, e);
            conn.close().await;
            return;
        }
        info!(
            "{} connected from {} as connection {}",
            name, addr, admitted.connection_id
        );

        let capacity = self.config.hub.outbound_queue_capacity;
        let replaced = match self.connections_mut().await {
            Some(mut set) => set.named.insert(
                name.clone(),
                Downstream::open(&name, Arc::clone(&conn), capacity),
            ),
            None => {
                conn.close().await;
                return;
            }
        };
        if let Some(previous) = replaced {
            info!("{} reconnected, closing its previous connection", name);
            previous.conn.close().await;
        }

        if admitted.returning {
            let reset = Envelope::new(MessageKind::ConnectionIdReset).with_typed_payload(
                &ConnectionIdReset {
                    connection_id: admitted.connection_id,
                },
            );
            match reset {
                Ok(reset) => self.send_to_all(reset, Some(&name)).await,
                Err(e) => warn!("Cannot build connection id reset: {}", e),
            }
        }
        self.broadcast_roster().await;
        if let Err(e) = self.push_snapshot(&conn).await {
            warn!("Initial snapshot to {} failed: {}", name, e);
        }

        self.receive_loop(&conn, &name).await;

        let removed = match self.connections_mut().await {
            Some(mut set) => {
                let current = set
                    .named
                    .get(&name)
                    .map_or(false, |held| Arc::ptr_eq(&held.conn, &conn));
                if current {
                    set.named.remove(&name);
                }
                current
            }
            None => false,
        };
        conn.close().await;
        if removed {
            self.p2p_addresses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&name);
            info!("{} disconnected", name);
            self.broadcast_roster().await;
        }
    }

    async fn receive_loop(&self, conn: &Arc<Connection>, name: &str) {
        loop {
            match conn.listen().await {
                Ok(Some(envelope)) => self.route(conn, name, envelope).await,
                Ok(None) => {}
                Err(e) => {
                    debug!("Connection to {} ended: {}", name, e);
                    return;
                }
            }
        }
    }

    /// Route one envelope received from leaf `sender`
    async fn route(&self, conn: &Arc<Connection>, sender: &str, mut envelope: Envelope) {
        if envelope.is_response() {
            // listen() only hands back unmatched responses that carry a target
            if let Some(target) = envelope.forward().cloned() {
                envelope.rewrite_forward(sender);
                self.relay(sender, &target, &envelope).await;
            }
            return;
        }

        if envelope.kind() == MessageKind::ServerList && envelope.forward().is_none() {
            match envelope.decode::<ServerList>() {
                Ok(list) => self.record_p2p_address(conn, sender, list).await,
                Err(e) => warn!("Bad server list from {}: {}", sender, e),
            }
            return;
        }

        match envelope.forward().cloned() {
            None => self.dispatch_local(sender, envelope),
            Some(target) => {
                envelope.rewrite_forward(sender);
                self.relay(sender, &target, &envelope).await;
                if target.is_all() || target.includes(HUB_NAME) {
                    self.dispatch_local(sender, envelope);
                }
            }
        }
    }

    async fn relay(&self, sender: &str, target: &ForwardTarget, envelope: &Envelope) {
        let Some(set) = self.connections().await else {
            return;
        };
        let recipients: Vec<(&String, &Downstream)> = match target {
            ForwardTarget::All => set
                .named
                .iter()
                .filter(|(name, _)| name.as_str() != sender)
                .collect(),
            ForwardTarget::Peers(names) => names
                .iter()
                .filter(|name| name.as_str() != HUB_NAME)
                .filter_map(|name| match set.named.get_key_value(name) {
                    Some(entry) => Some(entry),
                    None => {
                        debug!("{} addressed unknown server {}", sender, name);
                        None
                    }
                })
                .collect(),
        };

        for (name, downstream) in recipients {
            if let Err(e) = downstream.enqueue(name, envelope.clone()) {
                debug!("Relay of {} from {} to {} failed: {}", envelope.kind(), sender, name, e);
            }
        }
    }

    async fn record_p2p_address(&self, conn: &Connection, name: &str, list: ServerList) {
        let Some(port) = list.p2p_port else {
            return;
        };
        let address = match list.p2p_host {
            Some(host) => format!("{}:{}", host, port),
            None => SocketAddr::new(conn.remote_addr().ip(), port).to_string(),
        };
        let previous = self
            .p2p_addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), address.clone());
        if previous.as_deref() != Some(address.as_str()) {
            debug!("{} accepts direct connections on {}", name, address);
            self.broadcast_roster().await;
        }
    }

    async fn broadcast_roster(&self) {
        let names = self.connected_servers().await;
        let servers = {
            let addresses = self
                .p2p_addresses
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            names
                .into_iter()
                .map(|name| ServerEntry {
                    address: addresses.get(&name).cloned(),
                    name,
                })
                .collect()
        };
        match Envelope::new(MessageKind::ServerList).with_typed_payload(&ServerList::roster(servers)) {
            Ok(roster) => self.send_to_all(roster, None).await,
            Err(e) => warn!("Cannot build roster: {}", e),
        }
    }

    async fn push_snapshot(&self, conn: &Connection) -> FabricResult<()> {
        let records = self.records.snapshot().await?;
        conn.send(RecordMessage::Snapshot { records }.into_envelope()?)
            .await
    }
}

#[async_trait]
impl Endpoint for Hub {
    fn local_name(&self) -> String {
        HUB_NAME.to_string()
    }

    async fn publish(&self, mut envelope: Envelope) -> FabricResult<()> {
        envelope.ensure_origin(HUB_NAME);
        let target = envelope.forward().cloned();
        // leaves read the forward field as the sender
        envelope.rewrite_forward(HUB_NAME);
        match target {
            None | Some(ForwardTarget::All) => self.broadcast(envelope).await,
            Some(ForwardTarget::Peers(names)) => {
                if envelope.kind().requires_id() && envelope.id().is_none() {
                    envelope.assign_id(self.ids.next_id())?;
                }
                for name in names {
                    if let Err(e) = self.send_to(&name, envelope.clone()).await {
                        debug!("Publish to {} failed: {}", name, e);
                    }
                }
                Ok(())
            }
        }
    }

    async fn respond(&self, sender: &str, request: &Envelope, payload: Payload) -> FabricResult<()> {
        let reply = Envelope::reply(request)?.with_payload(payload);
        self.send_to(sender, reply).await
    }

    async fn request_upstream(&self, _envelope: Envelope, _timeout: Duration) -> FabricResult<Envelope> {
        Err(FabricError::not_connected("upstream of the hub"))
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("local_addr", &self.local_addr())
            .field("identities", &self.keys.len())
            .finish_non_exhaustive()
    }
}

