//! Framed, encrypted connections
//!
//! A [`Connection`] wraps one TCP socket. Handshakes drive it with raw frames
//! until a session cipher and a peer name are assigned (each exactly once);
//! after that every envelope is sealed, correlated by identifier, and checked
//! against a per-sender replay window on the way in.
//!
//! Writers serialize on one async mutex. Pending response callbacks live in a
//! separate concurrent map and always run on spawned tasks, never on the
//! reader and never under the write lock.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fabric_core::{
    wire, ConnectionConfig, Envelope, FabricError, FabricResult, IdSource, Identifier,
    MessageKind, ProtocolError, ReplayConfig, ReplayGuard, SessionCipher,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, trace, warn};

// ----------------------------------------------------------------------------
// Response Handlers
// ----------------------------------------------------------------------------

// Sync: held in the pending table that every task holding the connection shares
pub type ResponseCallback = Box<dyn FnOnce(Envelope) + Send + Sync + 'static>;
pub type TimeoutCallback = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Callback pair stored until a response arrives or the wait expires
pub struct ResponseHandler {
    on_response: ResponseCallback,
    on_timeout: Option<TimeoutCallback>,
    timeout: Option<Duration>,
}

impl ResponseHandler {
    pub fn new<F>(on_response: F) -> Self
    where
        F: FnOnce(Envelope) + Send + Sync + 'static,
    {
        Self {
            on_response: Box::new(on_response),
            on_timeout: None,
            timeout: None,
        }
    }

    /// Action run if no response arrives
    pub fn on_timeout<F>(mut self, on_timeout: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.on_timeout = Some(Box::new(on_timeout));
        self
    }

    /// Expire after `after` instead of waiting for the cleanup TTL
    pub fn with_timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(after);
        self
    }
}

struct PendingResponse {
    on_response: ResponseCallback,
    on_timeout: Option<TimeoutCallback>,
    registered_at: Instant,
}

impl PendingResponse {
    fn expire(self) {
        if let Some(on_timeout) = self.on_timeout {
            on_timeout();
        }
    }
}

type PendingTable = Arc<DashMap<Identifier, PendingResponse>>;

struct Activity {
    last_sent: Instant,
    last_received: Instant,
    last_keep_alive: Option<Instant>,
    last_cleanup: Instant,
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// One framed, encrypted socket
pub struct Connection {
    remote_addr: SocketAddr,
    opened_at: Instant,
    name: OnceLock<String>,
    cipher: OnceLock<SessionCipher>,
    ids: OnceLock<Arc<IdSource>>,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingTable,
    replay: StdMutex<ReplayGuard>,
    activity: StdMutex<Activity>,
    closed: watch::Sender<bool>,
    settings: ConnectionConfig,
}

impl Connection {
    /// Wrap a freshly accepted or dialed socket
    pub fn new(
        stream: TcpStream,
        settings: ConnectionConfig,
        replay: ReplayConfig,
    ) -> FabricResult<Self> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        let now = Instant::now();

        Ok(Self {
            remote_addr,
            opened_at: now,
            name: OnceLock::new(),
            cipher: OnceLock::new(),
            ids: OnceLock::new(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            pending: Arc::new(DashMap::new()),
            replay: StdMutex::new(ReplayGuard::new(replay)),
            activity: StdMutex::new(Activity {
                last_sent: now,
                last_received: now,
                last_keep_alive: None,
                last_cleanup: now,
            }),
            closed,
            settings,
        })
    }

    // Identity ---------------------------------------------------------------

    /// Peer name, once the handshake has assigned it
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub fn is_authenticated(&self) -> bool {
        self.name.get().is_some()
    }

    /// Connection id of the local provider stamping outbound envelopes
    pub fn local_connection_id(&self) -> Option<i16> {
        self.ids.get().map(|ids| ids.connection_id())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Time since the socket was wrapped
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Time since anything was read
    pub fn idle_for(&self) -> Duration {
        self.activity().last_received.elapsed()
    }

    /// Time since anything was written
    pub fn since_last_sent(&self) -> Duration {
        self.activity().last_sent.elapsed()
    }

    pub fn pending_responses(&self) -> usize {
        self.pending.len()
    }

    fn label(&self) -> String {
        match self.name() {
            Some(name) => name.to_string(),
            None => self.remote_addr.to_string(),
        }
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cipher(&self) -> FabricResult<&SessionCipher> {
        self.cipher
            .get()
            .ok_or_else(|| ProtocolError::NotAuthenticated.into())
    }

    // Handshake phase --------------------------------------------------------

    /// Adopt the session cipher; may only happen once
    pub(crate) fn install_cipher(&self, cipher: SessionCipher) -> FabricResult<()> {
        self.cipher
            .set(cipher)
            .map_err(|_| ProtocolError::AlreadyAssigned { field: "cipher" }.into())
    }

    /// Name the peer and attach the provider for outbound ids; may only happen once
    pub(crate) fn authenticate(&self, name: String, ids: Arc<IdSource>) -> FabricResult<()> {
        self.ids
            .set(ids)
            .map_err(|_| FabricError::from(ProtocolError::AlreadyAssigned { field: "id source" }))?;
        self.name
            .set(name)
            .map_err(|_| ProtocolError::AlreadyAssigned { field: "peer name" }.into())
    }

    /// Write one unencrypted frame
    pub(crate) async fn write_raw(&self, body: &[u8]) -> FabricResult<()> {
        let mut writer = self.writer.lock().await;
        wire::write_frame(&mut *writer, body).await
    }

    /// Read one unencrypted frame, giving up if the connection closes
    pub(crate) async fn read_raw(&self) -> FabricResult<Vec<u8>> {
        let closed = self.closed.subscribe();
        let mut reader = self.reader.lock().await;
        tokio::select! {
            frame = wire::read_frame(&mut *reader) => frame,
            _ = wait_for_flag(closed) => Err(FabricError::closed()),
        }
    }

    /// Write one frame sealed under the session cipher
    pub(crate) async fn write_sealed(&self, body: &[u8]) -> FabricResult<()> {
        let sealed = self.cipher()?.seal(body)?;
        self.write_raw(&sealed).await
    }

    /// Read one frame sealed under the session cipher
    pub(crate) async fn read_sealed(&self) -> FabricResult<Vec<u8>> {
        let frame = self.read_raw().await?;
        self.cipher()?.open(&frame)
    }

    // Sending ----------------------------------------------------------------

    /// Send an envelope without expecting a response
    pub async fn send(&self, envelope: Envelope) -> FabricResult<()> {
        self.transmit(envelope, None).await.map(|_| ())
    }

    /// Send an envelope and keep `handler` until its response arrives
    pub async fn send_with_handler(
        &self,
        envelope: Envelope,
        handler: ResponseHandler,
    ) -> FabricResult<Identifier> {
        let kind = envelope.kind();
        self.transmit(envelope, Some(handler)).await?.ok_or_else(|| {
            ProtocolError::MissingResponseId {
                kind: kind.to_string(),
            }
            .into()
        })
    }

    /// Send an envelope and wait for its response
    pub async fn request(&self, envelope: Envelope, timeout: Duration) -> FabricResult<Envelope> {
        let (tx, rx) = oneshot::channel();
        let id = self
            .send_with_handler(
                envelope,
                ResponseHandler::new(move |response| {
                    let _ = tx.send(response);
                }),
            )
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(FabricError::closed()),
            Err(_) => {
                self.pending.remove(&id);
                Err(FabricError::timeout(timeout))
            }
        }
    }

    /// Send a keep-alive, at most once per minimum interval, once named
    pub async fn send_keep_alive(&self) -> FabricResult<()> {
        if !self.is_authenticated() {
            return Ok(());
        }
        {
            let mut activity = self.activity();
            if let Some(last) = activity.last_keep_alive {
                if last.elapsed() < self.settings.keep_alive_min_interval() {
                    return Ok(());
                }
            }
            activity.last_keep_alive = Some(Instant::now());
        }
        self.send(Envelope::keep_alive()).await
    }

    async fn transmit(
        &self,
        mut envelope: Envelope,
        handler: Option<ResponseHandler>,
    ) -> FabricResult<Option<Identifier>> {
        if self.is_closed() {
            return Err(FabricError::closed());
        }
        if handler.is_some() {
            if envelope.is_response() {
                return Err(ProtocolError::ResponseWithHandler.into());
            }
            if !envelope.kind().requires_id() {
                return Err(FabricError::malformed("keep-alives cannot expect a response"));
            }
        }
        let cipher = self.cipher()?;
        if envelope.kind().requires_id() && envelope.id().is_none() {
            let ids = self.ids.get().ok_or(ProtocolError::NotAuthenticated)?;
            envelope.assign_id(ids.next_id())?;
        }

        let id = envelope.id();
        let header = cipher.seal(&envelope.encode_header()?)?;
        let blob = if envelope.kind().carries_blob() {
            Some(cipher.seal(envelope.blob().unwrap_or_default())?)
        } else {
            None
        };

        // registered before writing so a fast response cannot miss it
        if let (Some(handler), Some(id)) = (handler, id) {
            self.register_pending(id, handler);
        }

        if let Err(e) = self.write_frames(&header, blob.as_deref()).await {
            if let Some(id) = id {
                self.pending.remove(&id);
            }
            warn!("Write to {} failed: {}", self.label(), e);
            self.close().await;
            return Err(e);
        }

        self.activity().last_sent = Instant::now();
        trace!("Sent {} {:?} to {}", envelope.kind(), id, self.label());
        Ok(id)
    }

    async fn write_frames(&self, header: &[u8], blob: Option<&[u8]>) -> FabricResult<()> {
        let mut writer = self.writer.lock().await;
        wire::write_frame(&mut *writer, header).await?;
        if let Some(blob) = blob {
            wire::write_frame(&mut *writer, blob).await?;
        }
        Ok(())
    }

    fn register_pending(&self, id: Identifier, handler: ResponseHandler) {
        let ResponseHandler {
            on_response,
            on_timeout,
            timeout,
        } = handler;
        self.pending.insert(
            id,
            PendingResponse {
                on_response,
                on_timeout,
                registered_at: Instant::now(),
            },
        );

        if let Some(after) = timeout {
            let pending = Arc::clone(&self.pending);
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                // whoever removes the entry owns it, so this fires at most once
                if let Some((_, entry)) = pending.remove(&id) {
                    debug!("Response to {} timed out after {:?}", id, after);
                    entry.expire();
                }
            });
        }
    }

    // Receiving --------------------------------------------------------------

    /// Read the next envelope
    ///
    /// Returns `Ok(None)` when the frame was consumed internally: keep-alives,
    /// replay rejections, and responses matched to (or orphaned from) a local
    /// handler. Responses that still carry a forward target are returned so a
    /// relay can pass them on.
    pub async fn listen(&self) -> FabricResult<Option<Envelope>> {
        let cipher = self.cipher()?;
        let read = {
            let closed = self.closed.subscribe();
            let mut reader = self.reader.lock().await;
            tokio::select! {
                result = read_envelope(&mut reader, cipher) => result,
                _ = wait_for_flag(closed) => return Err(FabricError::closed()),
            }
        };
        let envelope = match read {
            Ok(envelope) => envelope,
            Err(e) => {
                self.close().await;
                return Err(e);
            }
        };

        self.activity().last_received = Instant::now();
        self.maybe_cleanup();
        if envelope.kind() == MessageKind::KeepAlive {
            trace!("Keep-alive from {}", self.label());
            return Ok(None);
        }

        if let Some(id) = envelope.id() {
            let verdict = self
                .replay
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .check(id);
            if let Err(e) = verdict {
                warn!("Dropping envelope from {}: {}", self.label(), e);
                return Ok(None);
            }
        }

        if let Some(reply_to) = envelope.reply_to() {
            if let Some((_, pending)) = self.pending.remove(&reply_to) {
                tokio::spawn(async move { (pending.on_response)(envelope) });
                return Ok(None);
            }
            if envelope.forward().is_none() {
                debug!("Ignoring late response to {} from {}", reply_to, self.label());
                return Ok(None);
            }
        }
        Ok(Some(envelope))
    }

    /// Forget the replay window for one sender connection id
    pub fn reset_replay(&self, connection_id: i16) {
        self.replay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset(connection_id);
    }

    fn maybe_cleanup(&self) {
        {
            let mut activity = self.activity();
            if activity.last_cleanup.elapsed() < self.settings.cleanup_interval() {
                return;
            }
            activity.last_cleanup = Instant::now();
        }
        let purged = self.purge_expired(self.settings.callback_ttl());
        if purged > 0 {
            debug!("Purged {} stale response handlers on {}", purged, self.label());
        }
    }

    /// Expire every pending handler older than `ttl`; returns how many
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let expired: Vec<Identifier> = self
            .pending
            .iter()
            .filter(|entry| entry.registered_at.elapsed() > ttl)
            .map(|entry| *entry.key())
            .collect();
        self.expire_all(expired)
    }

    fn expire_all(&self, ids: Vec<Identifier>) -> usize {
        let mut expired = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                tokio::spawn(async move { entry.expire() });
                expired += 1;
            }
        }
        expired
    }

    // Teardown ---------------------------------------------------------------

    /// Close the socket, wake the reader and run every pending timeout action
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!("Closing connection to {}", self.label());

        if let Ok(mut writer) = tokio::time::timeout(Duration::from_secs(1), self.writer.lock()).await {
            let _ = writer.shutdown().await;
        }
        let ids: Vec<Identifier> = self.pending.iter().map(|entry| *entry.key()).collect();
        self.expire_all(ids);
    }
}

const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Connection>();
    assert_send_sync::<ResponseHandler>();
};

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Resolves once a shutdown or closed flag is raised
pub(crate) async fn wait_for_flag(mut flag: watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

async fn read_envelope(
    reader: &mut OwnedReadHalf,
    cipher: &SessionCipher,
) -> FabricResult<Envelope> {
    let header = cipher.open(&wire::read_frame(reader).await?)?;
    let mut envelope = Envelope::decode_header(&header)?;
    if envelope.kind().carries_blob() {
        let blob = cipher.open(&wire::read_frame(reader).await?)?;
        envelope.attach_blob(blob);
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Two connections over loopback sharing a session key: (alpha's view, beta's view)
    async fn create_test_pair() -> (Arc<Connection>, Arc<Connection>) {
        create_test_pair_with(ConnectionConfig::default()).await
    }

    async fn create_test_pair_with(settings: ConnectionConfig) -> (Arc<Connection>, Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let alpha = Connection::new(client.unwrap(), settings.clone(), ReplayConfig::default()).unwrap();
        let beta = Connection::new(accepted.unwrap().0, settings, ReplayConfig::default()).unwrap();

        let key = SessionCipher::generate_key();
        alpha.install_cipher(SessionCipher::new(&key)).unwrap();
        beta.install_cipher(SessionCipher::new(&key)).unwrap();
        alpha.authenticate("beta".into(), Arc::new(IdSource::new(1))).unwrap();
        beta.authenticate("alpha".into(), Arc::new(IdSource::new(2))).unwrap();

        (Arc::new(alpha), Arc::new(beta))
    }

    fn spawn_listener(connection: Arc<Connection>) -> tokio::sync::mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(next) = connection.listen().await {
                if let Some(envelope) = next {
                    if tx.send(envelope).is_err() {
                        break;
                    }
                }
            }
        });
        rx
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_response_invokes_callback_exactly_once() {
        let (alpha, beta) = create_test_pair().await;
        let _alpha_inbox = spawn_listener(alpha.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        alpha
            .send_with_handler(
                Envelope::new(MessageKind::Api),
                ResponseHandler::new(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let request = beta.listen().await.unwrap().unwrap();
        let mut reply = Envelope::reply(&request).unwrap();
        reply.assign_id(Identifier::compose(2, 1_000)).unwrap();

        beta.send(reply.clone()).await.unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // the identical frame again: same id, same reply_to
        beta.send(reply).await.unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(alpha.pending_responses(), 0);
    }

    #[tokio::test]
    async fn test_timeout_fires_once_and_late_response_is_ignored() {
        let (alpha, beta) = create_test_pair().await;
        let _alpha_inbox = spawn_listener(alpha.clone());

        let responses = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let (r, t) = (responses.clone(), timeouts.clone());
        alpha
            .send_with_handler(
                Envelope::new(MessageKind::Ping),
                ResponseHandler::new(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                })
                .on_timeout(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                })
                .with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        let request = beta.listen().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);

        beta.send(Envelope::reply(&request).unwrap()).await.unwrap();
        settle().await;
        assert_eq!(responses.load(Ordering::SeqCst), 0);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() -> FabricResult<()> {
        let (alpha, beta) = create_test_pair().await;
        let _alpha_inbox = spawn_listener(alpha.clone());

        let responder = tokio::spawn(async move {
            let request = beta.listen().await.unwrap().unwrap();
            let reply = Envelope::reply(&request)
                .unwrap()
                .with_payload(request.payload().clone());
            beta.send(reply).await.unwrap();
        });

        let request = Envelope::new(MessageKind::Ping)
            .with_typed_payload(&fabric_core::Ping { sent_at: 42 })?;
        let response = alpha.request(request, Duration::from_secs(2)).await?;
        assert_eq!(response.decode::<fabric_core::Ping>()?.sent_at, 42);
        responder.await.unwrap();
        Ok(())
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (alpha, _beta) = create_test_pair().await;
        let _alpha_inbox = spawn_listener(alpha.clone());

        let err = alpha
            .request(Envelope::new(MessageKind::Ping), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Transport(fabric_core::TransportError::Timeout { .. })));
        assert_eq!(alpha.pending_responses(), 0);
    }

    #[tokio::test]
    async fn test_blob_travels_in_second_frame() {
        let (alpha, beta) = create_test_pair().await;
        let mut inbox = spawn_listener(beta.clone());

        alpha
            .send(Envelope::new(MessageKind::ApiWithBlob).with_blob(vec![7; 4096]))
            .await
            .unwrap();
        alpha.send(Envelope::new(MessageKind::Api)).await.unwrap();

        let first = inbox.recv().await.unwrap();
        assert_eq!(first.blob().map(<[u8]>::len), Some(4096));
        assert_eq!(inbox.recv().await.unwrap().kind(), MessageKind::Api);
    }

    #[tokio::test]
    async fn test_unsealed_empty_blob_frame_is_rejected() {
        let (alpha, beta) = create_test_pair().await;
        let mut envelope = Envelope::new(MessageKind::ApiWithBlob);
        envelope.assign_id(Identifier::compose(1, 0)).unwrap();
        let header = alpha
            .cipher()
            .unwrap()
            .seal(&envelope.encode_header().unwrap())
            .unwrap();

        alpha.write_frames(&header, Some(&b""[..])).await.unwrap();
        assert!(beta.listen().await.is_err());
        assert!(beta.is_closed());
    }

    #[tokio::test]
    async fn test_keep_alive_is_consumed() {
        let (alpha, beta) = create_test_pair().await;
        let mut inbox = spawn_listener(beta.clone());

        alpha.send_keep_alive().await.unwrap();
        alpha.send(Envelope::new(MessageKind::Command)).await.unwrap();

        assert_eq!(inbox.recv().await.unwrap().kind(), MessageKind::Command);
    }

    #[tokio::test]
    async fn test_response_cannot_carry_handler() {
        let (alpha, _beta) = create_test_pair().await;
        let mut request = Envelope::new(MessageKind::Api);
        request.assign_id(Identifier::compose(2, 0)).unwrap();
        let reply = Envelope::reply(&request).unwrap();

        let err = alpha
            .send_with_handler(reply, ResponseHandler::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Protocol(ProtocolError::ResponseWithHandler)));
    }

    #[tokio::test]
    async fn test_close_drains_handlers_through_timeout_actions() {
        let (alpha, _beta) = create_test_pair().await;
        let timeouts = Arc::new(AtomicUsize::new(0));
        let t = timeouts.clone();
        alpha
            .send_with_handler(
                Envelope::new(MessageKind::Api),
                ResponseHandler::new(|_| {}).on_timeout(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        alpha.close().await;
        settle().await;
        assert!(alpha.is_closed());
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert!(alpha.send(Envelope::new(MessageKind::Api)).await.is_err());
        assert!(alpha.listen().await.is_err());
    }

    #[tokio::test]
    async fn test_purge_expired_handlers() {
        let (alpha, _beta) = create_test_pair().await;
        let timeouts = Arc::new(AtomicUsize::new(0));
        let t = timeouts.clone();
        alpha
            .send_with_handler(
                Envelope::new(MessageKind::Api),
                ResponseHandler::new(|_| {}).on_timeout(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        assert_eq!(alpha.purge_expired(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(alpha.purge_expired(Duration::from_millis(10)), 1);
        settle().await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_traffic_purges_stale_handlers() {
        let settings = ConnectionConfig {
            keep_alive_min_interval_ms: 0,
            callback_ttl_ms: 50,
            cleanup_interval_ms: 20,
            ..ConnectionConfig::default()
        };
        let (alpha, beta) = create_test_pair_with(settings).await;
        let _alpha_inbox = spawn_listener(alpha.clone());

        alpha
            .send_with_handler(Envelope::new(MessageKind::Api), ResponseHandler::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(alpha.pending_responses(), 1);

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            beta.send_keep_alive().await.unwrap();
        }
        settle().await;
        assert_eq!(alpha.pending_responses(), 0);
    }
}
