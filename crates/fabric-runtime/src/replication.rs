//! Replicated session records
//!
//! Every node keeps a full [`RecordTable`]. Changes are applied locally first
//! and then broadcast as `player-data` envelopes. The hub periodically reaps
//! records whose subject went offline and broadcasts a digest of its table;
//! a leaf that disagrees asks the hub for a snapshot and replaces its copy.
//!
//! Inbound record messages are applied by a single worker so that a join is
//! always seen before the updates that follow it.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock, Weak};

use fabric_core::{
    Envelope, EventDispatcher, FabricError, FabricResult, FieldKey, MessageKind, RecordMessage,
    RecordTable, ReplicationConfig, SessionRecord, Timestamp, Variable, Versioned, HUB_NAME,
};
use tokio::sync::{mpsc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::{typed_payload, Endpoint};

/// Whether a subject is still online somewhere; records failing it are reaped
pub type PresenceCheck = Arc<dyn Fn(Uuid) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    /// Authoritative copy; reaps and announces digests
    Hub,
    /// Follower; resyncs from the hub on digest mismatch
    Leaf,
}

/// One node's replica of the record table
pub struct RecordStore {
    role: StoreRole,
    table: RwLock<RecordTable>,
    endpoint: Weak<dyn Endpoint>,
    settings: ReplicationConfig,
    last_digest: StdMutex<Option<String>>,
    presence: StdRwLock<Option<PresenceCheck>>,
}

impl RecordStore {
    pub fn new(role: StoreRole, endpoint: Weak<dyn Endpoint>, settings: ReplicationConfig) -> Self {
        Self {
            role,
            table: RwLock::new(RecordTable::new()),
            endpoint,
            settings,
            last_digest: StdMutex::new(None),
            presence: StdRwLock::new(None),
        }
    }

    pub fn role(&self) -> StoreRole {
        self.role
    }

    /// Install the predicate used by [`reconcile`](Self::reconcile)
    pub fn set_presence_check(&self, check: PresenceCheck) {
        *self.presence.write().unwrap_or_else(PoisonError::into_inner) = Some(check);
    }

    /// Feed `player-data` envelopes from `dispatcher` into this store
    pub(crate) fn attach(self: &Arc<Self>, dispatcher: &EventDispatcher) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Envelope)>();
        dispatcher.register(MessageKind::PlayerData, None, move |sender, envelope| {
            tx.send((sender.to_string(), envelope.clone()))
                .map_err(|_| FabricError::closed())
        });

        let store = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((sender, envelope)) = rx.recv().await {
                if let Err(e) = store.handle(&sender, &envelope).await {
                    warn!("Record message from {} not applied: {}", sender, e);
                }
            }
        })
    }

    // Locking ----------------------------------------------------------------

    async fn read_table(&self) -> FabricResult<RwLockReadGuard<'_, RecordTable>> {
        let waited = self.settings.lock_timeout();
        tokio::time::timeout(waited, self.table.read())
            .await
            .map_err(|_| {
                warn!("Record table read lock not acquired after {:?}", waited);
                FabricError::lock_timeout("record table", waited)
            })
    }

    async fn write_table(&self) -> FabricResult<RwLockWriteGuard<'_, RecordTable>> {
        let waited = self.settings.lock_timeout();
        tokio::time::timeout(waited, self.table.write())
            .await
            .map_err(|_| {
                warn!("Record table write lock not acquired after {:?}", waited);
                FabricError::lock_timeout("record table", waited)
            })
    }

    async fn publish(&self, message: RecordMessage) -> FabricResult<()> {
        let endpoint = self.endpoint.upgrade().ok_or_else(FabricError::closed)?;
        endpoint.publish(message.into_envelope()?.to_all()).await
    }

    // Queries ----------------------------------------------------------------

    /// Copy of one record; `None` if unknown or the table is busy
    pub async fn get(&self, id: &Uuid) -> Option<SessionRecord> {
        self.read_table().await.ok()?.get(id).cloned()
    }

    pub async fn get_field(&self, id: &Uuid, key: &FieldKey) -> Option<Versioned> {
        self.read_table().await.ok()?.get(id)?.get(key).cloned()
    }

    pub async fn snapshot(&self) -> FabricResult<Vec<SessionRecord>> {
        Ok(self.read_table().await?.snapshot())
    }

    pub async fn digest(&self) -> FabricResult<String> {
        Ok(self.read_table().await?.digest())
    }

    pub async fn count(&self) -> FabricResult<usize> {
        Ok(self.read_table().await?.len())
    }

    // Local changes ----------------------------------------------------------

    /// Create a record owned by `server`, optionally announcing it
    pub async fn add_player(
        &self,
        name: &str,
        id: Uuid,
        server: &str,
        announce: bool,
    ) -> FabricResult<SessionRecord> {
        let record = SessionRecord::new(id, name, server, Timestamp::now());
        self.write_table().await?.insert(record.clone());
        debug!("Added record {} ({}) on {}", name, id, server);

        if announce {
            self.publish(RecordMessage::Join {
                record: record.clone(),
            })
            .await?;
        }
        Ok(record)
    }

    /// Drop a record, optionally announcing it
    pub async fn remove_player(&self, id: Uuid, announce: bool) -> FabricResult<Option<SessionRecord>> {
        let removed = self.write_table().await?.remove(&id);
        if announce && removed.is_some() {
            self.publish(RecordMessage::Quit { id }).await?;
        }
        Ok(removed)
    }

    /// Write a field locally and broadcast it
    ///
    /// The returned task resolves once the update was handed to the network.
    /// If that fails the field is rolled back, unless something newer has
    /// replaced it in the meantime.
    pub async fn set(
        self: &Arc<Self>,
        id: Uuid,
        key: FieldKey,
        value: Variable,
    ) -> FabricResult<JoinHandle<FabricResult<()>>> {
        let ours = Versioned::now(value);
        let previous = {
            let mut table = self.write_table().await?;
            let record = table
                .get_mut(&id)
                .ok_or_else(|| FabricError::record_error(format!("no record for {}", id)))?;
            let previous = record.get(&key).cloned();
            if !record.apply(&key, ours.clone())? {
                return Err(FabricError::record_error(format!(
                    "{:?} of {} already holds a newer value",
                    key, id
                )));
            }
            previous
        };

        let message = RecordMessage::Update {
            id,
            field: key.clone(),
            value: ours.clone(),
        };
        let store = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let published = store.publish(message).await;
            if let Err(e) = &published {
                warn!("Update of {:?} on {} not sent, rolling back: {}", key, id, e);
                store.rollback(id, &key, &ours, previous).await;
            }
            published
        }))
    }

    async fn rollback(&self, id: Uuid, key: &FieldKey, ours: &Versioned, previous: Option<Versioned>) {
        let Ok(mut table) = self.write_table().await else {
            return;
        };
        if let Some(record) = table.get_mut(&id) {
            if record.get(key) == Some(ours) {
                record.put(key, previous);
            }
        }
    }

    // Remote changes ---------------------------------------------------------

    /// Apply one inbound record message attested as coming from `sender`
    pub async fn handle(&self, sender: &str, envelope: &Envelope) -> FabricResult<()> {
        match RecordMessage::from_envelope(envelope)? {
            RecordMessage::Join { record } => {
                if sender != HUB_NAME && record.server() != Some(sender) {
                    return Err(FabricError::record_error(format!(
                        "{} announced a record owned by {}",
                        sender,
                        record.server().unwrap_or("nobody")
                    )));
                }
                debug!("{} joined on {}", record.name(), sender);
                self.write_table().await?.insert(record);
            }
            RecordMessage::Quit { id } => {
                let mut table = self.write_table().await?;
                let owner = table.get(&id).and_then(|r| r.server().map(str::to_string));
                if sender != HUB_NAME && owner.is_some() && owner.as_deref() != Some(sender) {
                    return Err(FabricError::record_error(format!(
                        "{} may not remove {} owned by {}",
                        sender,
                        id,
                        owner.unwrap_or_default()
                    )));
                }
                table.remove(&id);
            }
            RecordMessage::Update { id, field, value } => {
                let applied = self
                    .write_table()
                    .await?
                    .apply_update(sender, &id, &field, value)?;
                if !applied {
                    debug!("Ignored stale or orphan update of {:?} on {}", field, id);
                }
            }
            RecordMessage::Hash { digest } => {
                if self.role == StoreRole::Leaf && sender == HUB_NAME {
                    let ours = self.digest().await?;
                    if ours != digest {
                        info!("Record table diverged from hub, requesting snapshot");
                        self.resync().await?;
                    }
                }
            }
            RecordMessage::SnapshotRequest => {
                if self.role == StoreRole::Hub {
                    let records = self.snapshot().await?;
                    let endpoint = self.endpoint.upgrade().ok_or_else(FabricError::closed)?;
                    endpoint
                        .respond(sender, envelope, typed_payload(&RecordMessage::Snapshot { records })?)
                        .await?;
                }
            }
            RecordMessage::Snapshot { records } => {
                if sender == HUB_NAME {
                    debug!("Adopting snapshot of {} records", records.len());
                    self.write_table().await?.replace_all(records);
                }
            }
        }
        Ok(())
    }

    /// Replace the local table with the hub's
    pub async fn resync(&self) -> FabricResult<()> {
        let endpoint = self.endpoint.upgrade().ok_or_else(FabricError::closed)?;
        let response = endpoint
            .request_upstream(
                RecordMessage::SnapshotRequest.into_envelope()?,
                self.settings.snapshot_timeout(),
            )
            .await?;
        match RecordMessage::from_envelope(&response)? {
            RecordMessage::Snapshot { records } => {
                self.write_table().await?.replace_all(records);
                Ok(())
            }
            other => Err(FabricError::malformed(format!(
                "expected a snapshot, got {:?}",
                other
            ))),
        }
    }

    /// Hub tick: reap offline subjects, then announce the digest if it moved
    pub async fn reconcile(&self) -> FabricResult<()> {
        let presence = self
            .presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // reaped silently; leaves converge on the digest and resync
        let digest = {
            let mut table = self.write_table().await?;
            if let Some(online) = presence {
                for record in table.retain(|record| online(record.id())) {
                    debug!("Reaped offline record {} ({})", record.name(), record.id());
                }
            }
            table.digest()
        };

        let changed = {
            let mut last = self.last_digest.lock().unwrap_or_else(PoisonError::into_inner);
            if last.as_deref() == Some(digest.as_str()) {
                false
            } else {
                *last = Some(digest.clone());
                true
            }
        };
        if changed {
            if let Err(e) = self.publish(RecordMessage::Hash { digest }).await {
                *self.last_digest.lock().unwrap_or_else(PoisonError::into_inner) = None;
                return Err(e);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fabric_core::{Payload, StandardField};
    use std::time::Duration;

    /// Collects published envelopes; optionally fails every publish
    #[derive(Default)]
    struct Outbox {
        sent: StdMutex<Vec<Envelope>>,
        failing: bool,
    }

    #[async_trait]
    impl Endpoint for Outbox {
        fn local_name(&self) -> String {
            "alpha".to_string()
        }

        async fn publish(&self, envelope: Envelope) -> FabricResult<()> {
            if self.failing {
                return Err(FabricError::not_connected(HUB_NAME));
            }
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }

        async fn respond(&self, _sender: &str, _request: &Envelope, _payload: Payload) -> FabricResult<()> {
            Ok(())
        }

        async fn request_upstream(&self, _envelope: Envelope, timeout: Duration) -> FabricResult<Envelope> {
            Err(FabricError::timeout(timeout))
        }
    }

    fn create_test_store(role: StoreRole, outbox: &Arc<Outbox>) -> Arc<RecordStore> {
        let outbox: Arc<dyn Endpoint> = outbox.clone();
        Arc::new(RecordStore::new(
            role,
            Arc::downgrade(&outbox),
            ReplicationConfig::default(),
        ))
    }

    fn sent_messages(outbox: &Outbox) -> Vec<RecordMessage> {
        outbox
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|e| RecordMessage::from_envelope(e).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_add_and_remove_announce() {
        let outbox = Arc::new(Outbox::default());
        let store = create_test_store(StoreRole::Leaf, &outbox);
        let id = Uuid::new_v4();

        store.add_player("Steve", id, "alpha", true).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        store.add_player("Alex", Uuid::new_v4(), "alpha", false).await.unwrap();
        assert!(store.remove_player(id, true).await.unwrap().is_some());

        let sent = sent_messages(&outbox);
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], RecordMessage::Join { .. }));
        assert_eq!(sent[1], RecordMessage::Quit { id });
    }

    #[tokio::test]
    async fn test_set_rolls_back_when_send_fails() {
        let outbox = Arc::new(Outbox {
            failing: true,
            ..Outbox::default()
        });
        let store = create_test_store(StoreRole::Leaf, &outbox);
        let id = Uuid::new_v4();
        store.add_player("Steve", id, "alpha", false).await.unwrap();

        let key = FieldKey::from(StandardField::Vanished);
        let task = store.set(id, key.clone(), Variable::Flag(true)).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert_eq!(store.get_field(&id, &key).await, None);
    }

    #[tokio::test]
    async fn test_set_keeps_value_when_send_succeeds() {
        let outbox = Arc::new(Outbox::default());
        let store = create_test_store(StoreRole::Leaf, &outbox);
        let id = Uuid::new_v4();
        store.add_player("Steve", id, "alpha", false).await.unwrap();

        let key = FieldKey::custom("chat", "nickname");
        let task = store.set(id, key.clone(), Variable::Text("Stevie".into())).await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(
            store.get_field(&id, &key).await.map(|v| v.value),
            Some(Variable::Text("Stevie".into()))
        );
        assert!(matches!(sent_messages(&outbox)[0], RecordMessage::Update { .. }));
    }

    #[tokio::test]
    async fn test_set_rejects_wrong_type() {
        let outbox = Arc::new(Outbox::default());
        let store = create_test_store(StoreRole::Leaf, &outbox);
        let id = Uuid::new_v4();
        store.add_player("Steve", id, "alpha", false).await.unwrap();
        assert!(store
            .set(id, StandardField::Vanished.into(), Variable::Text("yes".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_spoofed_update_is_rejected() {
        let outbox = Arc::new(Outbox::default());
        let store = create_test_store(StoreRole::Leaf, &outbox);
        let id = Uuid::new_v4();
        store.add_player("Steve", id, "alpha", false).await.unwrap();

        let update = RecordMessage::Update {
            id,
            field: StandardField::Vanished.into(),
            value: Versioned::now(Variable::Flag(true)),
        }
        .into_envelope()
        .unwrap();

        assert!(store.handle("mallory", &update).await.is_err());
        assert_eq!(
            store.get_field(&id, &StandardField::Vanished.into()).await,
            None
        );
        store.handle("alpha", &update).await.unwrap();
        assert!(store
            .get_field(&id, &StandardField::Vanished.into())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_join_must_come_from_owner_or_hub() {
        let outbox = Arc::new(Outbox::default());
        let store = create_test_store(StoreRole::Leaf, &outbox);
        let record = SessionRecord::new(Uuid::new_v4(), "Steve", "beta", Timestamp::now());
        let join = RecordMessage::Join { record }.into_envelope().unwrap();

        assert!(store.handle("mallory", &join).await.is_err());
        store.handle("beta", &join).await.unwrap();
        store.handle(HUB_NAME, &join).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_reaps_silently_and_announces_only_changes() {
        let outbox = Arc::new(Outbox::default());
        let store = create_test_store(StoreRole::Hub, &outbox);
        let online = Uuid::new_v4();
        let offline = Uuid::new_v4();
        store.add_player("Steve", online, "alpha", false).await.unwrap();
        store.add_player("Alex", offline, "beta", false).await.unwrap();
        store.set_presence_check(Arc::new(move |id: Uuid| id == online));

        store.reconcile().await.unwrap();
        store.reconcile().await.unwrap();

        let sent = sent_messages(&outbox);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], RecordMessage::Hash { .. }));
        assert!(!sent.contains(&RecordMessage::Quit { id: offline }));
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
