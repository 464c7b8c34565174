//! Synchronized collection.
//!
//! [`SyncedCollection`] drives one [`CollectionStore`] against a
//! [`RemoteStore`] and a [`ChangeFeed`]. Every mutation is applied locally
//! first, sent to the remote, then settled or rolled back. Feed events are
//! merged as they arrive. The store lock is never held across an await, so
//! reads always see the latest optimistic state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rebound_engine::{
    plan_reorder, ChangeEvent, Clock, CollectionStore, CorrelationId, Entity, EntityId,
    MergeOutcome, OperationKind, Payload, ProvisionalId, Settlement, ViewSnapshot,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::clock::SystemClock;
use crate::error::{RemoteError, SyncError};
use crate::feed::{ChangeFeed, FeedFilter, SubscriptionId};
use crate::remote::RemoteStore;

/// Progress of an in-flight create, watched by edits issued against its
/// provisional id.
#[derive(Debug, Clone, PartialEq)]
enum CreateStatus {
    Pending,
    Confirmed(EntityId),
    Failed(RemoteError),
}

struct State<T: Payload> {
    store: CollectionStore<T>,
    error: Option<RemoteError>,
    creates: HashMap<EntityId, watch::Sender<CreateStatus>>,
    /// Loads whose list response has not been applied yet
    loads: usize,
    /// Feed events seen while a load was outstanding, replayed over its rows
    during_load: Vec<ChangeEvent<T>>,
}

impl<T: Payload> State<T> {
    fn finish_load(&mut self) {
        self.loads = self.loads.saturating_sub(1);
        if self.loads == 0 {
            self.during_load.clear();
        }
    }
}

/// Ends a load even if its future is dropped mid-flight.
struct LoadGuard<'a, T: Payload> {
    collection: &'a SyncedCollection<T>,
}

impl<T: Payload> Drop for LoadGuard<'_, T> {
    fn drop(&mut self) {
        self.collection.lock().finish_load();
    }
}

struct FeedAttachment {
    feed: Arc<dyn ChangeFeed>,
    subscription: SubscriptionId,
    pump: JoinHandle<()>,
}

struct Inner<T: Payload> {
    entity_type: String,
    remote: Arc<dyn RemoteStore<T>>,
    clock: Arc<dyn Clock>,
    state: Mutex<State<T>>,
    revision: watch::Sender<u64>,
    feed: Mutex<Option<FeedAttachment>>,
}

impl<T: Payload> Drop for Inner<T> {
    fn drop(&mut self) {
        let slot = self.feed.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(attachment) = slot.take() {
            attachment.pump.abort();
        }
    }
}

/// One entity type kept in sync with the server. Cheap to clone.
pub struct SyncedCollection<T: Payload> {
    inner: Arc<Inner<T>>,
}

impl<T: Payload> Clone for SyncedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> SyncedCollection<T> {
    pub fn new(entity_type: impl Into<String>, remote: Arc<dyn RemoteStore<T>>) -> Self {
        Self::with_clock(entity_type, remote, Arc::new(SystemClock))
    }

    /// Build with an explicit time source for optimistic timestamps.
    pub fn with_clock(
        entity_type: impl Into<String>,
        remote: Arc<dyn RemoteStore<T>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entity_type: entity_type.into(),
                remote,
                clock,
                state: Mutex::new(State {
                    store: CollectionStore::new(),
                    error: None,
                    creates: HashMap::new(),
                    loads: 0,
                    during_load: Vec::new(),
                }),
                revision,
                feed: Mutex::new(None),
            }),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.inner.entity_type
    }

    // ---- Reads -------------------------------------------------------------

    /// Everything a view needs, copied out of the lock.
    pub fn view(&self) -> ViewSnapshot<T> {
        let state = self.lock();
        ViewSnapshot::capture(&state.store, state.error.clone())
    }

    pub fn entities(&self) -> Vec<Entity<T>> {
        self.lock().store.entities().to_vec()
    }

    /// Look up an entity. A provisional id stops resolving once its create
    /// has settled.
    pub fn get(&self, id: &str) -> Option<Entity<T>> {
        self.lock().store.get(id).cloned()
    }

    pub fn is_mutating(&self) -> bool {
        self.lock().store.is_mutating()
    }

    /// The last remote failure, cleared by the next success.
    pub fn error(&self) -> Option<RemoteError> {
        self.lock().error.clone()
    }

    pub fn clear_error(&self) {
        let mut state = self.lock();
        if state.error.take().is_some() {
            self.publish(&state);
        }
    }

    /// Notified after every visible change. The value is the store revision.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    // ---- Loading -----------------------------------------------------------

    /// Replace local state with the server's list. Entities with in-flight
    /// operations keep their local state.
    ///
    /// Feed events merged while the list is in flight may be older or newer
    /// than the rows it returns, so they are merged again on top of them.
    pub async fn load(&self) -> Result<(), SyncError> {
        self.lock().loads += 1;
        let _guard = LoadGuard { collection: self };

        let result = self.inner.remote.list().await;

        let mut state = self.lock();
        match result {
            Ok(rows) => {
                let count = rows.len();
                state.store.hydrate(rows);
                let replayed = state.during_load.clone();
                for event in replayed {
                    state.store.merge(event);
                }
                state.error = None;
                self.publish(&state);
                debug!(entity_type = %self.inner.entity_type, count, "collection loaded");
                Ok(())
            }
            Err(err) => {
                warn!(entity_type = %self.inner.entity_type, error = %err, "load failed");
                state.error = Some(err.clone());
                self.publish(&state);
                Err(err.into())
            }
        }
    }

    // ---- Mutations ---------------------------------------------------------

    /// Create an entity. It is visible at once under a provisional id, which
    /// is replaced by the server id on success. Returns the settled entity.
    pub async fn create(&self, payload: T) -> Result<Entity<T>, SyncError> {
        let provisional = ProvisionalId::from_token(Uuid::new_v4().to_string()).into_inner();
        let correlation_id = {
            let mut state = self.lock();
            let now = self.inner.clock.now();
            let correlation_id = state
                .store
                .begin_create(Entity::new(provisional.clone(), payload.clone(), now))?;
            let (status, _) = watch::channel(CreateStatus::Pending);
            state.creates.insert(provisional.clone(), status);
            self.publish(&state);
            correlation_id
        };
        debug!(
            entity_type = %self.inner.entity_type,
            op = %correlation_id,
            id = %provisional,
            "optimistic create"
        );

        let result = self.inner.remote.create(&payload).await;

        let mut state = self.lock();
        let status = state.creates.remove(&provisional);
        match result {
            Ok(row) => {
                let server_id = row.id.clone();
                if state.store.confirm_create(correlation_id, row.clone()) == Settlement::Stale {
                    trace!(op = %correlation_id, id = %server_id, "create settled after local removal");
                }
                if let Some(status) = status {
                    status.send_replace(CreateStatus::Confirmed(server_id.clone()));
                }
                state.error = None;
                self.publish(&state);
                debug!(op = %correlation_id, id = %server_id, "create confirmed");
                Ok(state.store.get(&server_id).cloned().unwrap_or(row))
            }
            Err(err) => {
                state.store.rollback(correlation_id);
                if let Some(status) = status {
                    status.send_replace(CreateStatus::Failed(err.clone()));
                }
                Err(self.fail(&mut state, correlation_id, OperationKind::Create, &provisional, err))
            }
        }
    }

    /// Patch an entity. Edits against a provisional id wait for its create
    /// and are sent under the server id.
    pub async fn update(&self, id: &str, patch: T::Patch) -> Result<Entity<T>, SyncError> {
        let (correlation_id, id, creating) = {
            let mut state = self.lock();
            let id = id.to_string();
            let now = self.inner.clock.now();
            let correlation_id = state.store.begin_update(&id, patch.clone(), now)?;
            let creating = state.creates.get(&id).map(watch::Sender::subscribe);
            self.publish(&state);
            (correlation_id, id, creating)
        };
        debug!(entity_type = %self.inner.entity_type, op = %correlation_id, id = %id, "optimistic update");

        let target = match self.settled_target(correlation_id, creating).await {
            Ok(target) => target,
            Err(err) => return Err(self.abandon(correlation_id, OperationKind::Update, &id, err)),
        };

        let result = self.inner.remote.update(&target, &patch).await;

        let mut state = self.lock();
        match result {
            Ok(row) => {
                if state.store.confirm_update(correlation_id, row.clone()) == Settlement::Stale {
                    trace!(op = %correlation_id, id = %target, "update settled after local removal");
                }
                state.error = None;
                self.publish(&state);
                Ok(state.store.get(&target).cloned().unwrap_or(row))
            }
            Err(err) => {
                state.store.rollback(correlation_id);
                Err(self.fail(&mut state, correlation_id, OperationKind::Update, &target, err))
            }
        }
    }

    /// Delete an entity. It disappears at once and comes back if the server
    /// refuses.
    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let (correlation_id, id, creating) = {
            let mut state = self.lock();
            let id = id.to_string();
            let correlation_id = state.store.begin_delete(&id)?;
            let creating = state.creates.get(&id).map(watch::Sender::subscribe);
            self.publish(&state);
            (correlation_id, id, creating)
        };
        debug!(entity_type = %self.inner.entity_type, op = %correlation_id, id = %id, "optimistic delete");

        let target = match self.settled_target(correlation_id, creating).await {
            Ok(target) => target,
            Err(err) => return Err(self.abandon(correlation_id, OperationKind::Delete, &id, err)),
        };

        let result = self.inner.remote.delete(&target).await;

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.store.confirm(correlation_id);
                state.error = None;
                self.publish(&state);
                Ok(())
            }
            Err(err) => {
                state.store.rollback(correlation_id);
                Err(self.fail(&mut state, correlation_id, OperationKind::Delete, &target, err))
            }
        }
    }

    /// Apply a new display order. The list moves in one step and is sent as
    /// one batch of position writes; any failure restores the previous order.
    ///
    /// Ids not listed keep their positions. An order that moves nothing makes
    /// no remote call.
    pub async fn reorder(&self, ordered_ids: &[EntityId]) -> Result<(), SyncError> {
        let (correlation_id, updates) = {
            let mut state = self.lock();
            let plan = plan_reorder(&state.store, ordered_ids)?;
            let updates = plan.updates.clone();
            match state.store.begin_reorder(plan) {
                Some(correlation_id) => {
                    self.publish(&state);
                    (correlation_id, updates)
                }
                None => return Ok(()),
            }
        };
        debug!(
            entity_type = %self.inner.entity_type,
            op = %correlation_id,
            writes = updates.len(),
            "optimistic reorder"
        );

        let result = self.inner.remote.batch_set_positions(&updates).await;

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.store.confirm(correlation_id);
                state.error = None;
                self.publish(&state);
                Ok(())
            }
            Err(err) => {
                state.store.rollback(correlation_id);
                Err(self.fail(&mut state, correlation_id, OperationKind::Reorder, "batch", err))
            }
        }
    }

    // ---- Change feed -------------------------------------------------------

    /// Merge one change event into the local list.
    pub fn on_event(&self, event: ChangeEvent<T>) -> MergeOutcome {
        let id = event.entity_id().clone();
        let kind = event.kind();

        let mut state = self.lock();
        if state.loads > 0 {
            state.during_load.push(event.clone());
        }
        let outcome = state.store.merge(event);
        match outcome {
            MergeOutcome::Applied => {
                self.publish(&state);
                trace!(entity_type = %self.inner.entity_type, id = %id, kind, "change merged");
            }
            MergeOutcome::Ignored => {
                trace!(entity_type = %self.inner.entity_type, id = %id, kind, "change ignored");
            }
            MergeOutcome::Deferred => {
                trace!(entity_type = %self.inner.entity_type, id = %id, kind, "change held until creates settle");
            }
            MergeOutcome::Discarded(reason) => {
                debug!(
                    entity_type = %self.inner.entity_type,
                    id = %id,
                    kind,
                    reason = %reason,
                    "change discarded in favour of local operation"
                );
            }
        }
        outcome
    }

    /// Subscribe to `feed` and merge its events until detached. Replaces any
    /// earlier attachment.
    pub async fn attach_feed(
        &self,
        feed: Arc<dyn ChangeFeed>,
        filter: Option<FeedFilter>,
    ) -> Result<(), SyncError> {
        self.detach_feed().await?;

        let subscription = feed.subscribe(&self.inner.entity_type, filter).await?;
        let subscription_id = subscription.id.clone();
        let mut events = subscription.events;
        let weak = Arc::downgrade(&self.inner);

        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SyncedCollection { inner }.on_raw_event(event);
            }
        });

        debug!(entity_type = %self.inner.entity_type, subscription = %subscription_id, "feed attached");
        *self.feed_slot() = Some(FeedAttachment {
            feed,
            subscription: subscription_id,
            pump,
        });
        Ok(())
    }

    /// Stop merging feed events and release the subscription.
    pub async fn detach_feed(&self) -> Result<(), SyncError> {
        let attachment = self.feed_slot().take();
        if let Some(attachment) = attachment {
            attachment.pump.abort();
            attachment.feed.unsubscribe(&attachment.subscription).await?;
            debug!(
                entity_type = %self.inner.entity_type,
                subscription = %attachment.subscription,
                "feed detached"
            );
        }
        Ok(())
    }

    pub fn is_feed_attached(&self) -> bool {
        self.feed_slot().is_some()
    }

    fn on_raw_event(&self, event: ChangeEvent<Value>) {
        let id = event.entity_id().clone();
        match event.try_map(serde_json::from_value::<T>) {
            Ok(event) => {
                self.on_event(event);
            }
            Err(err) => {
                warn!(entity_type = %self.inner.entity_type, id = %id, error = %err, "undecodable change event");
            }
        }
    }

    // ---- Internals ---------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn feed_slot(&self) -> MutexGuard<'_, Option<FeedAttachment>> {
        self.inner.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State<T>) {
        self.inner.revision.send_replace(state.store.revision());
    }

    /// Wait for the create behind a provisional id, then read the id the
    /// operation should be sent under.
    async fn settled_target(
        &self,
        correlation_id: CorrelationId,
        creating: Option<watch::Receiver<CreateStatus>>,
    ) -> Result<EntityId, RemoteError> {
        if let Some(mut creating) = creating {
            let status = creating
                .wait_for(|status| *status != CreateStatus::Pending)
                .await
                .map(|status| (*status).clone());
            match status {
                Ok(CreateStatus::Failed(err)) => return Err(err),
                Ok(_) => {}
                Err(_) => return Err(RemoteError::new("create was abandoned")),
            }
        }

        let state = self.lock();
        state
            .store
            .pending()
            .get(correlation_id)
            .and_then(|op| op.target_id().cloned())
            .ok_or_else(|| RemoteError::new("operation already settled"))
    }

    fn abandon(
        &self,
        correlation_id: CorrelationId,
        kind: OperationKind,
        id: &str,
        err: RemoteError,
    ) -> SyncError {
        let mut state = self.lock();
        state.store.rollback(correlation_id);
        self.fail(&mut state, correlation_id, kind, id, err)
    }

    /// Surface a failure after its operation has been rolled back.
    fn fail(
        &self,
        state: &mut State<T>,
        correlation_id: CorrelationId,
        kind: OperationKind,
        id: &str,
        err: RemoteError,
    ) -> SyncError {
        warn!(
            entity_type = %self.inner.entity_type,
            op = %correlation_id,
            kind = %kind,
            id = %id,
            error = %err,
            "remote rejected operation, rolled back"
        );
        state.error = Some(err.clone());
        self.publish(state);
        SyncError::Remote(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use rebound_engine::ManualClock;
    use serde_json::json;

    fn collection(backend: &MemoryBackend) -> SyncedCollection<Value> {
        SyncedCollection::with_clock(
            "tasks",
            Arc::new(backend.store::<Value>("tasks")),
            Arc::new(ManualClock::new(1000)),
        )
    }

    #[tokio::test]
    async fn create_settles_under_server_id() {
        let backend = MemoryBackend::new();
        let tasks = collection(&backend);

        let created = tasks.create(json!({"title": "A"})).await.unwrap();
        assert!(!created.is_provisional());
        assert_eq!(tasks.view().ids(), vec![created.id.as_str()]);
        assert!(!tasks.is_mutating());
    }

    #[tokio::test]
    async fn provisional_id_stops_resolving_after_create() {
        let backend = MemoryBackend::new();
        let tasks = collection(&backend);

        backend.hold();
        let create = tokio::spawn({
            let tasks = tasks.clone();
            async move { tasks.create(json!({"title": "A"})).await }
        });
        let mut changes = tasks.changes();
        while tasks.entities().is_empty() {
            changes.changed().await.unwrap();
        }
        let provisional = tasks.entities()[0].id.clone();
        assert!(tasks.get(&provisional).is_some());

        backend.release();
        let created = create.await.unwrap().unwrap();
        assert!(tasks.get(&provisional).is_none());
        assert_eq!(tasks.get(&created.id).unwrap().payload["title"], "A");
    }

    #[tokio::test]
    async fn failed_update_sets_error_and_success_clears_it() {
        let backend = MemoryBackend::new();
        let tasks = collection(&backend);
        let created = tasks.create(json!({"title": "A"})).await.unwrap();

        backend.fail_next("denied");
        let patch = json!({"title": "B"}).as_object().cloned().unwrap();
        let err = tasks.update(&created.id, patch.clone()).await.unwrap_err();
        assert_eq!(err.remote().map(|e| e.message.as_str()), Some("denied"));
        assert_eq!(tasks.get(&created.id).unwrap().payload["title"], "A");
        assert_eq!(tasks.error(), Some(RemoteError::new("denied")));

        tasks.update(&created.id, patch).await.unwrap();
        assert_eq!(tasks.error(), None);
    }

    #[tokio::test]
    async fn unknown_id_is_an_engine_error() {
        let backend = MemoryBackend::new();
        let tasks = collection(&backend);

        let err = tasks.delete("missing").await.unwrap_err();
        assert!(matches!(err, SyncError::Engine(_)));
        assert_eq!(backend.calls(), 0);
        assert_eq!(tasks.error(), None);
    }

    #[tokio::test]
    async fn clear_error_notifies() {
        let backend = MemoryBackend::new();
        let tasks = collection(&backend);
        backend.fail_next("offline");
        assert!(tasks.load().await.is_err());

        let changes = tasks.changes();
        tasks.clear_error();
        assert!(changes.has_changed().unwrap());
        assert!(tasks.view().error.is_none());
    }
}
