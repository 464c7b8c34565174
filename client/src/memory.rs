//! In-memory remote store and change feed.
//!
//! [`MemoryBackend`] plays the server: it assigns ids and timestamps, keeps
//! rows per entity type and pushes a change event to every matching
//! subscriber after each committed write, the writer included. Tests use its
//! failure injection and hold gate to observe in-flight states.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use rebound_engine::{ChangeEvent, Entity, Payload, PositionUpdate, Timestamp};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{FeedError, RemoteError};
use crate::feed::{ChangeFeed, FeedFilter, Subscription, SubscriptionId};
use crate::remote::RemoteStore;

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Row>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct Row {
    entity: Entity<Value>,
    seq: u64,
}

impl Table {
    fn insert(&mut self, entity: Entity<Value>) {
        self.next_seq += 1;
        self.rows.retain(|row| row.entity.id != entity.id);
        self.rows.push(Row {
            entity,
            seq: self.next_seq,
        });
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Entity<Value>> {
        self.rows
            .iter_mut()
            .map(|row| &mut row.entity)
            .find(|entity| entity.id == id)
    }

    /// Unpositioned rows newest first, then positioned rows by `(position, id)`.
    fn ordered(&self) -> Vec<Entity<Value>> {
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| match (a.entity.position, b.entity.position) {
            (None, None) => b.seq.cmp(&a.seq),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => (x, &a.entity.id).cmp(&(y, &b.entity.id)),
        });
        rows.into_iter().map(|row| row.entity).collect()
    }
}

#[derive(Debug)]
struct Subscriber {
    entity_type: String,
    filter: Option<FeedFilter>,
    sender: mpsc::UnboundedSender<ChangeEvent<Value>>,
}

struct Shared {
    tables: Mutex<HashMap<String, Table>>,
    subscribers: DashMap<SubscriptionId, Subscriber>,
    failures: Mutex<VecDeque<RemoteError>>,
    batch_failure: Mutex<Option<(usize, RemoteError)>>,
    gate: watch::Sender<bool>,
    calls: AtomicUsize,
}

/// Shared in-memory backend. Cloning shares the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(HashMap::new()),
                subscribers: DashMap::new(),
                failures: Mutex::new(VecDeque::new()),
                batch_failure: Mutex::new(None),
                gate,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// A typed remote store for one entity type.
    pub fn store<T: Payload>(&self, entity_type: impl Into<String>) -> MemoryRemoteStore<T> {
        MemoryRemoteStore {
            backend: self.clone(),
            entity_type: entity_type.into(),
            _payload: PhantomData,
        }
    }

    /// Put rows in place without notifying anyone.
    pub fn seed(&self, entity_type: &str, rows: Vec<Entity<Value>>) {
        let mut tables = self.tables();
        let table = tables.entry(entity_type.to_string()).or_default();
        for row in rows {
            table.insert(row);
        }
    }

    /// Stored rows in server order.
    pub fn rows(&self, entity_type: &str) -> Vec<Entity<Value>> {
        self.tables()
            .get(entity_type)
            .map(Table::ordered)
            .unwrap_or_default()
    }

    /// Make the next remote call fail with `message`. Calls queue up.
    pub fn fail_next(&self, message: impl Into<String>) {
        lock(&self.shared.failures).push_back(RemoteError::new(message));
    }

    /// Make the next batch position write store only its first `written`
    /// entries and then fail.
    pub fn fail_batch_after(&self, written: usize, message: impl Into<String>) {
        *lock(&self.shared.batch_failure) = Some((written, RemoteError::new(message)));
    }

    /// Park every remote call until [`release`](Self::release).
    pub fn hold(&self) {
        self.shared.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.shared.gate.send_replace(false);
    }

    /// Number of remote calls received so far.
    pub fn calls(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Insert a row as another client would.
    pub fn insert_external(&self, entity_type: &str, payload: Value) -> Entity<Value> {
        let entity = Entity::new(Uuid::new_v4().to_string(), payload, now());
        self.tables()
            .entry(entity_type.to_string())
            .or_default()
            .insert(entity.clone());
        self.broadcast(
            entity_type,
            &entity.payload,
            ChangeEvent::Insert {
                entity: entity.clone(),
            },
        );
        entity
    }

    /// Patch a row as another client would.
    pub fn update_external(
        &self,
        entity_type: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> Option<Entity<Value>> {
        let updated = {
            let mut tables = self.tables();
            let entity = tables.get_mut(entity_type)?.find_mut(id)?;
            entity.payload.apply_patch(&patch);
            entity.updated_at = now();
            entity.clone()
        };
        self.broadcast(
            entity_type,
            &updated.payload,
            ChangeEvent::Update {
                entity: updated.clone(),
            },
        );
        Some(updated)
    }

    /// Delete a row as another client would.
    pub fn delete_external(&self, entity_type: &str, id: &str) -> bool {
        match self.remove_row(entity_type, id) {
            Some(removed) => {
                self.broadcast(
                    entity_type,
                    &removed.payload,
                    ChangeEvent::Delete { id: removed.id },
                );
                true
            }
            None => false,
        }
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        lock(&self.shared.tables)
    }

    fn remove_row(&self, entity_type: &str, id: &str) -> Option<Entity<Value>> {
        let mut tables = self.tables();
        let table = tables.get_mut(entity_type)?;
        let index = table.rows.iter().position(|row| row.entity.id == id)?;
        Some(table.rows.remove(index).entity)
    }

    fn broadcast(&self, entity_type: &str, payload: &Value, event: ChangeEvent<Value>) {
        self.shared.subscribers.retain(|_, subscriber| {
            let matches = subscriber.entity_type == entity_type
                && subscriber
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter.matches(payload));
            !matches || subscriber.sender.send(event.clone()).is_ok()
        });
    }

    /// Count the call, wait at the gate, then apply any queued failure.
    async fn enter(&self) -> Result<(), RemoteError> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.shared.gate.subscribe();
        let _ = gate.wait_for(|held| !*held).await;

        match lock(&self.shared.failures).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

fn decode<T: Payload>(entity: Entity<Value>) -> Result<Entity<T>, RemoteError> {
    entity
        .try_map(serde_json::from_value)
        .map_err(|e| RemoteError::new(format!("malformed row: {}", e)))
}

fn encode<S: serde::Serialize>(value: &S) -> Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::new(format!("invalid payload: {}", e)))
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(
        &self,
        entity_type: &str,
        filter: Option<FeedFilter>,
    ) -> Result<Subscription, FeedError> {
        let id = SubscriptionId(Uuid::new_v4().to_string());
        let (sender, events) = mpsc::unbounded_channel();
        self.shared.subscribers.insert(
            id.clone(),
            Subscriber {
                entity_type: entity_type.to_string(),
                filter,
                sender,
            },
        );

        Ok(Subscription {
            id,
            entity_type: entity_type.to_string(),
            events,
        })
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), FeedError> {
        self.shared.subscribers.remove(id);
        Ok(())
    }
}

/// [`RemoteStore`] view of one table of a [`MemoryBackend`].
pub struct MemoryRemoteStore<T> {
    backend: MemoryBackend,
    entity_type: String,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: Payload> RemoteStore<T> for MemoryRemoteStore<T> {
    async fn list(&self) -> Result<Vec<Entity<T>>, RemoteError> {
        self.backend.enter().await?;
        self.backend
            .rows(&self.entity_type)
            .into_iter()
            .map(decode)
            .collect()
    }

    async fn create(&self, payload: &T) -> Result<Entity<T>, RemoteError> {
        self.backend.enter().await?;
        let entity = Entity::new(Uuid::new_v4().to_string(), encode(payload)?, now());
        self.backend
            .tables()
            .entry(self.entity_type.clone())
            .or_default()
            .insert(entity.clone());

        self.backend.broadcast(
            &self.entity_type,
            &entity.payload,
            ChangeEvent::Insert {
                entity: entity.clone(),
            },
        );
        decode(entity)
    }

    async fn update(&self, id: &str, patch: &T::Patch) -> Result<Entity<T>, RemoteError> {
        self.backend.enter().await?;
        let fields = match encode(patch)? {
            Value::Object(fields) => fields,
            _ => return Err(RemoteError::new("patch must be a JSON object")),
        };

        let updated = {
            let mut tables = self.backend.tables();
            let entity = tables
                .get_mut(&self.entity_type)
                .and_then(|table| table.find_mut(id))
                .ok_or_else(|| RemoteError::new(format!("not found: {}", id)))?;
            entity.payload.apply_patch(&fields);
            entity.updated_at = now();
            entity.clone()
        };

        self.backend.broadcast(
            &self.entity_type,
            &updated.payload,
            ChangeEvent::Update {
                entity: updated.clone(),
            },
        );
        decode(updated)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.backend.enter().await?;
        let removed = self
            .backend
            .remove_row(&self.entity_type, id)
            .ok_or_else(|| RemoteError::new(format!("not found: {}", id)))?;

        self.backend.broadcast(
            &self.entity_type,
            &removed.payload,
            ChangeEvent::Delete { id: removed.id },
        );
        Ok(())
    }

    async fn batch_set_positions(&self, updates: &[PositionUpdate]) -> Result<(), RemoteError> {
        self.backend.enter().await?;
        let partial = lock(&self.backend.shared.batch_failure).take();

        let written = {
            let mut tables = self.backend.tables();
            let table = tables.entry(self.entity_type.clone()).or_default();
            let limit = match &partial {
                Some((written, _)) => (*written).min(updates.len()),
                None => {
                    if let Some(missing) = updates.iter().find(|u| table.find_mut(&u.id).is_none())
                    {
                        return Err(RemoteError::new(format!("not found: {}", missing.id)));
                    }
                    updates.len()
                }
            };

            let mut written = Vec::with_capacity(limit);
            for update in &updates[..limit] {
                if let Some(entity) = table.find_mut(&update.id) {
                    entity.position = Some(update.position);
                    entity.updated_at = now();
                    written.push(entity.clone());
                }
            }
            written
        };

        for entity in written {
            let payload = entity.payload.clone();
            self.backend
                .broadcast(&self.entity_type, &payload, ChangeEvent::Update { entity });
        }

        match partial {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}
