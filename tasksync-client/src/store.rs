//! Local, authoritative entity store.
//!
//! Owns timestamps and soft-delete. Local edits are always stamped by the
//! store's clock; the only way to write a foreign `updated_at` is the separate
//! reconciliation path ([`EntityStore::apply_remote`]).

use crate::events::{Callback, Filter, SubscriberRegistry, Subscription};
use crate::storage::EntityStorage;
use std::marker::PhantomData;
use std::sync::Arc;
use tasksync_core::clock::Clock;
use tasksync_core::conflicts::{ConflictResolver, ReconcileOutcome, Resolution};
use tasksync_core::models::{CategoryData, Category, Draft, EntityData, Record, Task, TaskData};
use tasksync_core::{SyncError, SyncResult};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of `create` when the draft carries an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Inserted,
    /// The id existed and the draft was strictly newer: applied as an update.
    Merged,
    /// The id existed and the draft was not newer: the stored record was kept.
    Discarded,
}

pub struct EntityStore<D: EntityData, S: EntityStorage<D>> {
    storage: S,
    clock: Arc<dyn Clock>,
    resolver: ConflictResolver,
    subscribers: Arc<SubscriberRegistry<D>>,
    // Serializes read-modify-write cycles
    write_lock: Mutex<()>,
    _data: PhantomData<fn() -> D>,
}

impl<D: EntityData, S: EntityStorage<D>> EntityStore<D, S> {
    pub fn new(storage: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            resolver: ConflictResolver::new(),
            subscribers: SubscriberRegistry::new(),
            write_lock: Mutex::new(()),
            _data: PhantomData,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn create(&self, draft: Draft<D>) -> SyncResult<Record<D>> {
        self.create_with_outcome(draft).await.map(|(record, _)| record)
    }

    /// Creates a record, or merges into an existing one when the draft
    /// carries an id that is already stored.
    pub async fn create_with_outcome(
        &self,
        draft: Draft<D>,
    ) -> SyncResult<(Record<D>, CreateOutcome)> {
        let mut data = draft.data;
        data.normalize();
        data.validate()?;

        let guard = self.write_lock.lock().await;
        let now = self.clock.now();

        if let Some(id) = draft.id {
            if let Some(existing) = self.storage.load(id).await? {
                let incoming_at = draft.updated_at.unwrap_or(now);
                if incoming_at <= existing.updated_at {
                    warn!(
                        "STORE: discarding create of existing {} {} (incoming {} <= stored {})",
                        D::KIND,
                        id,
                        incoming_at,
                        existing.updated_at
                    );
                    return Ok((existing, CreateOutcome::Discarded));
                }

                let mut record = Record {
                    id,
                    created_at: existing.created_at,
                    updated_at: incoming_at,
                    archived: draft.archived,
                    data,
                };
                record.normalize();
                self.storage.save(&record).await?;
                debug!("STORE: merged create into existing {} {}", D::KIND, id);
                drop(guard);
                self.publish().await;
                return Ok((record, CreateOutcome::Merged));
            }
        }

        // Timestamps from a draft are honoured only when it brings its own id
        let imported = draft.id.is_some();
        let mut record = Record {
            id: draft.id.unwrap_or_else(Uuid::new_v4),
            created_at: draft.created_at.filter(|_| imported).unwrap_or(now),
            updated_at: draft.updated_at.filter(|_| imported).unwrap_or(now),
            archived: draft.archived,
            data,
        };
        record.normalize();
        self.storage.save(&record).await?;
        debug!("STORE: created {} {}", D::KIND, record.id);
        drop(guard);
        self.publish().await;
        Ok((record, CreateOutcome::Inserted))
    }

    pub async fn find(&self, id: Uuid) -> SyncResult<Option<Record<D>>> {
        self.storage.load(id).await
    }

    pub async fn get(&self, id: Uuid) -> SyncResult<Record<D>> {
        self.storage
            .load(id)
            .await?
            .ok_or_else(|| SyncError::not_found(D::KIND, id))
    }

    pub async fn get_all<F>(&self, filter: F) -> SyncResult<Vec<Record<D>>>
    where
        F: Fn(&Record<D>) -> bool,
    {
        let records = self.storage.load_all().await?;
        Ok(records.into_iter().filter(|r| filter(r)).collect())
    }

    /// Applies a local edit to the payload and stamps `updated_at` with the
    /// store's clock.
    pub async fn update<F>(&self, id: Uuid, edit: F) -> SyncResult<Record<D>>
    where
        F: FnOnce(&mut D),
    {
        self.modify(id, |record| edit(&mut record.data)).await
    }

    pub async fn archive(&self, id: Uuid) -> SyncResult<Record<D>> {
        self.modify(id, |record| record.archived = true).await
    }

    pub async fn unarchive(&self, id: Uuid) -> SyncResult<Record<D>> {
        self.modify(id, |record| record.archived = false).await
    }

    /// Removes every id and returns the removed records so the caller can
    /// clean up what they own. Fails without removing anything if an id is
    /// missing.
    pub async fn delete(&self, ids: &[Uuid]) -> SyncResult<Vec<Record<D>>> {
        let guard = self.write_lock.lock().await;
        for id in ids {
            if self.storage.load(*id).await?.is_none() {
                return Err(SyncError::not_found(D::KIND, id));
            }
        }

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.storage.remove(*id).await? {
                removed.push(record);
            }
        }
        debug!("STORE: deleted {} {}(s)", removed.len(), D::KIND);
        drop(guard);
        self.publish().await;
        Ok(removed)
    }

    /// Registers `callback` for the full matching set after every committed
    /// mutation. The current set is delivered once immediately.
    pub async fn subscribe(
        &self,
        filter: Filter<D>,
        callback: Callback<D>,
    ) -> SyncResult<Subscription> {
        let subscription = self.subscribers.register(filter, callback);
        let records = self.storage.load_all().await?;
        self.subscribers.deliver_to(subscription.id(), &records);
        Ok(subscription)
    }

    /// Reconciles a record pulled from the remote store. Keeps the remote
    /// `updated_at`; never schedules a push.
    pub async fn apply_remote(&self, remote: Record<D>) -> SyncResult<ReconcileOutcome> {
        let mut remote = remote;
        remote.normalize();

        let guard = self.write_lock.lock().await;
        let outcome = match self.storage.load(remote.id).await? {
            None => {
                self.storage.save(&remote).await?;
                ReconcileOutcome::Created
            }
            Some(local) => match self.resolver.resolve(local.updated_at, remote.updated_at) {
                Resolution::RemoteWins => {
                    self.storage.save(&remote).await?;
                    ReconcileOutcome::Updated
                }
                Resolution::LocalWins => ReconcileOutcome::ConflictNoop,
            },
        };
        drop(guard);

        debug!("STORE: applied remote {} {}: {:?}", D::KIND, remote.id, outcome);
        if outcome.wrote() {
            self.publish().await;
        }
        Ok(outcome)
    }

    /// Removes a record because the remote store holds a tombstone for it.
    /// Absent ids are a no-op.
    pub async fn remove_remote(&self, id: Uuid) -> SyncResult<ReconcileOutcome> {
        let removed = {
            let _guard = self.write_lock.lock().await;
            self.storage.remove(id).await?
        };
        match removed {
            Some(_) => {
                self.publish().await;
                Ok(ReconcileOutcome::Deleted)
            }
            None => Ok(ReconcileOutcome::AlreadyAbsent),
        }
    }

    async fn modify<F>(&self, id: Uuid, change: F) -> SyncResult<Record<D>>
    where
        F: FnOnce(&mut Record<D>),
    {
        let guard = self.write_lock.lock().await;
        let existing = self
            .storage
            .load(id)
            .await?
            .ok_or_else(|| SyncError::not_found(D::KIND, id))?;

        let mut record = existing.clone();
        change(&mut record);
        record.id = existing.id;
        record.created_at = existing.created_at;
        record.normalize();
        record.data.validate()?;
        // Never move backwards, even if the stored copy came from a faster clock
        record.updated_at = self.clock.now().max(existing.updated_at);

        self.storage.save(&record).await?;
        drop(guard);
        self.publish().await;
        Ok(record)
    }

    async fn publish(&self) {
        if self.subscribers.is_empty() {
            return;
        }
        match self.storage.load_all().await {
            Ok(records) => self.subscribers.publish(&records),
            Err(e) => warn!("STORE: could not load {} set for subscribers: {}", D::KIND, e),
        }
    }
}

impl<S: EntityStorage<TaskData>> EntityStore<TaskData, S> {
    /// Marks a task done. Repeating tasks count the completion and move to
    /// their next occurrence instead of closing.
    pub async fn complete(&self, id: Uuid) -> SyncResult<Task> {
        let now = self.clock.now();
        self.modify(id, |task| {
            task.data.completed_at = Some(now);
            if task.data.is_repeating() {
                task.data.completed += 1;
                task.data.advance_schedule();
            } else {
                task.data.completed = 1;
                task.archived = true;
            }
        })
        .await
    }

    pub async fn uncomplete(&self, id: Uuid) -> SyncResult<Task> {
        self.modify(id, |task| {
            task.data.completed = 0;
            task.data.completed_at = None;
            task.archived = false;
        })
        .await
    }
}

impl<S: EntityStorage<CategoryData>> EntityStore<CategoryData, S> {
    /// The live default category, created blank if there is none.
    pub async fn default_category(&self) -> SyncResult<Category> {
        let existing = self
            .get_all(|c| c.data.is_default && !c.archived)
            .await?
            .into_iter()
            .next();
        if let Some(category) = existing {
            return Ok(category);
        }

        let data = CategoryData {
            is_default: true,
            ..Default::default()
        };
        self.create(Draft::new(data)).await
    }
}
