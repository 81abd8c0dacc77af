//! Push and pull between the local stores and the remote store.
//!
//! Push is entered only from locally originated mutations (and queue replay).
//! Pull writes through [`EntityStore::apply_remote`], which never pushes, so
//! the two paths cannot feed each other.
//!
//! Conflicts are resolved by whole-record last-writer-wins on `updated_at`.
//! There is no field-level merge: of two concurrent edits to the same entity
//! the older one is lost.

use crate::config::Identity;
use crate::connectivity::Connectivity;
use crate::events::SyncEvent;
use crate::notify::Notifier;
use crate::offline_queue::{PendingAction, PendingQueue, ReplaySummary};
use crate::remote::RemoteStore;
use crate::storage::{EntityStorage, Storage};
use crate::store::EntityStore;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tasksync_core::codec::{CiphertextFormat, Codec, KeyScope};
use tasksync_core::conflicts::{ConflictResolver, ReconcileOutcome, Resolution};
use tasksync_core::models::{
    Category, CategoryData, EntityData, EntityKind, Member, Record, Task, TaskData,
};
use tasksync_core::protocol::{
    NewRemoteRecord, NotificationKind, NotificationTemplate, RemoteRecord,
};
use tasksync_core::scope::SharingScope;
use tasksync_core::{SyncError, SyncResult};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const TOMBSTONE_MEMORY_CAPACITY: usize = 1024;

/// Entity kinds the engine can push.
pub trait Syncable: EntityData {
    /// Id of the category whose members share this record.
    fn scope_id(record: &Record<Self>) -> Option<Uuid>;

    /// Members carried by the record itself, when it defines a scope.
    fn members(_record: &Record<Self>) -> Option<&[Member]> {
        None
    }

    /// Human-readable name used in notifications.
    fn label(&self) -> &str;
}

impl Syncable for TaskData {
    fn scope_id(record: &Record<Self>) -> Option<Uuid> {
        record.data.category_id
    }

    fn label(&self) -> &str {
        &self.name
    }
}

impl Syncable for CategoryData {
    fn scope_id(record: &Record<Self>) -> Option<Uuid> {
        Some(record.id)
    }

    fn members(record: &Record<Self>) -> Option<&[Member]> {
        Some(&record.data.users)
    }

    fn label(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Not in a shared scope; nothing to push.
    Private,
    Inserted,
    Replaced,
    /// The remote copy already matches the local one.
    Unchanged,
    /// The remote copy was strictly newer and replaced the local one.
    AdoptedRemote,
    /// A remote tombstone exists; the local copy was removed.
    RemoteDeleted,
    /// Tombstones written for the entity's remote records.
    Tombstoned(usize),
    /// The task left its shared scope; tombstones written for its copies
    /// there.
    Retracted(usize),
    /// Remote records of a no-longer-shared scope were deleted.
    Collapsed(usize),
    /// Could not reach the remote store; waiting in the pending queue.
    Queued,
}

/// Completion channel of a push running in the background.
#[derive(Debug)]
pub struct PushHandle {
    kind: EntityKind,
    entity_id: Uuid,
    handle: JoinHandle<SyncResult<PushOutcome>>,
}

impl PushHandle {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn entity_id(&self) -> Uuid {
        self.entity_id
    }

    pub async fn wait(self) -> SyncResult<PushOutcome> {
        self.handle
            .await
            .map_err(|e| SyncError::InvalidState(format!("push task failed: {}", e)))?
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Local copy won or tied, or a tombstone for an already absent entity.
    pub unchanged: usize,
    /// Live copies ignored because a tombstone in their scope removed a copy
    /// at least as new.
    pub skipped_tombstoned: usize,
    /// Live copies left alone because a local change to the entity has not
    /// been pushed yet.
    pub deferred: usize,
    /// Records that could not be decoded or applied.
    pub failed: usize,
    /// Legacy ciphertexts re-encoded under their scope key.
    pub migrated: usize,
}

impl PullReport {
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Created => self.created += 1,
            ReconcileOutcome::Updated => self.updated += 1,
            ReconcileOutcome::Deleted => self.deleted += 1,
            ReconcileOutcome::AlreadyAbsent | ReconcileOutcome::ConflictNoop => {
                self.unchanged += 1
            }
        }
    }
}

/// What a push has to do, worked out from local state only.
enum PushTarget {
    Private,
    Task { task: Task, scope_key: String, scope: SharingScope },
    Category { category: Category },
    Tombstone(EntityKind, Uuid),
    Retract(Uuid),
    Collapse(Uuid),
}

type ScopedKey = (EntityKind, Uuid, String);

/// Local copies removed by remote tombstones, keyed by the tombstone's scope,
/// with the `updated_at` of the removed copy. A live copy in that scope is
/// stale unless strictly newer. Holds the most recent removals only; an
/// evicted entry's tombstone is still on the remote store.
#[derive(Default)]
struct TombstoneMemory {
    removed: HashMap<ScopedKey, DateTime<Utc>>,
    order: VecDeque<ScopedKey>,
}

impl TombstoneMemory {
    fn remember(&mut self, key: ScopedKey, updated_at: DateTime<Utc>) {
        if self.removed.insert(key.clone(), updated_at).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > TOMBSTONE_MEMORY_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.removed.remove(&evicted);
            }
        }
    }

    fn covers(&self, key: &ScopedKey, updated_at: DateTime<Utc>) -> bool {
        self.removed
            .get(key)
            .is_some_and(|removed| updated_at <= *removed)
    }

    fn forget(&mut self, key: &ScopedKey) {
        if self.removed.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.removed.len()
    }
}

pub struct SyncEngineParts<S: Storage, R> {
    pub tasks: Arc<EntityStore<TaskData, S>>,
    pub categories: Arc<EntityStore<CategoryData, S>>,
    pub remote: Arc<R>,
    pub queue: Arc<PendingQueue>,
    pub codec: Codec,
    pub identity: Identity,
    pub connectivity: Connectivity,
    pub notifier: Arc<dyn Notifier>,
}

pub struct SyncEngine<S: Storage, R: RemoteStore> {
    tasks: Arc<EntityStore<TaskData, S>>,
    categories: Arc<EntityStore<CategoryData, S>>,
    remote: Arc<R>,
    queue: Arc<PendingQueue>,
    codec: Codec,
    identity: Identity,
    connectivity: Connectivity,
    notifier: Arc<dyn Notifier>,
    resolver: ConflictResolver,
    tombstones: Mutex<TombstoneMemory>,
    /// Local deletes whose tombstones are being written right now.
    deleting: Mutex<HashSet<(EntityKind, Uuid)>>,
    events: broadcast::Sender<SyncEvent>,
}

impl<S: Storage, R: RemoteStore> SyncEngine<S, R> {
    pub fn new(parts: SyncEngineParts<S, R>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tasks: parts.tasks,
            categories: parts.categories,
            remote: parts.remote,
            queue: parts.queue,
            codec: parts.codec,
            identity: parts.identity,
            connectivity: parts.connectivity,
            notifier: parts.notifier,
            resolver: ConflictResolver::new(),
            tombstones: Mutex::new(TombstoneMemory::default()),
            deleting: Mutex::new(HashSet::new()),
            events,
        }
    }

    pub fn tasks(&self) -> &Arc<EntityStore<TaskData, S>> {
        &self.tasks
    }

    pub fn categories(&self) -> &Arc<EntityStore<CategoryData, S>> {
        &self.categories
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// The sharing scope a category defines, from the local user's view.
    pub fn scope_of(&self, category: &Category) -> SharingScope {
        SharingScope::normalized(category.data.users.clone(), &self.identity.email)
    }

    // ---- push ----

    /// Pushes the current local state of an entity. Transport failures queue
    /// the entity and return `Queued`; they are never raised.
    pub async fn push(&self, kind: EntityKind, entity_id: Uuid) -> SyncResult<PushOutcome> {
        self.push_with(kind, entity_id, PendingAction::Push).await
    }

    /// Pushes with an explicit intent. `Retract` also removes a task that is
    /// private now from the scopes it left; `Collapse` deletes the scope of a
    /// category that is private now.
    pub async fn push_with(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        action: PendingAction,
    ) -> SyncResult<PushOutcome> {
        let target = self.resolve_target(kind, entity_id, action).await?;
        self.run_target(kind, entity_id, action, target).await
    }

    /// Writes tombstones for a record that was just deleted locally and tells
    /// the rest of its scope.
    pub async fn push_deleted<D: Syncable>(&self, record: &Record<D>) -> SyncResult<PushOutcome> {
        let scope = match D::members(record) {
            Some(members) => SharingScope::normalized(members.to_vec(), &self.identity.email),
            None => match D::scope_id(record) {
                Some(category_id) => self.category_scope(category_id).await?,
                None => SharingScope::private(),
            },
        };
        if !scope.is_shared() {
            return Ok(PushOutcome::Private);
        }

        let key = (D::KIND, record.id);
        self.set_deleting(key, true);
        let outcome = self
            .run_target(
                D::KIND,
                record.id,
                PendingAction::Push,
                PushTarget::Tombstone(D::KIND, record.id),
            )
            .await;
        self.set_deleting(key, false);
        let outcome = outcome?;

        if D::KIND == EntityKind::Task {
            let template = self
                .template(NotificationKind::TaskDeleted)
                .with("task_name", record.data.label())
                .with(
                    "category_id",
                    D::scope_id(record).map(|id| id.to_string()).unwrap_or_default(),
                );
            self.notify(&scope.recipients(&self.identity.email), &template);
        }
        Ok(outcome)
    }

    /// Pushes in the background. The handle reports the outcome.
    pub fn schedule_push(self: &Arc<Self>, kind: EntityKind, entity_id: Uuid) -> PushHandle {
        self.schedule_push_with(kind, entity_id, PendingAction::Push)
    }

    pub fn schedule_push_with(
        self: &Arc<Self>,
        kind: EntityKind,
        entity_id: Uuid,
        action: PendingAction,
    ) -> PushHandle {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = engine.push_with(kind, entity_id, action).await;
            if let Err(e) = &result {
                warn!("SYNC: background push of {} {} failed: {}", kind, entity_id, e);
            }
            result
        });
        PushHandle {
            kind,
            entity_id,
            handle,
        }
    }

    pub fn schedule_push_deleted<D: Syncable>(self: &Arc<Self>, record: Record<D>) -> PushHandle {
        let engine = Arc::clone(self);
        let (kind, entity_id) = (D::KIND, record.id);
        let handle = tokio::spawn(async move {
            let result = engine.push_deleted(&record).await;
            if let Err(e) = &result {
                warn!("SYNC: background delete of {} {} failed: {}", kind, entity_id, e);
            }
            result
        });
        PushHandle {
            kind,
            entity_id,
            handle,
        }
    }

    pub fn schedule_collapse(self: &Arc<Self>, category_id: Uuid) -> PushHandle {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = engine.collapse_scope(category_id).await;
            if let Err(e) = &result {
                warn!("SYNC: background collapse of {} failed: {}", category_id, e);
            }
            result
        });
        PushHandle {
            kind: EntityKind::Category,
            entity_id: category_id,
            handle,
        }
    }

    /// Pushes a category and every task in it, e.g. when it becomes shared.
    pub async fn push_scope(&self, category_id: Uuid) -> SyncResult<Vec<PushOutcome>> {
        let mut outcomes = vec![self.push(EntityKind::Category, category_id).await?];
        let tasks = self
            .tasks
            .get_all(|t| t.data.category_id == Some(category_id))
            .await?;
        for task in tasks {
            outcomes.push(self.push(EntityKind::Task, task.id).await?);
        }
        Ok(outcomes)
    }

    /// Deletes every remote record of a category's scope: the category itself
    /// and all tasks in it. Idempotent.
    pub async fn collapse_scope(&self, category_id: Uuid) -> SyncResult<PushOutcome> {
        self.run_target(
            EntityKind::Category,
            category_id,
            PendingAction::Collapse,
            PushTarget::Collapse(category_id),
        )
        .await
    }

    async fn run_target(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        action: PendingAction,
        target: PushTarget,
    ) -> SyncResult<PushOutcome> {
        if matches!(target, PushTarget::Private) {
            return Ok(PushOutcome::Private);
        }
        if !self.connectivity.is_online() {
            return self.queue_push(kind, entity_id, action, "offline").await;
        }
        match self.execute(target).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_transient() => {
                self.queue_push(kind, entity_id, action, &e.to_string())
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn queue_push(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        action: PendingAction,
        reason: &str,
    ) -> SyncResult<PushOutcome> {
        self.queue.enqueue_action(kind, entity_id, action).await?;
        debug!("SYNC: queued {} of {} {} ({})", action, kind, entity_id, reason);
        self.emit(SyncEvent::Queued {
            kind,
            entity_id,
            reason: reason.to_string(),
        });
        Ok(PushOutcome::Queued)
    }

    /// Works out what a push has to do from local state and the recorded
    /// intent. A private entity is left alone unless the intent says
    /// otherwise.
    async fn resolve_target(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        action: PendingAction,
    ) -> SyncResult<PushTarget> {
        match kind {
            EntityKind::Task => {
                let Some(task) = self.tasks.find(entity_id).await? else {
                    return Ok(PushTarget::Tombstone(kind, entity_id));
                };
                let shared = match task.data.category_id {
                    Some(category_id) => {
                        let scope = self.category_scope(category_id).await?;
                        scope.is_shared().then_some((category_id, scope))
                    }
                    None => None,
                };
                Ok(match shared {
                    Some((category_id, scope)) => PushTarget::Task {
                        task,
                        scope_key: category_id.to_string(),
                        scope,
                    },
                    None if action == PendingAction::Retract => PushTarget::Retract(entity_id),
                    None => PushTarget::Private,
                })
            }
            EntityKind::Category => {
                let Some(category) = self.categories.find(entity_id).await? else {
                    return Ok(PushTarget::Tombstone(kind, entity_id));
                };
                Ok(if self.scope_of(&category).is_shared() {
                    PushTarget::Category { category }
                } else if action == PendingAction::Collapse {
                    PushTarget::Collapse(entity_id)
                } else {
                    PushTarget::Private
                })
            }
            EntityKind::Invite => Ok(PushTarget::Private),
        }
    }

    async fn execute(&self, target: PushTarget) -> SyncResult<PushOutcome> {
        match target {
            PushTarget::Private => Ok(PushOutcome::Private),
            PushTarget::Task {
                task,
                scope_key,
                scope,
            } => {
                // One record per scope; copies outside the current scope are
                // left over from a move
                let (current, elsewhere): (Vec<_>, Vec<_>) = self
                    .remote
                    .find_by_entity(EntityKind::Task, task.id)
                    .await?
                    .into_iter()
                    .partition(|r| r.scope_key == scope_key);
                let moved = elsewhere.iter().any(|r| !r.deleted);
                let existing = current.into_iter().next();

                let outcome = self
                    .push_record(self.tasks.as_ref(), &task, &scope_key, existing, moved)
                    .await?;
                if matches!(
                    outcome,
                    PushOutcome::Inserted | PushOutcome::Replaced | PushOutcome::Unchanged
                ) {
                    let retracted = self.tombstone_records(elsewhere).await?;
                    if retracted > 0 {
                        info!(
                            "SYNC: task {} moved to scope {}, retracted {} old record(s)",
                            task.id, scope_key, retracted
                        );
                    }
                }

                let kind = match outcome {
                    PushOutcome::Inserted => Some(NotificationKind::NewTask),
                    PushOutcome::Replaced => Some(NotificationKind::TaskUpdated),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let template = self
                        .template(kind)
                        .with("task_name", task.data.name.clone())
                        .with("category_id", scope_key.clone());
                    self.notify(&scope.recipients(&self.identity.email), &template);
                }
                Ok(outcome)
            }
            PushTarget::Category { category } => {
                let scope_key = category.id.to_string();
                let existing = self
                    .remote
                    .find(EntityKind::Category, category.id, &scope_key)
                    .await?;
                self.push_record(self.categories.as_ref(), &category, &scope_key, existing, false)
                    .await
            }
            PushTarget::Tombstone(kind, entity_id) => self.push_tombstone(kind, entity_id).await,
            PushTarget::Retract(task_id) => {
                let records = self.remote.find_by_entity(EntityKind::Task, task_id).await?;
                let retracted = self.tombstone_records(records).await?;
                if retracted > 0 {
                    info!("SYNC: task {} went private, retracted {} record(s)", task_id, retracted);
                    self.emit(SyncEvent::Tombstoned {
                        kind: EntityKind::Task,
                        entity_id: task_id,
                    });
                }
                Ok(PushOutcome::Retracted(retracted))
            }
            PushTarget::Collapse(category_id) => {
                let scope_key = category_id.to_string();
                let removed = self.remote.delete_scope(&scope_key).await?;
                info!("SYNC: collapsed scope {} ({} remote record(s))", scope_key, removed);
                self.emit(SyncEvent::ScopeCollapsed { scope_key, removed });
                Ok(PushOutcome::Collapsed(removed))
            }
        }
    }

    /// Writes `record` into `scope_key`. A tombstone there means the entity
    /// was deleted, unless `reviving`: the entity is live in another scope and
    /// is moving back.
    async fn push_record<D: EntityData>(
        &self,
        store: &EntityStore<D, S>,
        record: &Record<D>,
        scope_key: &str,
        existing: Option<RemoteRecord>,
        reviving: bool,
    ) -> SyncResult<PushOutcome>
    where
        S: EntityStorage<D>,
    {
        let key_scope = KeyScope::shared(scope_key);

        let Some(existing) = existing else {
            let data = self.codec.encode(record, &key_scope)?;
            self.remote
                .insert(NewRemoteRecord {
                    kind: D::KIND,
                    entity_id: record.id,
                    scope_key: scope_key.to_string(),
                    data,
                    deleted: false,
                })
                .await?;
            debug!("SYNC: inserted remote {} {}", D::KIND, record.id);
            self.emit(SyncEvent::Pushed {
                kind: D::KIND,
                entity_id: record.id,
            });
            return Ok(PushOutcome::Inserted);
        };

        if existing.deleted && !reviving {
            self.remember_removal(&existing, record.updated_at);
            store.remove_remote(record.id).await?;
            info!("SYNC: {} {} was deleted remotely, dropping local copy", D::KIND, record.id);
            return Ok(PushOutcome::RemoteDeleted);
        }

        if !existing.deleted {
            match self
                .codec
                .decode_with_format::<Record<D>>(&existing.data, &key_scope)
            {
                Ok((remote, format)) => {
                    if remote == *record && format != CiphertextFormat::Legacy {
                        return Ok(PushOutcome::Unchanged);
                    }
                    if self.resolver.resolve(record.updated_at, remote.updated_at)
                        == Resolution::RemoteWins
                    {
                        store.apply_remote(remote).await?;
                        info!("SYNC: remote {} {} is newer, adopted it", D::KIND, record.id);
                        return Ok(PushOutcome::AdoptedRemote);
                    }
                }
                Err(e) => {
                    warn!(
                        "SYNC: overwriting undecodable remote {} {}: {}",
                        D::KIND,
                        record.id,
                        e
                    );
                }
            }
        }

        let data = self.codec.encode(record, &key_scope)?;
        self.remote
            .replace(RemoteRecord {
                data,
                deleted: false,
                ..existing
            })
            .await?;
        debug!("SYNC: replaced remote {} {}", D::KIND, record.id);
        self.emit(SyncEvent::Pushed {
            kind: D::KIND,
            entity_id: record.id,
        });
        Ok(PushOutcome::Replaced)
    }

    async fn push_tombstone(&self, kind: EntityKind, entity_id: Uuid) -> SyncResult<PushOutcome> {
        let records = self.remote.find_by_entity(kind, entity_id).await?;
        let written = self.tombstone_records(records).await?;
        if written > 0 {
            debug!("SYNC: tombstoned {} {} in {} scope(s)", kind, entity_id, written);
            self.emit(SyncEvent::Tombstoned { kind, entity_id });
        }
        Ok(PushOutcome::Tombstoned(written))
    }

    /// Replaces every live record with an empty tombstone.
    async fn tombstone_records(&self, records: Vec<RemoteRecord>) -> SyncResult<usize> {
        let mut written = 0;
        for record in records.into_iter().filter(|r| !r.deleted) {
            self.remote
                .replace(RemoteRecord {
                    data: String::new(),
                    deleted: true,
                    ..record
                })
                .await?;
            written += 1;
        }
        Ok(written)
    }

    // ---- pull ----

    /// Fetches every record of the scopes the local user belongs to and
    /// reconciles them. Transport failure is returned; per-record failures
    /// are counted in the report.
    pub async fn pull(&self) -> SyncResult<PullReport> {
        let scope_keys = self.shared_scope_keys().await?;
        if scope_keys.is_empty() {
            return Ok(PullReport::default());
        }
        let records = self.remote.query(&scope_keys).await?;
        Ok(self.reconcile(records).await)
    }

    /// Applies a remote snapshot. Tombstones go first so a stale live copy in
    /// the same snapshot cannot resurrect the entity. Entities with a local
    /// change still waiting to be pushed are left alone; the push settles
    /// them.
    pub async fn reconcile(&self, records: Vec<RemoteRecord>) -> PullReport {
        let mut report = PullReport::default();
        let unpushed = self.unpushed().await;
        let (tombstones, live): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| r.deleted);

        for record in tombstones {
            let result = match record.kind {
                EntityKind::Task => self.reconcile_tombstone(self.tasks.as_ref(), &record).await,
                EntityKind::Category => {
                    self.reconcile_tombstone(self.categories.as_ref(), &record)
                        .await
                }
                EntityKind::Invite => continue,
            };
            self.account(&mut report, &record, result);
        }

        for record in live {
            if unpushed.contains(&(record.kind, record.entity_id)) {
                debug!("SYNC: {} {} has an unpushed local change", record.kind, record.entity_id);
                report.deferred += 1;
                continue;
            }
            let result = match record.kind {
                EntityKind::Task => {
                    self.reconcile_live(self.tasks.as_ref(), &record, &mut report)
                        .await
                }
                EntityKind::Category => {
                    self.reconcile_live(self.categories.as_ref(), &record, &mut report)
                        .await
                }
                EntityKind::Invite => continue,
            };
            match result {
                Ok(None) => {
                    debug!(
                        "SYNC: ignoring stale copy of deleted {} {}",
                        record.kind, record.entity_id
                    );
                    report.skipped_tombstoned += 1;
                }
                Ok(Some(outcome)) => self.account(&mut report, &record, Ok(outcome)),
                Err(e) => self.account(&mut report, &record, Err(e)),
            }
        }

        if report.applied() > 0 || report.failed > 0 {
            info!(
                "SYNC: pull applied {} change(s), {} failure(s)",
                report.applied(),
                report.failed
            );
        }
        self.emit(SyncEvent::PullCompleted {
            applied: report.applied(),
            failed: report.failed,
        });
        report
    }

    /// Removes the local copy only while it still belongs to the tombstone's
    /// scope. A copy that moved elsewhere is not affected.
    async fn reconcile_tombstone<D: Syncable>(
        &self,
        store: &EntityStore<D, S>,
        record: &RemoteRecord,
    ) -> SyncResult<ReconcileOutcome>
    where
        S: EntityStorage<D>,
    {
        let Some(local) = store.find(record.entity_id).await? else {
            return Ok(ReconcileOutcome::AlreadyAbsent);
        };
        let local_scope = D::scope_id(&local).map(|id| id.to_string());
        if local_scope.as_deref() != Some(record.scope_key.as_str()) {
            return Ok(ReconcileOutcome::ConflictNoop);
        }
        self.remember_removal(record, local.updated_at);
        store.remove_remote(record.entity_id).await
    }

    /// `Ok(None)` when the copy is no newer than one a tombstone in the same
    /// scope already removed.
    async fn reconcile_live<D: EntityData>(
        &self,
        store: &EntityStore<D, S>,
        record: &RemoteRecord,
        report: &mut PullReport,
    ) -> SyncResult<Option<ReconcileOutcome>>
    where
        S: EntityStorage<D>,
    {
        let key_scope = KeyScope::shared(&record.scope_key);
        let (decoded, format) = self
            .codec
            .decode_with_format::<Record<D>>(&record.data, &key_scope)?;
        if decoded.id != record.entity_id {
            return Err(SyncError::Decode(format!(
                "payload id {} does not match entity {}",
                decoded.id, record.entity_id
            )));
        }
        if !self.accept_after_removal(record, decoded.updated_at) {
            return Ok(None);
        }

        if format == CiphertextFormat::Legacy && self.migrate_record(record, &decoded).await {
            report.migrated += 1;
        }
        store.apply_remote(decoded).await.map(Some)
    }

    /// Best effort: failures are logged and the legacy record stays readable.
    async fn migrate_record<D: EntityData>(
        &self,
        record: &RemoteRecord,
        decoded: &Record<D>,
    ) -> bool {
        let key_scope = KeyScope::shared(&record.scope_key);
        let result = async {
            let data = self.codec.encode(decoded, &key_scope)?;
            self.remote
                .replace(RemoteRecord {
                    data,
                    ..record.clone()
                })
                .await
        }
        .await;
        match result {
            Ok(()) => {
                debug!("CODEC: migrated remote record {} to scope key", record.id);
                true
            }
            Err(e) => {
                warn!("CODEC: could not migrate remote record {}: {}", record.id, e);
                false
            }
        }
    }

    fn account(
        &self,
        report: &mut PullReport,
        record: &RemoteRecord,
        result: SyncResult<ReconcileOutcome>,
    ) {
        match result {
            Ok(outcome) => {
                report.record(outcome);
                if outcome.wrote() {
                    self.emit(SyncEvent::Reconciled {
                        kind: record.kind,
                        entity_id: record.entity_id,
                        outcome,
                    });
                }
            }
            Err(e) => {
                warn!("SYNC: skipping remote record {}: {}", record.id, e);
                report.failed += 1;
                self.emit(SyncEvent::DecodeFailed {
                    record_id: record.id.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    async fn shared_scope_keys(&self) -> SyncResult<Vec<String>> {
        let categories = self.categories.get_all(|_| true).await?;
        Ok(categories
            .iter()
            .filter(|c| self.scope_of(c).is_shared())
            .map(|c| c.id.to_string())
            .collect())
    }

    // ---- pending queue ----

    /// Re-runs the push path for every queued entity. Does nothing while
    /// offline.
    pub async fn replay_pending(&self) -> SyncResult<ReplaySummary> {
        if !self.connectivity.is_online() {
            debug!("SYNC: offline, replay skipped");
            return Ok(ReplaySummary::default());
        }

        let summary = self
            .queue
            .replay(move |entry| async move {
                let target = self
                    .resolve_target(entry.kind, entry.entity_id, entry.action)
                    .await?;
                self.execute(target).await.map(|_| ())
            })
            .await?;

        let remaining = self.queue.len().await?;
        self.emit(SyncEvent::ReplayCompleted {
            succeeded: summary.succeeded,
            remaining,
        });
        Ok(summary)
    }

    /// Replays on every tick while online and immediately on each
    /// offline-to-online transition.
    pub fn spawn_replay_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut online = self.connectivity.watch();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !engine.connectivity.is_online() {
                            continue;
                        }
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online.borrow_and_update() {
                            continue;
                        }
                        info!("SYNC: back online, replaying pending pushes");
                    }
                }
                if let Err(e) = engine.replay_pending().await {
                    warn!("SYNC: replay failed: {}", e);
                }
            }
        })
    }

    /// Pulls once, then again whenever the remote store reports a change.
    pub fn spawn_pull_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut changes = self.remote.changes();
        tokio::spawn(async move {
            loop {
                if engine.connectivity.is_online() {
                    if let Err(e) = engine.pull().await {
                        warn!("SYNC: pull failed: {}", e);
                    }
                }
                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    // ---- helpers ----

    /// Confirmed members of a category's scope other than the local user.
    pub async fn recipients_for(&self, category_id: Uuid) -> SyncResult<Vec<String>> {
        Ok(self
            .category_scope(category_id)
            .await?
            .recipients(&self.identity.email))
    }

    /// Scope of a local category; private if the category is unknown.
    pub async fn category_scope(&self, category_id: Uuid) -> SyncResult<SharingScope> {
        Ok(match self.categories.find(category_id).await? {
            Some(category) => self.scope_of(&category),
            None => SharingScope::private(),
        })
    }

    pub fn template(&self, kind: NotificationKind) -> NotificationTemplate {
        NotificationTemplate::new(kind).with("sender_name", self.identity.display_name.clone())
    }

    /// Fire-and-forget; failures are logged.
    pub fn notify(&self, recipients: &[String], template: &NotificationTemplate) {
        if recipients.is_empty() {
            return;
        }
        if let Err(e) = self.notifier.notify(recipients, template) {
            warn!("SYNC: notification {} failed: {}", template.kind, e);
        }
    }

    /// Entities with a queued push or a delete in flight.
    async fn unpushed(&self) -> HashSet<(EntityKind, Uuid)> {
        let mut unpushed: HashSet<_> = match self.queue.pending().await {
            Ok(entries) => entries.into_iter().map(|e| (e.kind, e.entity_id)).collect(),
            Err(e) => {
                warn!("SYNC: could not read pending queue: {}", e);
                HashSet::new()
            }
        };
        if let Ok(deleting) = self.deleting.lock() {
            unpushed.extend(deleting.iter().copied());
        }
        unpushed
    }

    fn set_deleting(&self, key: (EntityKind, Uuid), deleting: bool) {
        if let Ok(mut set) = self.deleting.lock() {
            if deleting {
                set.insert(key);
            } else {
                set.remove(&key);
            }
        }
    }

    fn remember_removal(&self, tombstone: &RemoteRecord, updated_at: DateTime<Utc>) {
        if let Ok(mut memory) = self.tombstones.lock() {
            let key = (tombstone.kind, tombstone.entity_id, tombstone.scope_key.clone());
            memory.remember(key, updated_at);
        }
    }

    /// False for a copy no newer than one removed by a tombstone in its
    /// scope. A newer copy clears that entry.
    fn accept_after_removal(&self, record: &RemoteRecord, updated_at: DateTime<Utc>) -> bool {
        let Ok(mut memory) = self.tombstones.lock() else {
            return true;
        };
        let key = (record.kind, record.entity_id, record.scope_key.clone());
        if memory.covers(&key, updated_at) {
            return false;
        }
        memory.forget(&key);
        true
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn key(n: u128) -> ScopedKey {
        (EntityKind::Task, Uuid::from_u128(n), "scope".to_string())
    }

    #[test]
    fn test_memory_covers_only_copies_no_newer_than_removed() {
        let removed_at = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let mut memory = TombstoneMemory::default();
        memory.remember(key(1), removed_at);

        assert!(memory.covers(&key(1), removed_at));
        assert!(memory.covers(&key(1), removed_at - Duration::seconds(1)));
        assert!(!memory.covers(&key(1), removed_at + Duration::seconds(1)));

        let mut elsewhere = key(1);
        elsewhere.2 = "other".to_string();
        assert!(!memory.covers(&elsewhere, removed_at));

        memory.forget(&key(1));
        assert!(!memory.covers(&key(1), removed_at));
        assert_eq!(memory.len(), 0);
    }

    #[test]
    fn test_memory_evicts_oldest_beyond_capacity() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let mut memory = TombstoneMemory::default();
        for n in 0..(TOMBSTONE_MEMORY_CAPACITY as u128 + 10) {
            memory.remember(key(n), at);
        }
        assert_eq!(memory.len(), TOMBSTONE_MEMORY_CAPACITY);
        assert!(!memory.covers(&key(0), at));
        assert!(memory.covers(&key(TOMBSTONE_MEMORY_CAPACITY as u128 + 9), at));
    }
}
