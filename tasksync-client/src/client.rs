use crate::config::{Identity, SyncConfig};
use crate::connectivity::Connectivity;
use crate::events::{Callback, Filter, Subscription, SyncEvent};
use crate::invites::{InviteProcessor, InviteReport};
use crate::notify::{LogNotifier, Notifier};
use crate::offline_queue::{PendingAction, PendingQueue};
use crate::remote::RemoteStore;
use crate::storage::{MemoryStorage, SqliteStorage, Storage};
use crate::store::EntityStore;
use crate::sync_engine::{PullReport, PushHandle, PushOutcome, SyncEngine, SyncEngineParts};
use std::sync::{Arc, Mutex};
use tasksync_core::clock::{Clock, SystemClock};
use tasksync_core::codec::Codec;
use tasksync_core::invite::Invite;
use tasksync_core::models::{Category, CategoryData, Draft, EntityKind, Task, TaskData};
use tasksync_core::SyncResult;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// A committed local mutation plus the background pushes it started.
///
/// The local write has already succeeded; the pushes only report how the
/// remote side went and never undo it.
#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,
    pub pushes: Vec<PushHandle>,
}

impl<T> Committed<T> {
    fn new(value: T, pushes: Vec<PushHandle>) -> Self {
        Self { value, pushes }
    }

    /// Waits for every push to finish.
    pub async fn settle(self) -> SyncResult<(T, Vec<PushOutcome>)> {
        let mut outcomes = Vec::with_capacity(self.pushes.len());
        for push in self.pushes {
            outcomes.push(push.wait().await?);
        }
        Ok((self.value, outcomes))
    }
}

pub struct ClientBuilder<R: RemoteStore> {
    identity: Identity,
    remote: Arc<R>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    connectivity: Connectivity,
}

impl<R: RemoteStore> ClientBuilder<R> {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Everything in memory. Nothing survives the process.
    pub fn build_in_memory(self) -> Client<MemoryStorage, R> {
        let queue = PendingQueue::in_memory(self.clock.clone());
        self.build_with(MemoryStorage::new(), queue)
    }

    /// Opens (and migrates) the SQLite database named by the config. Entities
    /// and the pending queue share the pool.
    pub async fn open(self) -> SyncResult<Client<SqliteStorage, R>> {
        let storage = SqliteStorage::connect(&self.config.database_url).await?;
        let queue = PendingQueue::with_pool(storage.pool().clone(), self.clock.clone());
        Ok(self.build_with(storage, queue))
    }

    pub fn build_with<S: Storage>(self, storage: S, queue: PendingQueue) -> Client<S, R> {
        let tasks = Arc::new(EntityStore::new(storage.clone(), self.clock.clone()));
        let categories = Arc::new(EntityStore::new(storage, self.clock.clone()));
        let engine = Arc::new(SyncEngine::new(SyncEngineParts {
            tasks,
            categories,
            remote: self.remote,
            queue: Arc::new(queue),
            codec: Codec::new(&self.config.legacy_key),
            identity: self.identity,
            connectivity: self.connectivity,
            notifier: self.notifier,
        }));
        let invites = Arc::new(InviteProcessor::new(
            engine.clone(),
            self.clock,
            &self.config,
        ));
        Client {
            engine,
            invites,
            config: self.config,
            background: Mutex::new(Vec::new()),
        }
    }
}

/// Application bootstrap: owns the stores, the engine, the invite processor
/// and their background loops.
pub struct Client<S: Storage, R: RemoteStore> {
    engine: Arc<SyncEngine<S, R>>,
    invites: Arc<InviteProcessor<S, R>>,
    config: SyncConfig,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: RemoteStore> Client<MemoryStorage, R> {
    pub fn builder(identity: Identity, remote: Arc<R>) -> ClientBuilder<R> {
        ClientBuilder {
            identity,
            remote,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
            connectivity: Connectivity::default(),
        }
    }
}

impl<S: Storage, R: RemoteStore> Client<S, R> {
    pub fn engine(&self) -> &Arc<SyncEngine<S, R>> {
        &self.engine
    }

    pub fn invites(&self) -> &Arc<InviteProcessor<S, R>> {
        &self.invites
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn tasks_store(&self) -> &Arc<EntityStore<TaskData, S>> {
        self.engine.tasks()
    }

    pub fn categories_store(&self) -> &Arc<EntityStore<CategoryData, S>> {
        self.engine.categories()
    }

    pub fn connectivity(&self) -> &Connectivity {
        self.engine.connectivity()
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.engine.connectivity().set_online(online)
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe_events()
    }

    /// Starts queue replay, remote pulls and invite refreshes.
    pub fn start(&self) {
        let handles = vec![
            self.engine.spawn_replay_loop(self.config.replay_interval()),
            self.engine.spawn_pull_loop(),
            self.invites.spawn_refresh_loop(),
        ];
        if let Ok(mut background) = self.background.lock() {
            background.extend(handles);
        }
        info!("CLIENT: background sync started for {}", self.engine.identity().email);
    }

    pub fn shutdown(&self) {
        if let Ok(mut background) = self.background.lock() {
            for handle in background.drain(..) {
                handle.abort();
            }
        }
    }

    /// One foreground round: replay queued pushes, pull, then process invites.
    pub async fn sync_now(&self) -> SyncResult<PullReport> {
        self.engine.replay_pending().await?;
        let report = self.engine.pull().await?;
        self.invites.refresh().await?;
        Ok(report)
    }

    // ---- tasks ----

    pub async fn create_task(&self, data: TaskData) -> SyncResult<Committed<Task>> {
        let task = self.tasks_store().create(Draft::new(data)).await?;
        let push = self.engine.schedule_push(EntityKind::Task, task.id);
        Ok(Committed::new(task, vec![push]))
    }

    pub async fn task(&self, id: Uuid) -> SyncResult<Task> {
        self.tasks_store().get(id).await
    }

    pub async fn tasks<F>(&self, filter: F) -> SyncResult<Vec<Task>>
    where
        F: Fn(&Task) -> bool,
    {
        self.tasks_store().get_all(filter).await
    }

    /// Edits a task. Moving it out of a shared category retracts its copy
    /// there, even when the new category is private.
    pub async fn update_task<F>(&self, id: Uuid, edit: F) -> SyncResult<Committed<Task>>
    where
        F: FnOnce(&mut TaskData),
    {
        let previous = self.tasks_store().get(id).await?.data.category_id;
        let task = self.tasks_store().update(id, edit).await?;
        let left_shared = match previous {
            Some(category_id) if task.data.category_id != previous => {
                self.engine.category_scope(category_id).await?.is_shared()
            }
            _ => false,
        };
        let action = if left_shared {
            PendingAction::Retract
        } else {
            PendingAction::Push
        };
        let push = self.engine.schedule_push_with(EntityKind::Task, task.id, action);
        Ok(Committed::new(task, vec![push]))
    }

    pub async fn complete_task(&self, id: Uuid) -> SyncResult<Committed<Task>> {
        let task = self.tasks_store().complete(id).await?;
        let push = self.engine.schedule_push(EntityKind::Task, task.id);
        Ok(Committed::new(task, vec![push]))
    }

    pub async fn uncomplete_task(&self, id: Uuid) -> SyncResult<Committed<Task>> {
        let task = self.tasks_store().uncomplete(id).await?;
        let push = self.engine.schedule_push(EntityKind::Task, task.id);
        Ok(Committed::new(task, vec![push]))
    }

    /// Deletes tasks and returns them so the caller can drop attachments
    /// (`photo_ids`).
    pub async fn delete_tasks(&self, ids: &[Uuid]) -> SyncResult<Committed<Vec<Task>>> {
        let removed = self.tasks_store().delete(ids).await?;
        let pushes = removed
            .iter()
            .map(|task| self.engine.schedule_push_deleted(task.clone()))
            .collect();
        Ok(Committed::new(removed, pushes))
    }

    pub async fn subscribe_tasks(
        &self,
        filter: Filter<TaskData>,
        callback: Callback<TaskData>,
    ) -> SyncResult<Subscription> {
        self.tasks_store().subscribe(filter, callback).await
    }

    // ---- categories ----

    pub async fn create_category(&self, data: CategoryData) -> SyncResult<Committed<Category>> {
        let category = self.categories_store().create(Draft::new(data)).await?;
        let push = self.engine.schedule_push(EntityKind::Category, category.id);
        Ok(Committed::new(category, vec![push]))
    }

    pub async fn default_category(&self) -> SyncResult<Category> {
        self.categories_store().default_category().await
    }

    pub async fn categories<F>(&self, filter: F) -> SyncResult<Vec<Category>>
    where
        F: Fn(&Category) -> bool,
    {
        self.categories_store().get_all(filter).await
    }

    /// Edits a category. A change that unshares it collapses its scope; a
    /// change that shares it pushes the category and its tasks.
    pub async fn update_category<F>(&self, id: Uuid, edit: F) -> SyncResult<Committed<Category>>
    where
        F: FnOnce(&mut CategoryData),
    {
        let store = self.categories_store();
        let before = self.engine.scope_of(&store.get(id).await?).is_shared();
        let category = store.update(id, edit).await?;
        let after = self.engine.scope_of(&category).is_shared();

        let pushes = match (before, after) {
            (true, false) => vec![self.engine.schedule_collapse(id)],
            (false, true) => {
                let mut pushes = vec![self.engine.schedule_push(EntityKind::Category, id)];
                for task in self.tasks(|t| t.data.category_id == Some(id)).await? {
                    pushes.push(self.engine.schedule_push(EntityKind::Task, task.id));
                }
                pushes
            }
            _ => vec![self.engine.schedule_push(EntityKind::Category, id)],
        };
        Ok(Committed::new(category, pushes))
    }

    pub async fn delete_categories(&self, ids: &[Uuid]) -> SyncResult<Committed<Vec<Category>>> {
        let removed = self.categories_store().delete(ids).await?;
        let pushes = removed
            .iter()
            .map(|category| self.engine.schedule_push_deleted(category.clone()))
            .collect();
        Ok(Committed::new(removed, pushes))
    }

    // ---- invites ----

    pub async fn send_invite(&self, category_id: Uuid, to: &str) -> SyncResult<Invite> {
        self.invites.send_invite(category_id, to).await
    }

    pub async fn respond_to_invite(
        &self,
        invite_id: &str,
        accept: bool,
    ) -> SyncResult<Option<PullReport>> {
        self.invites.respond(invite_id, accept).await
    }

    pub async fn leave_category(&self, category_id: Uuid) -> SyncResult<()> {
        self.invites.leave(category_id).await
    }

    pub async fn refresh_invites(&self) -> SyncResult<InviteReport> {
        self.invites.refresh().await
    }

    pub fn pending_invites(&self) -> Vec<Invite> {
        self.invites.pending_invites()
    }
}

impl<S: Storage, R: RemoteStore> Drop for Client<S, R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
