//! Storage engines behind [`EntityStore`](crate::store::EntityStore).
//!
//! One generic trait, implemented once per engine. Engines persist full
//! records as JSON keyed by `(kind, id)` and never interpret them.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use std::future::Future;
use tasksync_core::models::{CategoryData, EntityData, Record, TaskData};
use tasksync_core::SyncResult;
use uuid::Uuid;

pub trait EntityStorage<D: EntityData>: Send + Sync + 'static {
    fn load(&self, id: Uuid) -> impl Future<Output = SyncResult<Option<Record<D>>>> + Send;

    fn load_all(&self) -> impl Future<Output = SyncResult<Vec<Record<D>>>> + Send;

    /// Insert or fully replace.
    fn save(&self, record: &Record<D>) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns the removed record, or `None` if it was absent.
    fn remove(&self, id: Uuid) -> impl Future<Output = SyncResult<Option<Record<D>>>> + Send;
}

/// An engine that can hold every synced entity kind.
pub trait Storage: EntityStorage<TaskData> + EntityStorage<CategoryData> + Clone {}

impl<T> Storage for T where T: EntityStorage<TaskData> + EntityStorage<CategoryData> + Clone {}
