//! The remote document store the engine syncs against.
//!
//! The store is a dumb host for encrypted blobs and invite documents. It is
//! assumed unreliable: every call may fail with `SyncError::Transport`.

mod memory;

pub use memory::MemoryRemoteStore;

use std::future::Future;
use tasksync_core::invite::{Invite, InviteStatus};
use tasksync_core::models::EntityKind;
use tasksync_core::protocol::{NewRemoteRecord, RemoteRecord};
use tasksync_core::SyncResult;
use tokio::sync::watch;
use uuid::Uuid;

pub trait RemoteStore: Send + Sync + 'static {
    /// Every record whose `scope_key` is in `scope_keys`.
    fn query(
        &self,
        scope_keys: &[String],
    ) -> impl Future<Output = SyncResult<Vec<RemoteRecord>>> + Send;

    fn find(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        scope_key: &str,
    ) -> impl Future<Output = SyncResult<Option<RemoteRecord>>> + Send;

    /// Every record for an entity, across scopes.
    fn find_by_entity(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> impl Future<Output = SyncResult<Vec<RemoteRecord>>> + Send;

    fn insert(&self, record: NewRemoteRecord)
        -> impl Future<Output = SyncResult<RemoteRecord>> + Send;

    /// Full replace of an existing record, matched by `id`.
    fn replace(&self, record: RemoteRecord) -> impl Future<Output = SyncResult<()>> + Send;

    /// Physically deletes every record of a scope. Returns how many went.
    fn delete_scope(&self, scope_key: &str) -> impl Future<Output = SyncResult<usize>> + Send;

    /// Invites sent to or by `email`.
    fn invites_for(&self, email: &str) -> impl Future<Output = SyncResult<Vec<Invite>>> + Send;

    fn put_invite(&self, invite: Invite) -> impl Future<Output = SyncResult<()>> + Send;

    fn set_invite_status(
        &self,
        invite_id: &str,
        status: InviteStatus,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    fn delete_invite(&self, invite_id: &str) -> impl Future<Output = SyncResult<()>> + Send;

    /// Ticks whenever any document changes. Subscribers re-query the
    /// snapshot they care about.
    fn changes(&self) -> watch::Receiver<u64>;
}
