use super::RemoteStore;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tasksync_core::invite::{Invite, InviteStatus};
use tasksync_core::models::EntityKind;
use tasksync_core::protocol::{NewRemoteRecord, RemoteRecord};
use tasksync_core::{SyncError, SyncResult};
use tokio::sync::watch;
use uuid::Uuid;

/// In-process remote store shared by every device in a test or simulation.
///
/// Cloning shares the same documents. `set_online(false)` makes every call
/// fail with a transport error.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    records: Arc<DashMap<String, RemoteRecord>>,
    invites: Arc<DashMap<String, Invite>>,
    online: Arc<AtomicBool>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            records: Arc::new(DashMap::new()),
            invites: Arc::new(DashMap::new()),
            online: Arc::new(AtomicBool::new(true)),
            revision: Arc::new(revision),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Snapshot of every record, for assertions.
    pub fn records(&self) -> Vec<RemoteRecord> {
        let mut records: Vec<RemoteRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Snapshot of every invite, for assertions.
    pub fn invites(&self) -> Vec<Invite> {
        self.invites.iter().map(|i| i.value().clone()).collect()
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::transport("remote store unreachable"))
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

impl RemoteStore for MemoryRemoteStore {
    async fn query(&self, scope_keys: &[String]) -> SyncResult<Vec<RemoteRecord>> {
        self.ensure_online()?;
        let mut records: Vec<RemoteRecord> = self
            .records
            .iter()
            .filter(|r| scope_keys.contains(&r.scope_key))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn find(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        scope_key: &str,
    ) -> SyncResult<Option<RemoteRecord>> {
        self.ensure_online()?;
        Ok(self
            .records
            .iter()
            .find(|r| r.kind == kind && r.entity_id == entity_id && r.scope_key == scope_key)
            .map(|r| r.value().clone()))
    }

    async fn find_by_entity(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> SyncResult<Vec<RemoteRecord>> {
        self.ensure_online()?;
        Ok(self
            .records
            .iter()
            .filter(|r| r.kind == kind && r.entity_id == entity_id)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn insert(&self, record: NewRemoteRecord) -> SyncResult<RemoteRecord> {
        self.ensure_online()?;
        let record = record.with_id(Uuid::new_v4().to_string());
        self.records.insert(record.id.clone(), record.clone());
        self.bump();
        Ok(record)
    }

    async fn replace(&self, record: RemoteRecord) -> SyncResult<()> {
        self.ensure_online()?;
        if !self.records.contains_key(&record.id) {
            return Err(SyncError::InvalidState(format!(
                "remote record {} does not exist",
                record.id
            )));
        }
        self.records.insert(record.id.clone(), record);
        self.bump();
        Ok(())
    }

    async fn delete_scope(&self, scope_key: &str) -> SyncResult<usize> {
        self.ensure_online()?;
        let before = self.records.len();
        self.records.retain(|_, r| r.scope_key != scope_key);
        let removed = before - self.records.len();
        if removed > 0 {
            self.bump();
        }
        Ok(removed)
    }

    async fn invites_for(&self, email: &str) -> SyncResult<Vec<Invite>> {
        self.ensure_online()?;
        let mut invites: Vec<Invite> = self
            .invites
            .iter()
            .filter(|i| i.to == email || i.from == email)
            .map(|i| i.value().clone())
            .collect();
        invites.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(invites)
    }

    async fn put_invite(&self, invite: Invite) -> SyncResult<()> {
        self.ensure_online()?;
        self.invites.insert(invite.id.clone(), invite);
        self.bump();
        Ok(())
    }

    async fn set_invite_status(&self, invite_id: &str, status: InviteStatus) -> SyncResult<()> {
        self.ensure_online()?;
        match self.invites.get_mut(invite_id) {
            Some(mut invite) => invite.status = status,
            None => return Err(SyncError::not_found(EntityKind::Invite, invite_id)),
        }
        self.bump();
        Ok(())
    }

    async fn delete_invite(&self, invite_id: &str) -> SyncResult<()> {
        self.ensure_online()?;
        self.invites.remove(invite_id);
        self.bump();
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
