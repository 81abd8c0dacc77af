use crate::queries::{DbHelpers, Queries};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::sync::{Arc, Mutex};
use strum::{Display, EnumString};
use tasksync_core::clock::Clock;
use tasksync_core::models::EntityKind;
use tasksync_core::{SyncError, SyncResult};
use uuid::Uuid;

/// What a replay must do for a queued entity. Local state alone cannot tell
/// a collapse or a retraction apart from a plain push of a private entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PendingAction {
    /// Push the current local state; a no-op if it is private by then.
    #[default]
    Push,
    /// A task left a shared scope: remove its copies from other scopes even
    /// if it is private now.
    Retract,
    /// A category stopped being shared: delete its whole scope.
    Collapse,
}

/// An entity whose push has not reached the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub kind: EntityKind,
    pub entity_id: Uuid,
    pub action: PendingAction,
    pub enqueued_at: DateTime<Utc>,
    /// Failed replays so far.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub succeeded: usize,
    pub failed: usize,
}

enum Backend {
    Memory(Mutex<Vec<PendingEntry>>),
    Sqlite(SqlitePool),
}

/// De-duplicated set of entities pending push, replayed in enqueue order.
pub struct PendingQueue {
    backend: Backend,
    clock: Arc<dyn Clock>,
}

impl PendingQueue {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(Vec::new())),
            clock,
        }
    }

    /// Persists to the `pending_sync` table of an already migrated pool.
    pub fn with_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: Backend::Sqlite(pool),
            clock,
        }
    }

    /// Queues a plain push. Returns false if the entity was already queued.
    pub async fn enqueue(&self, kind: EntityKind, entity_id: Uuid) -> SyncResult<bool> {
        self.enqueue_action(kind, entity_id, PendingAction::Push).await
    }

    /// Queues an entity with the action its replay must run. An entry that is
    /// already queued keeps its place; a push never replaces another action,
    /// any other action replaces a queued push. Returns false if nothing
    /// changed.
    pub async fn enqueue_action(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        action: PendingAction,
    ) -> SyncResult<bool> {
        let now = self.clock.now();
        let changed = match &self.backend {
            Backend::Memory(entries) => {
                let mut entries = lock(entries)?;
                match entries
                    .iter_mut()
                    .find(|e| e.kind == kind && e.entity_id == entity_id)
                {
                    Some(entry) if action != PendingAction::Push && entry.action != action => {
                        entry.action = action;
                        true
                    }
                    Some(_) => false,
                    None => {
                        entries.push(PendingEntry {
                            kind,
                            entity_id,
                            action,
                            enqueued_at: now,
                            attempts: 0,
                        });
                        true
                    }
                }
            }
            Backend::Sqlite(pool) => {
                let result = sqlx::query(Queries::ENQUEUE_PENDING)
                    .bind(kind.to_string())
                    .bind(entity_id.to_string())
                    .bind(now.to_rfc3339())
                    .bind(action.to_string())
                    .execute(pool)
                    .await?;
                result.rows_affected() > 0
            }
        };
        if changed {
            tracing::debug!("QUEUE: enqueued {} of {} {}", action, kind, entity_id);
        }
        Ok(changed)
    }

    /// Returns false if the entity was not queued.
    pub async fn dequeue(&self, kind: EntityKind, entity_id: Uuid) -> SyncResult<bool> {
        match &self.backend {
            Backend::Memory(entries) => {
                let mut entries = lock(entries)?;
                let before = entries.len();
                entries.retain(|e| !(e.kind == kind && e.entity_id == entity_id));
                Ok(entries.len() != before)
            }
            Backend::Sqlite(pool) => {
                let result = sqlx::query(Queries::DEQUEUE_PENDING)
                    .bind(kind.to_string())
                    .bind(entity_id.to_string())
                    .execute(pool)
                    .await?;
                Ok(result.rows_affected() > 0)
            }
        }
    }

    pub async fn contains(&self, kind: EntityKind, entity_id: Uuid) -> SyncResult<bool> {
        match &self.backend {
            Backend::Memory(entries) => Ok(lock(entries)?
                .iter()
                .any(|e| e.kind == kind && e.entity_id == entity_id)),
            Backend::Sqlite(pool) => {
                let row = sqlx::query(Queries::COUNT_PENDING_ENTRY)
                    .bind(kind.to_string())
                    .bind(entity_id.to_string())
                    .fetch_one(pool)
                    .await?;
                let count: i64 = row.try_get("count")?;
                Ok(count > 0)
            }
        }
    }

    /// Entries in enqueue order, left in place.
    pub async fn pending(&self) -> SyncResult<Vec<PendingEntry>> {
        match &self.backend {
            Backend::Memory(entries) => Ok(lock(entries)?.clone()),
            Backend::Sqlite(pool) => {
                let rows = sqlx::query(Queries::GET_PENDING).fetch_all(pool).await?;
                let mut entries = Vec::with_capacity(rows.len());
                for row in rows {
                    let enqueued_at: String = row.try_get("enqueued_at")?;
                    let attempts: i64 = row.try_get("attempts")?;
                    entries.push(PendingEntry {
                        kind: DbHelpers::parse_kind(&row, "kind")?,
                        entity_id: DbHelpers::parse_uuid(&row, "entity_id")?,
                        action: DbHelpers::parse_action(&row, "action")?,
                        enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)?
                            .with_timezone(&Utc),
                        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
                    });
                }
                Ok(entries)
            }
        }
    }

    pub async fn len(&self) -> SyncResult<usize> {
        Ok(self.pending().await?.len())
    }

    pub async fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Removes and returns every entry.
    pub async fn drain(&self) -> SyncResult<Vec<PendingEntry>> {
        match &self.backend {
            Backend::Memory(entries) => Ok(std::mem::take(&mut *lock(entries)?)),
            Backend::Sqlite(pool) => {
                let entries = self.pending().await?;
                sqlx::query(Queries::CLEAR_PENDING).execute(pool).await?;
                Ok(entries)
            }
        }
    }

    /// Runs `push_fn` for every entry. Successes are dequeued; failures stay
    /// for the next cycle with their attempt count bumped.
    pub async fn replay<F, Fut>(&self, mut push_fn: F) -> SyncResult<ReplaySummary>
    where
        F: FnMut(PendingEntry) -> Fut,
        Fut: Future<Output = SyncResult<()>>,
    {
        let entries = self.pending().await?;
        let mut summary = ReplaySummary::default();

        for entry in entries {
            let (kind, entity_id) = (entry.kind, entry.entity_id);
            match push_fn(entry).await {
                Ok(()) => {
                    self.dequeue(kind, entity_id).await?;
                    summary.succeeded += 1;
                }
                Err(e) => {
                    tracing::warn!("QUEUE: replay of {} {} failed: {}", kind, entity_id, e);
                    self.record_failure(kind, entity_id).await?;
                    summary.failed += 1;
                }
            }
        }

        if summary.succeeded + summary.failed > 0 {
            tracing::info!(
                "QUEUE: replayed {} pending push(es), {} still queued",
                summary.succeeded,
                summary.failed
            );
        }
        Ok(summary)
    }

    async fn record_failure(&self, kind: EntityKind, entity_id: Uuid) -> SyncResult<()> {
        match &self.backend {
            Backend::Memory(entries) => {
                let mut entries = lock(entries)?;
                if let Some(entry) = entries
                    .iter_mut()
                    .find(|e| e.kind == kind && e.entity_id == entity_id)
                {
                    entry.attempts = entry.attempts.saturating_add(1);
                }
            }
            Backend::Sqlite(pool) => {
                sqlx::query(Queries::INCREMENT_ATTEMPTS)
                    .bind(kind.to_string())
                    .bind(entity_id.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> SyncResult<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| SyncError::InvalidState("pending queue lock poisoned".to_string()))
}
