use crate::offline_queue::PendingAction;
use sqlx::{sqlite::SqliteRow, Row};
use tasksync_core::models::EntityKind;
use tasksync_core::{SyncError, SyncResult};
use uuid::Uuid;

/// SQL queries for the local database
pub struct Queries;

impl Queries {
    // Entity queries
    pub const GET_ENTITY: &'static str = "SELECT body FROM entities WHERE kind = ?1 AND id = ?2";

    pub const GET_ENTITIES_BY_KIND: &'static str =
        "SELECT body FROM entities WHERE kind = ?1 ORDER BY updated_at, id";

    pub const UPSERT_ENTITY: &'static str = r#"
        INSERT INTO entities (kind, id, updated_at, archived, body)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(kind, id) DO UPDATE SET
            updated_at = excluded.updated_at,
            archived = excluded.archived,
            body = excluded.body
    "#;

    pub const DELETE_ENTITY: &'static str = "DELETE FROM entities WHERE kind = ?1 AND id = ?2";

    // Pending queue queries. A queued push never downgrades a stronger action.
    pub const ENQUEUE_PENDING: &'static str = r#"
        INSERT INTO pending_sync (kind, entity_id, enqueued_at, attempts, action)
        VALUES (?1, ?2, ?3, 0, ?4)
        ON CONFLICT(kind, entity_id) DO UPDATE SET action = excluded.action
        WHERE excluded.action != 'push' AND pending_sync.action != excluded.action
    "#;

    pub const DEQUEUE_PENDING: &'static str =
        "DELETE FROM pending_sync WHERE kind = ?1 AND entity_id = ?2";

    pub const GET_PENDING: &'static str = r#"
        SELECT kind, entity_id, enqueued_at, attempts, action
        FROM pending_sync
        ORDER BY enqueued_at, rowid
    "#;

    pub const COUNT_PENDING_ENTRY: &'static str =
        "SELECT COUNT(*) AS count FROM pending_sync WHERE kind = ?1 AND entity_id = ?2";

    pub const INCREMENT_ATTEMPTS: &'static str =
        "UPDATE pending_sync SET attempts = attempts + 1 WHERE kind = ?1 AND entity_id = ?2";

    pub const CLEAR_PENDING: &'static str = "DELETE FROM pending_sync";
}

/// Helpers for reading typed values back out of rows
pub struct DbHelpers;

impl DbHelpers {
    pub fn parse_kind(row: &SqliteRow, column: &str) -> SyncResult<EntityKind> {
        let raw: String = row.try_get(column)?;
        raw.parse()
            .map_err(|_| SyncError::Serialization(format!("unknown entity kind: {}", raw)))
    }

    pub fn parse_action(row: &SqliteRow, column: &str) -> SyncResult<PendingAction> {
        let raw: String = row.try_get(column)?;
        raw.parse()
            .map_err(|_| SyncError::Serialization(format!("unknown pending action: {}", raw)))
    }

    pub fn parse_uuid(row: &SqliteRow, column: &str) -> SyncResult<Uuid> {
        let raw: String = row.try_get(column)?;
        Ok(Uuid::parse_str(&raw)?)
    }
}
