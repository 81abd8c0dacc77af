use super::EntityStorage;
use crate::queries::Queries;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tasksync_core::models::{EntityData, Record};
use tasksync_core::SyncResult;
use uuid::Uuid;

/// SQLite-backed storage. Also owns the pool the pending queue shares.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> SyncResult<Self> {
        // Every connection to `sqlite::memory:` is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        tracing::debug!("DATABASE: connected to {}", database_url);
        Ok(storage)
    }

    pub async fn run_migrations(&self) -> SyncResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl<D: EntityData> EntityStorage<D> for SqliteStorage {
    async fn load(&self, id: Uuid) -> SyncResult<Option<Record<D>>> {
        let row = sqlx::query(Queries::GET_ENTITY)
            .bind(D::KIND.to_string())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> SyncResult<Vec<Record<D>>> {
        let rows = sqlx::query(Queries::GET_ENTITIES_BY_KIND)
            .bind(D::KIND.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            records.push(serde_json::from_str(&body)?);
        }
        Ok(records)
    }

    async fn save(&self, record: &Record<D>) -> SyncResult<()> {
        let body = serde_json::to_string(record)?;
        sqlx::query(Queries::UPSERT_ENTITY)
            .bind(D::KIND.to_string())
            .bind(record.id.to_string())
            .bind(record.updated_at.to_rfc3339())
            .bind(record.archived)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> SyncResult<Option<Record<D>>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(Queries::GET_ENTITY)
            .bind(D::KIND.to_string())
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row.try_get("body")?;
        let record: Record<D> = serde_json::from_str(&body)?;

        sqlx::query(Queries::DELETE_ENTITY)
            .bind(D::KIND.to_string())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(record))
    }
}
