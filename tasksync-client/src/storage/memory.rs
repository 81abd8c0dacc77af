use super::EntityStorage;
use dashmap::DashMap;
use std::sync::Arc;
use tasksync_core::models::{EntityData, EntityKind, Record};
use tasksync_core::SyncResult;
use uuid::Uuid;

/// Process-local storage. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    rows: Arc<DashMap<(EntityKind, Uuid), serde_json::Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<D: EntityData> EntityStorage<D> for MemoryStorage {
    async fn load(&self, id: Uuid) -> SyncResult<Option<Record<D>>> {
        let value = self.rows.get(&(D::KIND, id)).map(|row| row.value().clone());
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> SyncResult<Vec<Record<D>>> {
        let values: Vec<serde_json::Value> = self
            .rows
            .iter()
            .filter(|row| row.key().0 == D::KIND)
            .map(|row| row.value().clone())
            .collect();

        let mut records = values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Record<D>>, _>>()?;
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn save(&self, record: &Record<D>) -> SyncResult<()> {
        let value = serde_json::to_value(record)?;
        self.rows.insert((D::KIND, record.id), value);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> SyncResult<Option<Record<D>>> {
        match self.rows.remove(&(D::KIND, id)) {
            Some((_, value)) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
