use crate::models::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::Display;
use uuid::Uuid;

/// An encrypted entity as held by the remote store. One per shared entity per
/// scope. `deleted = true` is a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Assigned by the remote store.
    pub id: String,
    pub kind: EntityKind,
    pub entity_id: Uuid,
    /// Category id; both the query filter and the key-derivation input.
    pub scope_key: String,
    /// Base64 ciphertext.
    pub data: String,
    #[serde(default)]
    pub deleted: bool,
}

/// A record the remote store has not assigned an id to yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRemoteRecord {
    pub kind: EntityKind,
    pub entity_id: Uuid,
    pub scope_key: String,
    pub data: String,
    #[serde(default)]
    pub deleted: bool,
}

impl NewRemoteRecord {
    pub fn with_id(self, id: String) -> RemoteRecord {
        RemoteRecord {
            id,
            kind: self.kind,
            entity_id: self.entity_id,
            scope_key: self.scope_key,
            data: self.data,
            deleted: self.deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
    NewTask,
    TaskUpdated,
    TaskDeleted,
    Invite,
}

/// Structured push notification handed to the notification capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub kind: NotificationKind,
    pub data: BTreeMap<String, String>,
}

impl NotificationTemplate {
    pub fn new(kind: NotificationKind) -> Self {
        Self {
            kind,
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}
