//! Local-first task storage with encrypted sharing.
//!
//! Entities live in an [`EntityStore`](store::EntityStore). Mutations inside
//! a shared category are pushed to a [`RemoteStore`](remote::RemoteStore) as
//! scope-encrypted records by the [`SyncEngine`](sync_engine::SyncEngine);
//! remote snapshots are pulled back and reconciled by last-writer-wins.

pub mod client;
pub mod config;
pub mod connectivity;
pub mod events;
pub mod invites;
pub mod logging;
pub mod notify;
pub mod offline_queue;
pub mod queries;
pub mod remote;
pub mod retry;
pub mod storage;
pub mod store;
pub mod sync_engine;

pub use client::{Client, ClientBuilder, Committed};
pub use config::{Identity, SyncConfig};
pub use connectivity::Connectivity;
pub use events::{Filter, Subscription, SyncEvent};
pub use invites::{InviteProcessor, InviteReport};
pub use notify::{LogNotifier, Notifier};
pub use offline_queue::{PendingAction, PendingEntry, PendingQueue, ReplaySummary};
pub use remote::{MemoryRemoteStore, RemoteStore};
pub use storage::{EntityStorage, MemoryStorage, SqliteStorage, Storage};
pub use store::{CreateOutcome, EntityStore};
pub use sync_engine::{PullReport, PushHandle, PushOutcome, SyncEngine, SyncEngineParts};
