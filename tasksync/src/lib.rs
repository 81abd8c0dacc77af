//! Tasksync - local-first task sync with encrypted sharing
//!
//! This crate provides a unified API for the tasksync system.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tasksync::{Client, Identity, MemoryRemoteStore, TaskData};
//!
//! let remote = Arc::new(MemoryRemoteStore::new());
//! let me = Identity::new("me@example.com", "Me");
//! let client = Client::builder(me, remote).open().await?;
//! client.start();
//! client.create_task(TaskData::new("Buy milk")).await?;
//! ```

// Re-export client types
pub use tasksync_client::{
    Client, ClientBuilder, Committed, Connectivity, Identity, MemoryRemoteStore, Notifier,
    PullReport, PushOutcome, RemoteStore, SyncConfig, SyncEvent,
};
pub use tasksync_client::logging::init_tracing;

// Re-export core types that applications need
pub use tasksync_core::errors::{BatchFailure, SyncError};
pub use tasksync_core::invite::{Invite, InviteStatus};
pub use tasksync_core::models::{Category, CategoryData, Member, Task, TaskData};
pub use tasksync_core::SyncResult;
