mod common;

use common::{count_remote, Device};
use std::sync::Arc;
use tasksync_client::config::DEFAULT_LEGACY_KEY;
use tasksync_client::{
    MemoryRemoteStore, PendingAction, PullReport, PushOutcome, RemoteStore, SyncEvent,
};
use tasksync_core::codec::{CiphertextFormat, Codec, KeyScope};
use tasksync_core::models::{Category, CategoryData, EntityKind, Member, Record, Task, TaskData};
use tasksync_core::protocol::{NewRemoteRecord, NotificationKind, RemoteRecord};
use uuid::Uuid;

async fn shared_category(device: &Device, other: &str) -> Category {
    let data = CategoryData {
        name: "Groceries".to_string(),
        is_default: false,
        users: vec![Member::new(&device.email), Member::new(other)],
    };
    let (category, outcomes) = device
        .client
        .create_category(data)
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Inserted]);
    category
}

async fn shared_task(device: &Device, category: &Category, name: &str) -> Task {
    let (task, outcomes) = device
        .client
        .create_task(TaskData::new(name).in_category(category.id))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Inserted]);
    task
}

/// Pulls a scope the device does not know locally yet.
async fn join_scope(device: &Device, remote: &MemoryRemoteStore, category_id: Uuid) -> PullReport {
    let records = remote.query(&[category_id.to_string()]).await.unwrap();
    device.client.engine().reconcile(records).await
}

fn remote_task(remote: &MemoryRemoteStore, task_id: Uuid) -> RemoteRecord {
    remote
        .records()
        .into_iter()
        .find(|r| r.kind == EntityKind::Task && r.entity_id == task_id)
        .unwrap()
}

fn decode_task(remote: &MemoryRemoteStore, task: &Task) -> Task {
    let record = remote_task(remote, task.id);
    Codec::new(DEFAULT_LEGACY_KEY)
        .decode(&record.data, &KeyScope::shared(&record.scope_key))
        .unwrap()
}

#[tokio::test]
async fn test_private_entities_are_never_pushed() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);

    let (_, outcomes) = alice
        .client
        .create_task(TaskData::new("Loose task"))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Private]);

    let (category, outcomes) = alice
        .client
        .create_category(CategoryData::new("Solo"))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Private]);

    let (task, _) = alice
        .client
        .create_task(TaskData::new("Solo task").in_category(category.id))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    let (_, outcomes) = alice
        .client
        .delete_tasks(&[task.id])
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Private]);

    assert!(remote.records().is_empty());
    assert!(alice.client.engine().queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn test_sharing_a_category_pushes_it_with_its_tasks() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);

    let category = alice
        .client
        .create_category(CategoryData::new("Trip"))
        .await
        .unwrap()
        .value;
    alice
        .client
        .create_task(TaskData::new("Book hotel").in_category(category.id))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert!(remote.records().is_empty());

    alice.tick(60);
    let (_, outcomes) = alice
        .client
        .update_category(category.id, |c| c.users.push(Member::new("bob@example.com")))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Inserted, PushOutcome::Inserted]);
    assert_eq!(count_remote(&remote, EntityKind::Category), 1);
    assert_eq!(count_remote(&remote, EntityKind::Task), 1);

    let notified = alice.notifier.sent();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].0, vec!["bob@example.com".to_string()]);
    assert_eq!(notified[0].1.kind, NotificationKind::NewTask);
    assert_eq!(notified[0].1.data["task_name"], "Book hotel");
}

#[tokio::test]
async fn test_repeated_push_is_idempotent() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    let task = shared_task(&alice, &category, "Milk").await;
    let before = remote.records();

    let engine = alice.client.engine();
    assert_eq!(engine.push(EntityKind::Task, task.id).await.unwrap(), PushOutcome::Unchanged);
    assert_eq!(engine.push(EntityKind::Task, task.id).await.unwrap(), PushOutcome::Unchanged);

    assert_eq!(remote.records(), before);
    assert_eq!(decode_task(&remote, &task), task);
}

#[tokio::test]
async fn test_update_replaces_remote_copy() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    let task = shared_task(&alice, &category, "Milk").await;

    alice.tick(30);
    let (updated, outcomes) = alice
        .client
        .update_task(task.id, |t| t.name = "Oat milk".to_string())
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Replaced]);
    assert_eq!(count_remote(&remote, EntityKind::Task), 1);
    assert_eq!(decode_task(&remote, &task), updated);

    let kinds: Vec<NotificationKind> = alice.notifier.sent().iter().map(|(_, t)| t.kind).collect();
    assert_eq!(kinds, vec![NotificationKind::NewTask, NotificationKind::TaskUpdated]);
}

#[tokio::test]
async fn test_offline_push_is_queued_then_replayed() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    let task = shared_task(&alice, &category, "Milk").await;
    let mut events = alice.client.events();

    alice.client.set_online(false);
    alice.tick(30);
    let (updated, outcomes) = alice
        .client
        .update_task(task.id, |t| t.important = true)
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Queued]);

    let engine = alice.client.engine();
    assert!(engine.queue().contains(EntityKind::Task, task.id).await.unwrap());
    assert_eq!(decode_task(&remote, &task), task);
    assert!(matches!(
        events.try_recv().unwrap(),
        SyncEvent::Queued { kind: EntityKind::Task, .. }
    ));

    // Replay is a no-op while offline
    assert_eq!(engine.replay_pending().await.unwrap().succeeded, 0);

    alice.client.set_online(true);
    let summary = engine.replay_pending().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert!(engine.queue().is_empty().await.unwrap());
    assert_eq!(decode_task(&remote, &task), updated);
}

#[tokio::test]
async fn test_remote_outage_queues_instead_of_failing() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    let task = shared_task(&alice, &category, "Milk").await;

    remote.set_online(false);
    alice.tick(30);
    let committed = alice
        .client
        .update_task(task.id, |t| t.description = "2 litres".to_string())
        .await
        .unwrap();
    // The local write stands regardless of the push
    assert_eq!(committed.value.data.description, "2 litres");
    let (_, outcomes) = committed.settle().await.unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Queued]);

    let engine = alice.client.engine();
    let summary = engine.replay_pending().await.unwrap();
    assert_eq!(summary.failed, 1);
    let pending = engine.queue().pending().await.unwrap();
    assert_eq!(pending[0].attempts, 1);

    remote.set_online(true);
    let summary = engine.replay_pending().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(decode_task(&remote, &task).data.description, "2 litres");
}

#[tokio::test]
async fn test_delete_writes_tombstone_and_notifies() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    let task = shared_task(&alice, &category, "Milk").await;

    let (removed, outcomes) = alice
        .client
        .delete_tasks(&[task.id])
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(removed[0].id, task.id);
    assert_eq!(outcomes, vec![PushOutcome::Tombstoned(1)]);

    let tombstone = remote_task(&remote, task.id);
    assert!(tombstone.deleted);
    assert!(tombstone.data.is_empty());

    let (recipients, template) = alice.notifier.sent().pop().unwrap();
    assert_eq!(recipients, vec!["bob@example.com".to_string()]);
    assert_eq!(template.kind, NotificationKind::TaskDeleted);
}

#[tokio::test]
async fn test_offline_delete_tombstones_on_replay() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    let task = shared_task(&alice, &category, "Milk").await;

    alice.client.set_online(false);
    let (_, outcomes) = alice
        .client
        .delete_tasks(&[task.id])
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Queued]);
    assert!(!remote_task(&remote, task.id).deleted);

    alice.client.set_online(true);
    alice.client.engine().replay_pending().await.unwrap();
    assert!(remote_task(&remote, task.id).deleted);
}

#[tokio::test]
async fn test_tombstone_beats_stale_copy_in_same_snapshot() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let bob = Device::new("bob", &remote);
    let category = shared_category(&alice, &bob.email).await;
    let task = shared_task(&alice, &category, "Milk").await;

    let report = join_scope(&bob, &remote, category.id).await;
    assert_eq!(report.created, 2);
    let stale = remote_task(&remote, task.id);

    alice.client.delete_tasks(&[task.id]).await.unwrap().settle().await.unwrap();
    let tombstone = remote_task(&remote, task.id);

    // Live copy listed first; the tombstone must still win
    let engine = bob.client.engine();
    let report = engine.reconcile(vec![stale.clone(), tombstone]).await;
    assert_eq!(report.deleted, 1);
    assert_eq!(report.skipped_tombstoned, 1);
    assert!(bob.client.tasks_store().find(task.id).await.unwrap().is_none());

    let report = engine.reconcile(vec![stale]).await;
    assert_eq!(report.created, 0);
    assert!(bob.client.tasks_store().find(task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_undecodable_record_does_not_block_others() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let bob = Device::new("bob", &remote);
    let category = shared_category(&alice, &bob.email).await;
    shared_task(&alice, &category, "Milk").await;

    remote
        .insert(NewRemoteRecord {
            kind: EntityKind::Task,
            entity_id: Uuid::new_v4(),
            scope_key: category.id.to_string(),
            data: "definitely not ciphertext".to_string(),
            deleted: false,
        })
        .await
        .unwrap();

    let mut events = bob.client.events();
    let report = join_scope(&bob, &remote, category.id).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.created, 2);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::DecodeFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn test_legacy_record_is_migrated_on_pull() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let bob = Device::new("bob", &remote);
    let category = shared_category(&alice, &bob.email).await;
    join_scope(&bob, &remote, category.id).await;

    let codec = Codec::new(DEFAULT_LEGACY_KEY);
    let legacy_task: Task = Record {
        id: Uuid::new_v4(),
        created_at: common::t0(),
        updated_at: common::t0(),
        archived: false,
        data: TaskData::new("Written by an old build").in_category(category.id),
    };
    remote
        .insert(NewRemoteRecord {
            kind: EntityKind::Task,
            entity_id: legacy_task.id,
            scope_key: category.id.to_string(),
            data: codec.encode_legacy(&legacy_task).unwrap(),
            deleted: false,
        })
        .await
        .unwrap();

    let report = bob.client.engine().pull().await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.migrated, 1);
    assert_eq!(bob.client.task(legacy_task.id).await.unwrap(), legacy_task);

    let migrated = remote_task(&remote, legacy_task.id);
    let (decoded, format) = codec
        .decode_with_format::<Task>(&migrated.data, &KeyScope::shared(category.id))
        .unwrap();
    assert_eq!(decoded, legacy_task);
    assert!(matches!(format, CiphertextFormat::Versioned(_)));

    // Already migrated; a second pull leaves it alone
    let report = bob.client.engine().pull().await.unwrap();
    assert_eq!(report.migrated, 0);
}

#[tokio::test]
async fn test_push_adopts_newer_remote_copy() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let bob = Device::new("bob", &remote);
    let category = shared_category(&alice, &bob.email).await;
    let task = shared_task(&alice, &category, "Milk").await;
    join_scope(&bob, &remote, category.id).await;

    bob.tick(60);
    let (bobs, outcomes) = bob
        .client
        .update_task(task.id, |t| t.name = "Soy milk".to_string())
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Replaced]);

    let outcome = alice.client.engine().push(EntityKind::Task, task.id).await.unwrap();
    assert_eq!(outcome, PushOutcome::AdoptedRemote);
    assert_eq!(alice.client.task(task.id).await.unwrap(), bobs);
    assert_eq!(decode_task(&remote, &task), bobs);
}

#[tokio::test]
async fn test_pull_keeps_newer_local_copy() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    let task = shared_task(&alice, &category, "Milk").await;

    alice.client.set_online(false);
    alice.tick(30);
    alice
        .client
        .update_task(task.id, |t| t.name = "Local edit".to_string())
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();

    let report = alice.client.engine().pull().await.unwrap();
    assert_eq!(report.applied(), 0);
    assert_eq!(report.unchanged, 2);
    assert_eq!(alice.client.task(task.id).await.unwrap().data.name, "Local edit");
}

#[tokio::test]
async fn test_remote_tombstone_wins_over_local_edit() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let bob = Device::new("bob", &remote);
    let category = shared_category(&alice, &bob.email).await;
    let task = shared_task(&alice, &category, "Milk").await;
    join_scope(&bob, &remote, category.id).await;

    let (_, outcomes) = bob
        .client
        .delete_tasks(&[task.id])
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Tombstoned(1)]);

    alice.tick(60);
    let (_, outcomes) = alice
        .client
        .update_task(task.id, |t| t.important = true)
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::RemoteDeleted]);
    assert!(alice.client.tasks_store().find(task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unsharing_collapses_scope() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    shared_task(&alice, &category, "Milk").await;
    let mut events = alice.client.events();

    alice.tick(60);
    let (category, outcomes) = alice
        .client
        .update_category(category.id, |c| c.users.retain(|m| m.email != "bob@example.com"))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Collapsed(2)]);
    assert!(remote.records().is_empty());
    assert!(!alice.client.engine().scope_of(&category).is_shared());
    assert!(matches!(
        events.try_recv().unwrap(),
        SyncEvent::ScopeCollapsed { removed: 2, .. }
    ));
}

#[tokio::test]
async fn test_offline_collapse_runs_on_replay() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    shared_task(&alice, &category, "Milk").await;

    alice.client.set_online(false);
    alice.tick(60);
    let (_, outcomes) = alice
        .client
        .update_category(category.id, |c| c.users.clear())
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Queued]);
    assert_eq!(remote.records().len(), 2);

    alice.client.set_online(true);
    let summary = alice.client.engine().replay_pending().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert!(remote.records().is_empty());
}

fn task_copies(remote: &MemoryRemoteStore, task_id: Uuid) -> Vec<RemoteRecord> {
    remote
        .records()
        .into_iter()
        .filter(|r| r.kind == EntityKind::Task && r.entity_id == task_id)
        .collect()
}

async fn private_category(device: &Device) -> Category {
    device
        .client
        .create_category(CategoryData::new("Mine"))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap()
        .0
}

#[tokio::test]
async fn test_leaving_with_queued_push_keeps_list_for_others() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let bob = Device::new("bob", &remote);
    let data = CategoryData {
        name: "Groceries".to_string(),
        is_default: false,
        users: vec![
            Member::new(&alice.email),
            Member::new(&bob.email),
            Member::new("carol@example.com"),
        ],
    };
    let category = alice
        .client
        .create_category(data)
        .await
        .unwrap()
        .settle()
        .await
        .unwrap()
        .0;
    shared_task(&alice, &category, "Milk").await;
    join_scope(&bob, &remote, category.id).await;

    bob.client.set_online(false);
    bob.tick(60);
    let (_, outcomes) = bob
        .client
        .update_category(category.id, |c| c.name = "Weekly shop".to_string())
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Queued]);

    bob.client.set_online(true);
    bob.client.leave_category(category.id).await.unwrap();
    let summary = bob.client.engine().replay_pending().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert!(bob.client.engine().queue().is_empty().await.unwrap());

    // Alice and Carol still hold the list
    let records = remote.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| !r.deleted));
    let report = alice.client.engine().pull().await.unwrap();
    assert_eq!(report.deleted, 0);
}

#[tokio::test]
async fn test_moving_task_to_private_category_retracts_it() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let bob = Device::new("bob", &remote);
    let shared = shared_category(&alice, &bob.email).await;
    let task = shared_task(&alice, &shared, "Milk").await;
    let private = private_category(&alice).await;
    join_scope(&bob, &remote, shared.id).await;

    alice.tick(60);
    let (_, outcomes) = alice
        .client
        .update_task(task.id, |t| t.category_id = Some(private.id))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Retracted(1)]);
    let copies = task_copies(&remote, task.id);
    assert_eq!(copies.len(), 1);
    assert!(copies[0].deleted);
    assert!(copies[0].data.is_empty());

    let report = bob.client.engine().pull().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(bob.client.tasks_store().find(task.id).await.unwrap().is_none());

    // Alice's own copy lives on in the private category
    let kept = alice.client.task(task.id).await.unwrap();
    assert_eq!(kept.data.category_id, Some(private.id));
}

#[tokio::test]
async fn test_offline_move_to_private_category_retracts_on_replay() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let shared = shared_category(&alice, "bob@example.com").await;
    let task = shared_task(&alice, &shared, "Milk").await;
    let private = private_category(&alice).await;

    alice.client.set_online(false);
    alice.tick(60);
    let (_, outcomes) = alice
        .client
        .update_task(task.id, |t| t.category_id = Some(private.id))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Queued]);
    let pending = alice.client.engine().queue().pending().await.unwrap();
    assert_eq!(pending[0].action, PendingAction::Retract);

    alice.client.set_online(true);
    let summary = alice.client.engine().replay_pending().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert!(remote_task(&remote, task.id).deleted);
}

#[tokio::test]
async fn test_moving_task_between_shared_categories() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let bob = Device::new("bob", &remote);
    let first = shared_category(&alice, &bob.email).await;
    let task = shared_task(&alice, &first, "Milk").await;
    alice.tick(10);
    let second = shared_category(&alice, &bob.email).await;
    join_scope(&bob, &remote, first.id).await;
    join_scope(&bob, &remote, second.id).await;

    alice.tick(60);
    let (_, outcomes) = alice
        .client
        .update_task(task.id, |t| t.category_id = Some(second.id))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Inserted]);
    let copies = task_copies(&remote, task.id);
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().any(|r| r.scope_key == first.id.to_string() && r.deleted));
    assert!(copies.iter().any(|r| r.scope_key == second.id.to_string() && !r.deleted));

    let report = bob.client.engine().pull().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.created, 1);
    assert_eq!(
        bob.client.task(task.id).await.unwrap().data.category_id,
        Some(second.id)
    );

    // Moving back revives the old record instead of treating it as deleted
    alice.tick(60);
    let (_, outcomes) = alice
        .client
        .update_task(task.id, |t| t.category_id = Some(first.id))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Replaced]);
    let copies = task_copies(&remote, task.id);
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().any(|r| r.scope_key == first.id.to_string() && !r.deleted));
    assert!(copies.iter().any(|r| r.scope_key == second.id.to_string() && r.deleted));

    bob.client.engine().pull().await.unwrap();
    let bobs = bob.client.task(task.id).await.unwrap();
    assert_eq!(bobs.data.category_id, Some(first.id));
    assert_eq!(bobs, alice.client.task(task.id).await.unwrap());
}

#[tokio::test]
async fn test_pull_before_replay_keeps_offline_delete() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let alice = Device::new("alice", &remote);
    let category = shared_category(&alice, "bob@example.com").await;
    let task = shared_task(&alice, &category, "Milk").await;

    alice.client.set_online(false);
    let (_, outcomes) = alice
        .client
        .delete_tasks(&[task.id])
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcomes, vec![PushOutcome::Queued]);

    // The pull loop can run before the replay loop after reconnecting
    alice.client.set_online(true);
    let report = alice.client.engine().pull().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.created, 0);
    assert!(alice.client.tasks_store().find(task.id).await.unwrap().is_none());

    alice.client.engine().replay_pending().await.unwrap();
    assert!(remote_task(&remote, task.id).deleted);

    let report = alice.client.engine().pull().await.unwrap();
    assert_eq!(report.created, 0);
    assert!(alice.client.tasks_store().find(task.id).await.unwrap().is_none());
}
