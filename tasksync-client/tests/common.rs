use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tasksync_client::logging::init_tracing;
use tasksync_client::{
    Client, Connectivity, EntityStore, Identity, MemoryRemoteStore, MemoryStorage, Notifier,
    SyncConfig,
};
use tasksync_core::clock::{Clock, ManualClock};
use tasksync_core::models::{EntityData, EntityKind, TaskData};
use tasksync_core::protocol::NotificationTemplate;
use tasksync_core::SyncResult;

/// Fixed start of time for tests.
#[allow(dead_code)]
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
}

#[allow(dead_code)]
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(offset_secs)
}

/// Creates an in-memory store driven by a manual clock.
#[allow(dead_code)]
pub fn setup_store<D: EntityData>() -> (EntityStore<D, MemoryStorage>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = EntityStore::new(MemoryStorage::new(), clock.clone() as Arc<dyn Clock>);
    (store, clock)
}

#[allow(dead_code)]
pub fn make_task(name: &str) -> TaskData {
    TaskData::new(name)
}

/// Retries quickly so tests with an unreachable remote stay fast.
#[allow(dead_code)]
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        retry_max_times: 1,
        retry_min_delay_ms: 1,
        retry_max_delay_ms: 2,
        ..Default::default()
    }
}

/// Captures notifications instead of sending them.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Vec<String>, NotificationTemplate)>>,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(Vec<String>, NotificationTemplate)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, recipients: &[String], template: &NotificationTemplate) -> SyncResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((recipients.to_vec(), template.clone()));
        Ok(())
    }
}

/// One user's device: a client with its own clock and storage, attached to a
/// shared remote store.
#[allow(dead_code)]
pub struct Device {
    pub client: Client<MemoryStorage, MemoryRemoteStore>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub email: String,
}

#[allow(dead_code)]
impl Device {
    pub fn new(name: &str, remote: &Arc<MemoryRemoteStore>) -> Self {
        Self::starting_at(name, remote, t0())
    }

    pub fn starting_at(name: &str, remote: &Arc<MemoryRemoteStore>, start: DateTime<Utc>) -> Self {
        init_tracing("warn");
        let email = format!("{}@example.com", name);
        let clock = Arc::new(ManualClock::new(start));
        let notifier = Arc::new(RecordingNotifier::default());
        let identity = Identity::new(email.clone(), name);
        let client = Client::builder(identity, remote.clone())
            .config(fast_config())
            .clock(clock.clone() as Arc<dyn Clock>)
            .notifier(notifier.clone() as Arc<dyn Notifier>)
            .connectivity(Connectivity::new(true))
            .build_in_memory();
        Self {
            client,
            clock,
            notifier,
            email,
        }
    }

    pub fn tick(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }
}

#[allow(dead_code)]
pub fn count_remote(remote: &MemoryRemoteStore, kind: EntityKind) -> usize {
    remote.records().iter().filter(|r| r.kind == kind).count()
}
