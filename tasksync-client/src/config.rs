use serde::Deserialize;
use tasksync_core::invite::INVITE_EXPIRY_DAYS;

/// Application-wide key that encrypted records before scope keys existed.
pub const DEFAULT_LEGACY_KEY: &str = "tasksync-shared-legacy-key";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_url: String,
    /// How often queued pushes are replayed while online.
    pub replay_interval_secs: u64,
    pub invite_expiry_days: i64,
    pub legacy_key: String,
    pub retry_max_times: usize,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            replay_interval_secs: 30,
            invite_expiry_days: INVITE_EXPIRY_DAYS,
            legacy_key: DEFAULT_LEGACY_KEY.to_string(),
            retry_max_times: 3,
            retry_min_delay_ms: 100,
            retry_max_delay_ms: 2000,
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `TASKSYNC_*` environment variables. Values that
    /// do not parse are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TASKSYNC_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(secs) = parse_env("TASKSYNC_REPLAY_INTERVAL_SECS") {
            config.replay_interval_secs = secs;
        }
        if let Some(days) = parse_env("TASKSYNC_INVITE_EXPIRY_DAYS") {
            config.invite_expiry_days = days;
        }
        if let Ok(key) = std::env::var("TASKSYNC_LEGACY_KEY") {
            config.legacy_key = key;
        }
        config
    }

    pub fn replay_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.replay_interval_secs.max(1))
    }

    pub fn invite_expiry(&self) -> chrono::Duration {
        chrono::Duration::days(self.invite_expiry_days)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("CONFIG: ignoring unparseable {}={}", name, raw);
            None
        }
    }
}

/// The local user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    /// Identifier used in sharing scopes and invites.
    pub email: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            display_name: display_name.into(),
        }
    }
}
