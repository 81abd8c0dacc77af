//! Whole-record last-writer-wins.
//!
//! Limitation: there is no field-level merge. When two devices edit the same
//! entity concurrently, the copy with the greater `updated_at` replaces the
//! other in full and the losing edit is dropped.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    RemoteWins,
    /// Local is newer or the timestamps tie.
    LocalWins,
}

/// What reconciling one remote record did to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Deleted,
    /// Tombstone for an entity that was already gone.
    AlreadyAbsent,
    /// Local copy won or tied; nothing was written.
    ConflictNoop,
}

impl ReconcileOutcome {
    pub fn wrote(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Created | ReconcileOutcome::Updated | ReconcileOutcome::Deleted
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Remote wins iff strictly newer. A pure function of the two timestamps,
    /// so the result does not depend on arrival order.
    pub fn resolve(&self, local: DateTime<Utc>, remote: DateTime<Utc>) -> Resolution {
        if remote > local {
            Resolution::RemoteWins
        } else {
            Resolution::LocalWins
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_strictly_newer_remote_wins() {
        let resolver = ConflictResolver::new();
        let t = Utc::now();
        assert_eq!(resolver.resolve(t, t + Duration::seconds(1)), Resolution::RemoteWins);
        assert_eq!(resolver.resolve(t + Duration::seconds(1), t), Resolution::LocalWins);
    }

    #[test]
    fn test_tie_favors_local() {
        let t = Utc::now();
        assert_eq!(ConflictResolver::new().resolve(t, t), Resolution::LocalWins);
    }
}
