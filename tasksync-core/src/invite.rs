use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// Pending invites older than this are expired by the invitee's device.
pub const INVITE_EXPIRY_DAYS: i64 = 7;

const INVITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Declined,
    Left,
    Expired,
    /// Any status string this build does not know. Ignored, never fatal.
    #[serde(other)]
    Unknown,
}

/// A collaboration invitation, directional from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    pub id: String,
    pub created_at: String,
    pub sender_name: String,
    pub from: String,
    pub to: String,
    /// The category (shared list) the invite is about.
    pub category_id: Uuid,
    pub status: InviteStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
    Unrelated,
}

impl Invite {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        sender_name: impl Into<String>,
        category_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: format_invite_timestamp(created_at),
            sender_name: sender_name.into(),
            from: from.into(),
            to: to.into(),
            category_id,
            status: InviteStatus::Pending,
        }
    }

    pub fn direction(&self, me: &str) -> Direction {
        if self.to == me {
            Direction::Incoming
        } else if self.from == me {
            Direction::Outgoing
        } else {
            Direction::Unrelated
        }
    }

    /// Accepts both `YYYY-MM-DD HH:mm:ss` (UTC) and RFC 3339.
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&self.created_at) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.created_at, INVITE_TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// A pending invite past the expiry window. Unparseable timestamps never
    /// expire.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if self.status != InviteStatus::Pending {
            return false;
        }
        match self.created_at_utc() {
            Some(created_at) => created_at + window < now,
            None => false,
        }
    }
}

pub fn format_invite_timestamp(at: DateTime<Utc>) -> String {
    at.format(INVITE_TIMESTAMP_FORMAT).to_string()
}
