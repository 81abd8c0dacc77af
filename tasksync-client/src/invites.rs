//! Collaboration invites.
//!
//! Invites are documents in the remote store. Each device reacts to the
//! invites it sends or receives and turns them into membership changes on
//! its local categories:
//!
//! | direction | status              | effect                                     |
//! |-----------|---------------------|--------------------------------------------|
//! | incoming  | pending             | actionable, or expired after the window    |
//! | incoming  | left                | sender leaves the scope, invite deleted    |
//! | outgoing  | accepted            | invitee confirmed, invite deleted          |
//! | outgoing  | expired / declined  | invitee removed, invite deleted            |
//!
//! A scope left with only the local user collapses: the category goes
//! private and its remote records are deleted.

use crate::config::SyncConfig;
use crate::remote::RemoteStore;
use crate::retry::{with_backoff, RetryPolicy};
use crate::storage::Storage;
use crate::sync_engine::{PullReport, SyncEngine};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tasksync_core::clock::Clock;
use tasksync_core::errors::BatchFailure;
use tasksync_core::invite::{Direction, Invite, InviteStatus};
use tasksync_core::models::{Category, EntityKind, Member};
use tasksync_core::protocol::NotificationKind;
use tasksync_core::scope::SharingScope;
use tasksync_core::{SyncError, SyncResult};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counts of what one processing pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InviteReport {
    pub expired: usize,
    pub confirmed: usize,
    pub removed: usize,
    pub collapsed: usize,
    pub deleted: usize,
    /// Incoming invites waiting for the user.
    pub actionable: usize,
}

#[derive(Debug, Clone)]
enum InviteAction {
    Expire { invite_id: String },
    Delete { invite_id: String },
    SaveMembers {
        category_id: Uuid,
        users: Vec<Member>,
        collapse: bool,
    },
}

impl InviteAction {
    fn describe(&self) -> String {
        match self {
            InviteAction::Expire { invite_id } => format!("expire invite {}", invite_id),
            InviteAction::Delete { invite_id } => format!("delete invite {}", invite_id),
            InviteAction::SaveMembers {
                category_id,
                collapse,
                ..
            } => {
                if *collapse {
                    format!("collapse category {}", category_id)
                } else {
                    format!("update members of category {}", category_id)
                }
            }
        }
    }
}

/// Membership edits made during one pass, applied to copies of the local
/// categories so several invites for one category compose.
struct WorkingSet {
    me: String,
    categories: HashMap<Uuid, Category>,
    touched: BTreeMap<Uuid, bool>,
}

impl WorkingSet {
    fn scope(&self, category: &Category) -> SharingScope {
        SharingScope::normalized(category.data.users.clone(), &self.me)
    }

    fn is_member(&self, category_id: Uuid) -> bool {
        self.categories
            .get(&category_id)
            .map(|c| !c.archived && self.scope(c).contains(&self.me))
            .unwrap_or(false)
    }

    /// Applies `edit` to a category's scope. Returns whether it changed.
    fn edit<F>(&mut self, category_id: Uuid, edit: F) -> bool
    where
        F: FnOnce(&mut SharingScope, &str) -> bool,
    {
        let Some(category) = self.categories.get(&category_id) else {
            return false;
        };
        let mut scope = self.scope(category);
        let was_shared = scope.is_shared();
        if !edit(&mut scope, &self.me) {
            return false;
        }
        self.touched.entry(category_id).or_insert(was_shared);
        if let Some(category) = self.categories.get_mut(&category_id) {
            category.data.users = scope.into_members();
        }
        true
    }

    fn into_actions(self) -> Vec<InviteAction> {
        let mut actions = Vec::new();
        for (category_id, was_shared) in self.touched {
            if let Some(category) = self.categories.get(&category_id) {
                let users = category.data.users.clone();
                let collapse = was_shared && users.is_empty();
                actions.push(InviteAction::SaveMembers {
                    category_id,
                    users,
                    collapse,
                });
            }
        }
        actions
    }
}

pub struct InviteProcessor<S: Storage, R: RemoteStore> {
    engine: Arc<SyncEngine<S, R>>,
    clock: Arc<dyn Clock>,
    expiry: chrono::Duration,
    retry: RetryPolicy,
    pending: Mutex<Vec<Invite>>,
}

impl<S: Storage, R: RemoteStore> InviteProcessor<S, R> {
    pub fn new(engine: Arc<SyncEngine<S, R>>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        Self {
            engine,
            clock,
            expiry: config.invite_expiry(),
            retry: RetryPolicy::from(config),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn me(&self) -> &str {
        &self.engine.identity().email
    }

    /// Incoming invites the user can accept or decline.
    pub fn pending_invites(&self) -> Vec<Invite> {
        self.pending.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Fetches this user's invites and processes them.
    pub async fn refresh(&self) -> SyncResult<InviteReport> {
        let me = self.me().to_string();
        let remote = self.engine.remote();
        let invites = with_backoff(&self.retry, "fetch invites", || remote.invites_for(&me)).await?;
        self.process(invites).await
    }

    /// Runs one pass over an invite snapshot. Every resulting operation is
    /// attempted; failures come back together as `SyncError::Batch`.
    pub async fn process(&self, invites: Vec<Invite>) -> SyncResult<InviteReport> {
        let now = self.clock.now();
        let categories = self.engine.categories().get_all(|_| true).await?;
        let mut working = WorkingSet {
            me: self.me().to_string(),
            categories: categories.into_iter().map(|c| (c.id, c)).collect(),
            touched: BTreeMap::new(),
        };

        let mut report = InviteReport::default();
        let mut actions = Vec::new();
        let mut actionable = Vec::new();

        for invite in invites {
            match (invite.direction(&working.me), invite.status) {
                (Direction::Incoming, InviteStatus::Pending) => {
                    if working.is_member(invite.category_id) {
                        debug!("INVITES: {} already reflected locally", invite.id);
                    } else if invite.is_expired(now, self.expiry) {
                        report.expired += 1;
                        actions.push(InviteAction::Expire {
                            invite_id: invite.id.clone(),
                        });
                    } else {
                        actionable.push(invite);
                    }
                }
                (Direction::Incoming, InviteStatus::Left) => {
                    if working.edit(invite.category_id, |scope, me| {
                        scope.remove_member(&invite.from, me)
                    }) {
                        report.removed += 1;
                    }
                    report.deleted += 1;
                    actions.push(InviteAction::Delete {
                        invite_id: invite.id.clone(),
                    });
                }
                (Direction::Outgoing, InviteStatus::Accepted) => {
                    let confirmed = working.edit(invite.category_id, |scope, _| {
                        scope.confirm_member(&invite.to)
                    });
                    if confirmed {
                        report.confirmed += 1;
                    }
                    report.deleted += 1;
                    actions.push(InviteAction::Delete {
                        invite_id: invite.id.clone(),
                    });
                }
                (Direction::Outgoing, InviteStatus::Expired | InviteStatus::Declined) => {
                    if working.edit(invite.category_id, |scope, me| {
                        scope.remove_member(&invite.to, me)
                    }) {
                        report.removed += 1;
                    }
                    report.deleted += 1;
                    actions.push(InviteAction::Delete {
                        invite_id: invite.id.clone(),
                    });
                }
                (direction, status) => {
                    debug!(
                        "INVITES: nothing to do for {} ({:?}, {})",
                        invite.id, direction, status
                    );
                }
            }
        }

        let membership = working.into_actions();
        report.collapsed = membership
            .iter()
            .filter(|a| matches!(a, InviteAction::SaveMembers { collapse: true, .. }))
            .count();
        actions.extend(membership);
        report.actionable = actionable.len();

        if let Ok(mut pending) = self.pending.lock() {
            *pending = actionable;
        }

        let failures = self.run_batch(actions).await;
        if !failures.is_empty() {
            warn!("INVITES: {} operation(s) failed", failures.len());
            return Err(SyncError::Batch(failures));
        }
        if report != InviteReport::default() {
            info!("INVITES: processed {:?}", report);
        }
        Ok(report)
    }

    async fn run_batch(&self, actions: Vec<InviteAction>) -> Vec<BatchFailure> {
        let results = join_all(actions.iter().map(|action| self.execute(action))).await;
        actions
            .iter()
            .zip(results)
            .filter_map(|(action, result)| {
                result.err().map(|e| BatchFailure {
                    operation: action.describe(),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    async fn execute(&self, action: &InviteAction) -> SyncResult<()> {
        let remote = self.engine.remote();
        match action {
            InviteAction::Expire { invite_id } => {
                with_backoff(&self.retry, "expire invite", || {
                    remote.set_invite_status(invite_id, InviteStatus::Expired)
                })
                .await
            }
            InviteAction::Delete { invite_id } => {
                with_backoff(&self.retry, "delete invite", || remote.delete_invite(invite_id))
                    .await
            }
            InviteAction::SaveMembers {
                category_id,
                users,
                collapse,
            } => {
                let categories = self.engine.categories();
                let users = users.clone();
                categories.update(*category_id, move |c| c.users = users).await?;
                if *collapse {
                    categories.archive(*category_id).await?;
                    self.engine.collapse_scope(*category_id).await?;
                } else {
                    self.engine.push(EntityKind::Category, *category_id).await?;
                }
                Ok(())
            }
        }
    }

    /// Invites `to` into a category. The invitee becomes a pending member and
    /// the category with all its tasks is pushed under the shared scope.
    pub async fn send_invite(&self, category_id: Uuid, to: &str) -> SyncResult<Invite> {
        let me = self.me().to_string();
        let to = to.trim();
        if to.is_empty() || to == me {
            return Err(SyncError::validation("invitee must be another user"));
        }

        let categories = self.engine.categories();
        let category = categories.get(category_id).await?;
        let mut scope = self.engine.scope_of(&category);
        if !scope.add_member(Member::pending(to), &me) {
            return Err(SyncError::validation(format!("{} is already a member", to)));
        }

        let invite = Invite::new(
            me.as_str(),
            to,
            self.engine.identity().display_name.as_str(),
            category_id,
            self.clock.now(),
        );
        let remote = self.engine.remote();
        with_backoff(&self.retry, "send invite", || remote.put_invite(invite.clone())).await?;

        let users = scope.into_members();
        categories.update(category_id, move |c| c.users = users).await?;
        self.engine.push_scope(category_id).await?;

        let template = self
            .engine
            .template(NotificationKind::Invite)
            .with("category_name", category.data.name.clone())
            .with("category_id", category_id.to_string());
        self.engine.notify(&[to.to_string()], &template);

        info!("INVITES: invited {} to category {}", to, category_id);
        Ok(invite)
    }

    /// Accepts or declines an incoming invite. Accepting pulls the shared
    /// category and its tasks.
    pub async fn respond(&self, invite_id: &str, accept: bool) -> SyncResult<Option<PullReport>> {
        let me = self.me().to_string();
        let remote = self.engine.remote();

        let known = self
            .pending_invites()
            .into_iter()
            .find(|i| i.id == invite_id);
        let invite = match known {
            Some(invite) => invite,
            None => with_backoff(&self.retry, "fetch invites", || remote.invites_for(&me))
                .await?
                .into_iter()
                .find(|i| i.id == invite_id)
                .ok_or_else(|| SyncError::not_found(EntityKind::Invite, invite_id))?,
        };
        if invite.direction(&me) != Direction::Incoming || invite.status != InviteStatus::Pending
        {
            return Err(SyncError::InvalidState(format!(
                "invite {} is not an open invite for {}",
                invite_id, me
            )));
        }

        let report = if accept {
            let scope_keys = vec![invite.category_id.to_string()];
            let records =
                with_backoff(&self.retry, "fetch shared scope", || remote.query(&scope_keys))
                    .await?;
            let has_category = records.iter().any(|r| {
                r.kind == EntityKind::Category && r.entity_id == invite.category_id && !r.deleted
            });
            if !has_category {
                return Err(SyncError::not_found(EntityKind::Category, invite.category_id));
            }

            with_backoff(&self.retry, "accept invite", || {
                remote.set_invite_status(invite_id, InviteStatus::Accepted)
            })
            .await?;
            Some(self.engine.reconcile(records).await)
        } else {
            with_backoff(&self.retry, "decline invite", || {
                remote.set_invite_status(invite_id, InviteStatus::Declined)
            })
            .await?;
            None
        };

        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|i| i.id != invite_id);
        }
        info!(
            "INVITES: {} invite {}",
            if accept { "accepted" } else { "declined" },
            invite_id
        );
        Ok(report)
    }

    /// Leaves a shared category: every other member gets a `left` invite and
    /// the local copy goes private.
    pub async fn leave(&self, category_id: Uuid) -> SyncResult<()> {
        let me = self.me().to_string();
        let categories = self.engine.categories();
        let category = categories.get(category_id).await?;
        let scope = self.engine.scope_of(&category);
        if !scope.is_shared() {
            return Ok(());
        }

        let remote = self.engine.remote();
        let display_name = self.engine.identity().display_name.clone();
        let notices: Vec<Invite> = scope
            .members()
            .iter()
            .filter(|m| m.email != me)
            .map(|m| {
                let mut invite = Invite::new(
                    me.as_str(),
                    m.email.as_str(),
                    display_name.as_str(),
                    category_id,
                    self.clock.now(),
                );
                invite.status = InviteStatus::Left;
                invite
            })
            .collect();

        let results = join_all(notices.iter().map(|invite| {
            with_backoff(&self.retry, "send leave notice", move || {
                remote.put_invite(invite.clone())
            })
        }))
        .await;
        let failures: Vec<BatchFailure> = notices
            .iter()
            .zip(results)
            .filter_map(|(invite, result)| {
                result.err().map(|e| BatchFailure {
                    operation: format!("notify {} of leave", invite.to),
                    message: e.to_string(),
                })
            })
            .collect();
        if !failures.is_empty() {
            return Err(SyncError::Batch(failures));
        }

        categories.update(category_id, |c| c.users.clear()).await?;
        categories.archive(category_id).await?;
        info!("INVITES: left category {}", category_id);
        Ok(())
    }

    /// Refreshes whenever the remote store changes.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        let mut changes = self.engine.remote().changes();
        tokio::spawn(async move {
            loop {
                if processor.engine.connectivity().is_online() {
                    if let Err(e) = processor.refresh().await {
                        warn!("INVITES: refresh failed: {}", e);
                    }
                }
                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}
