//! Sharing scopes: who may read a category and every task in it.
//!
//! A scope is the member list of a category. An empty list means private.
//! The acting user is never alone in a scope: a list that would contain only
//! them normalizes to empty, and any non-empty list always contains them.

use crate::models::Member;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SharingScope {
    members: Vec<Member>,
}

impl SharingScope {
    pub fn private() -> Self {
        Self::default()
    }

    /// Builds a scope from raw members on behalf of `me`.
    pub fn normalized(members: Vec<Member>, me: &str) -> Self {
        let mut scope = Self { members: Vec::new() };
        for member in members {
            if member.email.trim().is_empty() || scope.contains(&member.email) {
                continue;
            }
            scope.members.push(member);
        }
        scope.settle(me);
        scope
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn into_members(self) -> Vec<Member> {
        self.members
    }

    pub fn is_shared(&self) -> bool {
        !self.members.is_empty()
    }

    pub fn contains(&self, email: &str) -> bool {
        self.members.iter().any(|m| m.email == email)
    }

    /// Adds `member`, re-adding `me` if absent. Returns false when the email
    /// was already a member.
    pub fn add_member(&mut self, member: Member, me: &str) -> bool {
        let added = if self.contains(&member.email) {
            false
        } else {
            self.members.push(member);
            true
        };
        self.settle(me);
        added
    }

    /// Removes `email`. Returns false when it was not a member.
    pub fn remove_member(&mut self, email: &str, me: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.email != email);
        let removed = self.members.len() != before;
        self.settle(me);
        removed
    }

    /// Clears the pending flag on `email`. Returns false when nothing changed.
    pub fn confirm_member(&mut self, email: &str) -> bool {
        match self.members.iter_mut().find(|m| m.email == email) {
            Some(member) if member.pending => {
                member.pending = false;
                true
            }
            _ => false,
        }
    }

    /// True when nobody but `me` is left.
    pub fn only_self(&self, me: &str) -> bool {
        self.members.iter().all(|m| m.email == me)
    }

    /// Members that should hear about changes: confirmed and not `me`.
    pub fn recipients(&self, me: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.email != me && !m.pending)
            .map(|m| m.email.clone())
            .collect()
    }

    fn settle(&mut self, me: &str) {
        if self.only_self(me) {
            self.members.clear();
            return;
        }
        if !self.contains(me) {
            self.members.push(Member::new(me));
        }
    }
}
