//! In-memory reference store
//!
//! Backs tests and single-node development. All tables live behind one
//! `RwLock`, so every state transition and its paired counter delta commit
//! together; a relational implementation gets the same effect from
//! transactions and row locks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::data::models::{
    Activity, Actor, Favourite, Follow, FollowState, Notification, Reblog, Relay, RelayState,
    Status, StatusEdit,
};
use crate::data::store::{Recipient, ReconcileReport, Store};
use crate::error::{AppError, Result};

#[derive(Default)]
struct Inner {
    /// ap_id -> actor
    actors: HashMap<String, Actor>,
    /// status uri -> status
    statuses: HashMap<String, Status>,
    status_edits: Vec<StatusEdit>,
    /// activity uri -> activity
    activities: HashMap<String, Activity>,
    /// follow activity uri -> follow
    follows: HashMap<String, Follow>,
    favourites: Vec<Favourite>,
    reblogs: Vec<Reblog>,
    /// inbox uri -> relay
    relays: HashMap<String, Relay>,
    notifications: Vec<Notification>,
}

/// In-memory [`Store`] implementation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications recorded so far; used by tests to observe dispatcher
    /// side effects.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.read().await.notifications.clone()
    }

    /// Favourite edges recorded so far.
    pub async fn favourites(&self) -> Vec<Favourite> {
        self.inner.read().await.favourites.clone()
    }

    /// Reblog edges recorded so far.
    pub async fn reblogs(&self) -> Vec<Reblog> {
        self.inner.read().await.reblogs.clone()
    }

    /// Status edit snapshots recorded so far.
    pub async fn status_edits(&self) -> Vec<StatusEdit> {
        self.inner.read().await.status_edits.clone()
    }
}

fn bump(counter: &mut i64, delta: i64) {
    *counter = (*counter + delta).max(0);
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_actor(&self, actor: &Actor) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.actors.insert(actor.ap_id.clone(), actor.clone());
        Ok(())
    }

    async fn actor_by_ap_id(&self, ap_id: &str) -> Result<Option<Actor>> {
        Ok(self.inner.read().await.actors.get(ap_id).cloned())
    }

    async fn actor_by_acct(&self, username: &str, domain: Option<&str>) -> Result<Option<Actor>> {
        let inner = self.inner.read().await;
        Ok(inner
            .actors
            .values()
            .find(|actor| {
                actor.username.eq_ignore_ascii_case(username)
                    && actor.domain.as_deref().map(str::to_ascii_lowercase)
                        == domain.map(str::to_ascii_lowercase)
            })
            .cloned())
    }

    async fn local_actors(&self) -> Result<Vec<Actor>> {
        let inner = self.inner.read().await;
        Ok(inner
            .actors
            .values()
            .filter(|actor| actor.is_local())
            .cloned()
            .collect())
    }

    async fn insert_status(&self, status: &Status) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.statuses.contains_key(&status.uri) {
            return Ok(());
        }

        if let Some(author) = inner.actors.get_mut(&status.account_ap_id) {
            bump(&mut author.statuses_count, 1);
        }
        if let Some(parent_uri) = status.in_reply_to_uri.clone() {
            if let Some(parent) = inner.statuses.get_mut(&parent_uri) {
                bump(&mut parent.replies_count, 1);
            }
        }
        inner.statuses.insert(status.uri.clone(), status.clone());
        Ok(())
    }

    async fn status_by_uri(&self, uri: &str) -> Result<Option<Status>> {
        Ok(self.inner.read().await.statuses.get(uri).cloned())
    }

    async fn update_status_content(
        &self,
        uri: &str,
        content: &str,
        text: &str,
        sensitive: bool,
        spoiler_text: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let status = inner
            .statuses
            .get_mut(uri)
            .ok_or(AppError::NotFound)?;
        status.content = content.to_string();
        status.text = text.to_string();
        status.sensitive = sensitive;
        status.spoiler_text = spoiler_text.map(str::to_string);
        status.edited_at = Some(Utc::now());
        Ok(())
    }

    async fn delete_status(&self, uri: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(status) = inner.statuses.remove(uri) else {
            return Ok(false);
        };

        if let Some(author) = inner.actors.get_mut(&status.account_ap_id) {
            bump(&mut author.statuses_count, -1);
        }
        if let Some(parent_uri) = status.in_reply_to_uri {
            if let Some(parent) = inner.statuses.get_mut(&parent_uri) {
                bump(&mut parent.replies_count, -1);
            }
        }
        Ok(true)
    }

    async fn insert_status_edit(&self, edit: &StatusEdit) -> Result<()> {
        self.inner.write().await.status_edits.push(edit.clone());
        Ok(())
    }

    async fn insert_activity(&self, activity: &Activity) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.activities.contains_key(&activity.uri) {
            return Err(AppError::DuplicateActivity);
        }
        inner
            .activities
            .insert(activity.uri.clone(), activity.clone());
        Ok(())
    }

    async fn activity_by_uri(&self, uri: &str) -> Result<Option<Activity>> {
        Ok(self.inner.read().await.activities.get(uri).cloned())
    }

    async fn mark_activity_processed(&self, uri: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(activity) = inner.activities.get_mut(uri) {
            activity.processed = true;
        }
        Ok(())
    }

    async fn record_delivery_attempt(
        &self,
        uri: &str,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(activity) = inner.activities.get_mut(uri) {
            activity.delivery_attempts = i64::from(attempts);
            activity.last_delivery_error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn mark_activity_delivered(&self, uri: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(activity) = inner.activities.get_mut(uri) {
            activity.delivered = true;
            activity.last_delivery_error = None;
        }
        Ok(())
    }

    async fn insert_follow(&self, follow: &Follow) -> Result<()> {
        if follow.actor_ap_id == follow.target_ap_id {
            return Err(AppError::Validation("Self-follow is not allowed".to_string()));
        }

        let mut inner = self.inner.write().await;
        let pair_exists = inner.follows.values().any(|existing| {
            existing.actor_ap_id == follow.actor_ap_id
                && existing.target_ap_id == follow.target_ap_id
        });
        if pair_exists || inner.follows.contains_key(&follow.uri) {
            return Err(AppError::Validation(format!(
                "Follow already exists: {} -> {}",
                follow.actor_ap_id, follow.target_ap_id
            )));
        }

        inner.follows.insert(follow.uri.clone(), follow.clone());
        Ok(())
    }

    async fn follow_by_pair(
        &self,
        actor_ap_id: &str,
        target_ap_id: &str,
    ) -> Result<Option<Follow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .follows
            .values()
            .find(|follow| {
                follow.actor_ap_id == actor_ap_id && follow.target_ap_id == target_ap_id
            })
            .cloned())
    }

    async fn follow_by_uri(&self, uri: &str) -> Result<Option<Follow>> {
        Ok(self.inner.read().await.follows.get(uri).cloned())
    }

    async fn accept_follow(&self, uri: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(follow) = inner.follows.get_mut(uri) else {
            return Ok(false);
        };
        if follow.state == FollowState::Accepted {
            return Ok(false);
        }

        follow.state = FollowState::Accepted;
        follow.updated_at = Utc::now();
        let actor_ap_id = follow.actor_ap_id.clone();
        let target_ap_id = follow.target_ap_id.clone();

        if let Some(target) = inner.actors.get_mut(&target_ap_id) {
            bump(&mut target.followers_count, 1);
        }
        if let Some(actor) = inner.actors.get_mut(&actor_ap_id) {
            bump(&mut actor.following_count, 1);
        }
        Ok(true)
    }

    async fn remove_follow(&self, uri: &str) -> Result<Option<Follow>> {
        let mut inner = self.inner.write().await;
        let Some(follow) = inner.follows.remove(uri) else {
            return Ok(None);
        };

        if follow.state == FollowState::Accepted {
            if let Some(target) = inner.actors.get_mut(&follow.target_ap_id) {
                bump(&mut target.followers_count, -1);
            }
            if let Some(actor) = inner.actors.get_mut(&follow.actor_ap_id) {
                bump(&mut actor.following_count, -1);
            }
        }
        Ok(Some(follow))
    }

    async fn insert_favourite(&self, favourite: &Favourite) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let exists = inner.favourites.iter().any(|existing| {
            existing.actor_ap_id == favourite.actor_ap_id
                && existing.status_uri == favourite.status_uri
        });
        if exists {
            return Ok(false);
        }

        if let Some(status) = inner.statuses.get_mut(&favourite.status_uri) {
            bump(&mut status.favourites_count, 1);
        }
        inner.favourites.push(favourite.clone());
        Ok(true)
    }

    async fn remove_favourite(&self, actor_ap_id: &str, status_uri: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.favourites.len();
        inner.favourites.retain(|existing| {
            !(existing.actor_ap_id == actor_ap_id && existing.status_uri == status_uri)
        });
        let removed = inner.favourites.len() < before;

        if removed {
            if let Some(status) = inner.statuses.get_mut(status_uri) {
                bump(&mut status.favourites_count, -1);
            }
        }
        Ok(removed)
    }

    async fn insert_reblog(&self, reblog: &Reblog) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let exists = inner.reblogs.iter().any(|existing| {
            existing.actor_ap_id == reblog.actor_ap_id && existing.status_uri == reblog.status_uri
        });
        if exists {
            return Ok(false);
        }

        if let Some(status) = inner.statuses.get_mut(&reblog.status_uri) {
            bump(&mut status.reblogs_count, 1);
        }
        inner.reblogs.push(reblog.clone());
        Ok(true)
    }

    async fn remove_reblog(&self, actor_ap_id: &str, status_uri: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.reblogs.len();
        inner.reblogs.retain(|existing| {
            !(existing.actor_ap_id == actor_ap_id && existing.status_uri == status_uri)
        });
        let removed = inner.reblogs.len() < before;

        if removed {
            if let Some(status) = inner.statuses.get_mut(status_uri) {
                bump(&mut status.reblogs_count, -1);
            }
        }
        Ok(removed)
    }

    async fn follower_recipients(&self, target_ap_id: &str) -> Result<Vec<Recipient>> {
        let inner = self.inner.read().await;
        let mut recipients = Vec::new();

        for follow in inner.follows.values() {
            if follow.target_ap_id != target_ap_id || follow.state != FollowState::Accepted {
                continue;
            }
            let Some(actor) = inner.actors.get(&follow.actor_ap_id) else {
                continue;
            };
            if actor.is_local() || actor.suspended {
                continue;
            }
            recipients.push(Recipient {
                ap_id: actor.ap_id.clone(),
                inbox_uri: actor.inbox_uri.clone(),
                shared_inbox_uri: actor.shared_inbox_uri.clone(),
            });
        }
        Ok(recipients)
    }

    async fn upsert_relay(&self, relay: &Relay) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.relays.insert(relay.inbox_uri.clone(), relay.clone());
        Ok(())
    }

    async fn relay_by_inbox(&self, inbox_uri: &str) -> Result<Option<Relay>> {
        Ok(self.inner.read().await.relays.get(inbox_uri).cloned())
    }

    async fn relay_by_follow_uri(&self, uri: &str) -> Result<Option<Relay>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relays
            .values()
            .find(|relay| relay.follow_activity_uri.as_deref() == Some(uri))
            .cloned())
    }

    async fn set_relay_state(&self, inbox_uri: &str, state: RelayState) -> Result<()> {
        let mut inner = self.inner.write().await;
        let relay = inner.relays.get_mut(inbox_uri).ok_or(AppError::NotFound)?;
        relay.state = state;
        relay.updated_at = Utc::now();
        Ok(())
    }

    async fn record_relay_error(&self, inbox_uri: &str, error: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let relay = inner.relays.get_mut(inbox_uri).ok_or(AppError::NotFound)?;
        relay.attempts += 1;
        relay.last_error = Some(error.to_string());
        relay.updated_at = Utc::now();
        Ok(())
    }

    async fn accepted_relays(&self) -> Result<Vec<Relay>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relays
            .values()
            .filter(|relay| relay.state == RelayState::Accepted)
            .cloned()
            .collect())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.inner
            .write()
            .await
            .notifications
            .push(notification.clone());
        Ok(())
    }

    async fn object_known(&self, uri: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.statuses.contains_key(uri) || inner.activities.contains_key(uri))
    }

    async fn reconcile_counters(&self) -> Result<ReconcileReport> {
        let mut inner = self.inner.write().await;
        let mut report = ReconcileReport::default();

        let mut followers: HashMap<String, i64> = HashMap::new();
        let mut following: HashMap<String, i64> = HashMap::new();
        for follow in inner.follows.values() {
            if follow.state == FollowState::Accepted {
                *followers.entry(follow.target_ap_id.clone()).or_default() += 1;
                *following.entry(follow.actor_ap_id.clone()).or_default() += 1;
            }
        }

        let mut statuses_by_author: HashMap<String, i64> = HashMap::new();
        let mut replies: HashMap<String, i64> = HashMap::new();
        for status in inner.statuses.values() {
            *statuses_by_author
                .entry(status.account_ap_id.clone())
                .or_default() += 1;
            if let Some(parent) = &status.in_reply_to_uri {
                *replies.entry(parent.clone()).or_default() += 1;
            }
        }

        let mut favourites: HashMap<String, i64> = HashMap::new();
        for favourite in &inner.favourites {
            *favourites.entry(favourite.status_uri.clone()).or_default() += 1;
        }
        let mut reblogs: HashMap<String, i64> = HashMap::new();
        for reblog in &inner.reblogs {
            *reblogs.entry(reblog.status_uri.clone()).or_default() += 1;
        }

        for actor in inner.actors.values_mut() {
            let expected_followers = followers.get(&actor.ap_id).copied().unwrap_or(0);
            let expected_following = following.get(&actor.ap_id).copied().unwrap_or(0);
            let expected_statuses = statuses_by_author.get(&actor.ap_id).copied().unwrap_or(0);
            if actor.followers_count != expected_followers
                || actor.following_count != expected_following
                || actor.statuses_count != expected_statuses
            {
                actor.followers_count = expected_followers;
                actor.following_count = expected_following;
                actor.statuses_count = expected_statuses;
                report.actors_adjusted += 1;
            }
        }

        for status in inner.statuses.values_mut() {
            let expected_replies = replies.get(&status.uri).copied().unwrap_or(0);
            let expected_favourites = favourites.get(&status.uri).copied().unwrap_or(0);
            let expected_reblogs = reblogs.get(&status.uri).copied().unwrap_or(0);
            if status.replies_count != expected_replies
                || status.favourites_count != expected_favourites
                || status.reblogs_count != expected_reblogs
            {
                status.replies_count = expected_replies;
                status.favourites_count = expected_favourites;
                status.reblogs_count = expected_reblogs;
                report.statuses_adjusted += 1;
            }
        }

        Ok(report)
    }
}
