//! Store abstraction
//!
//! Persistence is an external collaborator: the engine consumes it only
//! through this trait ("persist/find by id or unique key" plus the state
//! transitions that carry counter deltas). Implementations must provide
//! unique-constraint semantics for activity URIs, follow pairs, and
//! favourite/reblog pairs, and must apply counter deltas atomically with
//! the transition that causes them.

use async_trait::async_trait;

use crate::data::models::{
    Activity, Actor, Favourite, Follow, Notification, Reblog, Relay, RelayState, Status, StatusEdit,
};
use crate::error::Result;

/// A resolved delivery recipient.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub ap_id: String,
    pub inbox_uri: String,
    /// Server-wide inbox, when the recipient's server advertises one
    pub shared_inbox_uri: Option<String>,
}

impl Recipient {
    /// Inbox to use for broadcast deliveries (shared inbox preferred).
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox_uri.as_deref().unwrap_or(&self.inbox_uri)
    }
}

/// Counter adjustments applied by [`Store::reconcile_counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub actors_adjusted: usize,
    pub statuses_adjusted: usize,
}

/// Persistence operations consumed by the federation engine.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Actors ---------------------------------------------------------

    /// Insert or update an actor keyed by `ap_id`.
    async fn upsert_actor(&self, actor: &Actor) -> Result<()>;

    async fn actor_by_ap_id(&self, ap_id: &str) -> Result<Option<Actor>>;

    /// Look up by the `(username, domain)` unique key. `domain = None`
    /// selects local actors.
    async fn actor_by_acct(&self, username: &str, domain: Option<&str>) -> Result<Option<Actor>>;

    async fn local_actors(&self) -> Result<Vec<Actor>>;

    // -- Statuses -------------------------------------------------------

    /// Insert a status. Bumps the author's statuses count, and the parent
    /// status's replies count when this is a reply to a known status.
    async fn insert_status(&self, status: &Status) -> Result<()>;

    async fn status_by_uri(&self, uri: &str) -> Result<Option<Status>>;

    /// Apply an edit to the mutable body fields. Visibility and audience
    /// are immutable once published.
    async fn update_status_content(
        &self,
        uri: &str,
        content: &str,
        text: &str,
        sensitive: bool,
        spoiler_text: Option<&str>,
    ) -> Result<()>;

    /// Remove a status. Decrements the author's statuses count and the
    /// parent's replies count. Returns false when the URI is unknown.
    async fn delete_status(&self, uri: &str) -> Result<bool>;

    async fn insert_status_edit(&self, edit: &StatusEdit) -> Result<()>;

    // -- Activities -----------------------------------------------------

    /// Insert an activity envelope.
    ///
    /// # Errors
    /// Returns [`crate::error::AppError::DuplicateActivity`] when an
    /// activity with the same URI already exists. This is the engine-wide
    /// idempotency check.
    async fn insert_activity(&self, activity: &Activity) -> Result<()>;

    async fn activity_by_uri(&self, uri: &str) -> Result<Option<Activity>>;

    async fn mark_activity_processed(&self, uri: &str) -> Result<()>;

    /// Record the outcome of one delivery attempt.
    async fn record_delivery_attempt(
        &self,
        uri: &str,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<()>;

    async fn mark_activity_delivered(&self, uri: &str) -> Result<()>;

    // -- Follows --------------------------------------------------------

    /// Insert a follow edge.
    ///
    /// # Errors
    /// Validation error for self-follows or a duplicate ordered pair.
    async fn insert_follow(&self, follow: &Follow) -> Result<()>;

    async fn follow_by_pair(&self, actor_ap_id: &str, target_ap_id: &str)
        -> Result<Option<Follow>>;

    async fn follow_by_uri(&self, uri: &str) -> Result<Option<Follow>>;

    /// Transition a follow to accepted. Increments the target's followers
    /// count and the actor's following count in the same operation, only
    /// when the state actually changes. Returns whether it changed.
    async fn accept_follow(&self, uri: &str) -> Result<bool>;

    /// Delete a follow edge, decrementing counters when it was accepted.
    /// Returns the removed edge, if any.
    async fn remove_follow(&self, uri: &str) -> Result<Option<Follow>>;

    // -- Favourites / Reblogs -------------------------------------------

    /// Insert a favourite edge and bump the status counter. Returns false
    /// (no counter change) when the (actor, status) pair already exists.
    async fn insert_favourite(&self, favourite: &Favourite) -> Result<bool>;

    /// Remove a favourite edge and decrement the counter. Returns false
    /// when no edge existed.
    async fn remove_favourite(&self, actor_ap_id: &str, status_uri: &str) -> Result<bool>;

    async fn insert_reblog(&self, reblog: &Reblog) -> Result<bool>;

    async fn remove_reblog(&self, actor_ap_id: &str, status_uri: &str) -> Result<bool>;

    // -- Recipients -----------------------------------------------------

    /// Accepted followers of a local actor, as delivery recipients.
    async fn follower_recipients(&self, target_ap_id: &str) -> Result<Vec<Recipient>>;

    // -- Relays ---------------------------------------------------------

    async fn upsert_relay(&self, relay: &Relay) -> Result<()>;

    async fn relay_by_inbox(&self, inbox_uri: &str) -> Result<Option<Relay>>;

    async fn relay_by_follow_uri(&self, uri: &str) -> Result<Option<Relay>>;

    async fn set_relay_state(&self, inbox_uri: &str, state: RelayState) -> Result<()>;

    async fn record_relay_error(&self, inbox_uri: &str, error: &str) -> Result<()>;

    async fn accepted_relays(&self) -> Result<Vec<Relay>>;

    // -- Notifications --------------------------------------------------

    async fn insert_notification(&self, notification: &Notification) -> Result<()>;

    // -- Seen-id lookup -------------------------------------------------

    /// Whether a status or activity with this URI is already known.
    /// Performed once at the top of the relay path for loop prevention.
    async fn object_known(&self, uri: &str) -> Result<bool>;

    // -- Maintenance ----------------------------------------------------

    /// Recompute denormalized counters from edge tables, correcting any
    /// drift. Runs out of core on an interval.
    async fn reconcile_counters(&self) -> Result<ReconcileReport>;
}
