//! Data models
//!
//! Rust structs representing the entities the federation engine operates
//! on. Ids are [`crate::id::EntityId`] strings; timestamps use chrono.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::EntityId;

// =============================================================================
// Actor
// =============================================================================

/// ActivityPub actor kinds handled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    Person,
    Service,
    Group,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "Person",
            Self::Service => "Service",
            Self::Group => "Group",
        }
    }

    /// Parse an actor type from its wire value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Person" => Some(Self::Person),
            "Service" | "Application" => Some(Self::Service),
            "Group" | "Organization" => Some(Self::Group),
            _ => None,
        }
    }
}

/// A federated identity, local or remote.
///
/// `(username, domain)` is unique; `domain` is `None` for local actors.
/// Remote actors carry a `fetched_at` freshness stamp and are re-fetched
/// once stale or when an `Update` names them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    /// Canonical ActivityPub URI, taken from the fetched document's `id`
    pub ap_id: String,
    pub username: String,
    /// None for local actors
    pub domain: Option<String>,
    pub display_name: Option<String>,
    /// Profile text (HTML)
    pub summary: Option<String>,
    pub inbox_uri: String,
    /// Server-wide inbox advertised in `endpoints.sharedInbox`
    pub shared_inbox_uri: Option<String>,
    pub outbox_uri: Option<String>,
    pub followers_uri: Option<String>,
    pub following_uri: Option<String>,
    /// RSA public key (PEM format), always present
    pub public_key_pem: String,
    /// RSA private key (PEM format), local actors only
    pub private_key_pem: Option<String>,
    pub actor_type: ActorType,
    /// Manually approves followers
    pub locked: bool,
    pub bot: bool,
    pub suspended: bool,
    pub discoverable: bool,
    pub followers_count: i64,
    pub following_count: i64,
    pub statuses_count: i64,
    /// When this remote actor was last fetched
    pub fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.domain.is_none()
    }

    /// `user@domain` handle; bare username for local actors.
    pub fn acct(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}@{}", self.username, domain),
            None => self.username.clone(),
        }
    }

    /// Key id advertised in the actor document and used in `Signature`
    /// headers.
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.ap_id)
    }

    /// Inbox to use for broadcast deliveries: the shared inbox when the
    /// actor's server advertises one, the personal inbox otherwise.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox_uri.as_deref().unwrap_or(&self.inbox_uri)
    }
}

// =============================================================================
// Status (content object)
// =============================================================================

/// Content object kinds handled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    Note,
    Article,
    Question,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Note => "Note",
            Self::Article => "Article",
            Self::Question => "Question",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Note" => Some(Self::Note),
            "Article" => Some(Self::Article),
            "Question" => Some(Self::Question),
            _ => None,
        }
    }
}

/// Audience visibility of a status.
///
/// Fixed at publication for audience computation; edits change the body,
/// never the recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Private => "private",
            Self::Direct => "direct",
        }
    }
}

/// A unit of published content
///
/// Created by local publish or by an inbound `Create`; mutated by `Update`
/// with an edit snapshot recorded first; removed by `Delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub id: String,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    pub object_type: ObjectType,
    /// Owning actor's ap_id
    pub account_ap_id: String,
    /// HTML content (sanitized for remote statuses)
    pub content: String,
    /// Plain-text rendering of the content
    pub text: String,
    pub visibility: Visibility,
    pub sensitive: bool,
    /// Content warning shown before sensitive content
    pub spoiler_text: Option<String>,
    pub in_reply_to_uri: Option<String>,
    pub conversation_uri: Option<String>,
    pub language: Option<String>,
    /// true if authored on this node
    pub local: bool,
    pub replies_count: i64,
    pub reblogs_count: i64,
    pub favourites_count: i64,
    pub published_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

/// Snapshot of a status body taken before an Update mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEdit {
    pub id: String,
    pub status_uri: String,
    pub content: String,
    pub spoiler_text: Option<String>,
    pub sensitive: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Activity
// =============================================================================

/// The closed set of activity verbs the engine dispatches on.
///
/// Unknown wire values map to `Unsupported` and take the generic
/// drop-and-log path, per the protocol's extension tolerance requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Like,
    Announce,
    Unsupported(String),
}

impl ActivityType {
    /// Parse an activity type from its wire value.
    pub fn parse(s: &str) -> Self {
        match s {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Undo" => Self::Undo,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            other => Self::Unsupported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Unsupported(other) => other,
        }
    }
}

/// Protocol envelope representing one action.
///
/// `uri` is globally unique and is the idempotency key for the whole
/// engine. After dispatch, rows are only mutated to record processing and
/// delivery status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    /// Activity URI (globally unique idempotency key)
    pub uri: String,
    pub activity_type: ActivityType,
    pub actor_ap_id: String,
    pub object_uri: Option<String>,
    pub target_uri: Option<String>,
    /// true if originated on this node
    pub local: bool,
    pub processed: bool,
    pub delivered: bool,
    pub delivery_attempts: i64,
    pub last_delivery_error: Option<String>,
    pub published_at: DateTime<Utc>,
}

impl Activity {
    /// Build a local activity envelope ready for delivery tracking.
    pub fn local(
        uri: String,
        activity_type: ActivityType,
        actor_ap_id: String,
        object_uri: Option<String>,
    ) -> Self {
        Self {
            id: EntityId::generate().to_string(),
            uri,
            activity_type,
            actor_ap_id,
            object_uri,
            target_uri: None,
            local: true,
            processed: true,
            delivered: false,
            delivery_attempts: 0,
            last_delivery_error: None,
            published_at: Utc::now(),
        }
    }

    /// Build an envelope for an activity received from a remote actor.
    pub fn remote(
        uri: String,
        activity_type: ActivityType,
        actor_ap_id: String,
        object_uri: Option<String>,
    ) -> Self {
        Self {
            id: EntityId::generate().to_string(),
            uri,
            activity_type,
            actor_ap_id,
            object_uri,
            target_uri: None,
            local: false,
            processed: false,
            delivered: false,
            delivery_attempts: 0,
            last_delivery_error: None,
            published_at: Utc::now(),
        }
    }
}

// =============================================================================
// Follow relationships
// =============================================================================

/// State of a follow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowState {
    Pending,
    Accepted,
}

/// A directed follow edge (actor -> target actor).
///
/// Unique per ordered pair; self-follows are rejected by the store. The
/// accepted transition and the deletion each pair with counter deltas so
/// counters always equal a recomputable aggregate over this table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Follow {
    pub id: String,
    /// Follower's ap_id
    pub actor_ap_id: String,
    /// Followee's ap_id
    pub target_ap_id: String,
    /// Follow activity URI
    pub uri: String,
    pub state: FollowState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Favourite / Reblog edges
// =============================================================================

/// Favourite (like) edge against a status, unique per (actor, status).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Favourite {
    pub id: String,
    pub actor_ap_id: String,
    pub status_uri: String,
    /// Like activity URI
    pub uri: String,
    pub created_at: DateTime<Utc>,
}

/// Reblog (boost) edge against a status, unique per (actor, status).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reblog {
    pub id: String,
    pub actor_ap_id: String,
    pub status_uri: String,
    /// Announce activity URI
    pub uri: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Relay
// =============================================================================

/// State of a relay subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Idle,
    Pending,
    Accepted,
}

/// A registered broadcast peer.
///
/// Lifecycle mirrors a Follow but targets a whole server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    pub id: String,
    pub inbox_uri: String,
    pub state: RelayState,
    /// URI of the Follow activity sent to subscribe
    pub follow_activity_uri: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Notifications
// =============================================================================

/// Notification types emitted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Follow,
    Mention,
    Favourite,
    Reblog,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Mention => "mention",
            Self::Favourite => "favourite",
            Self::Reblog => "reblog",
        }
    }
}

/// Notification for a local actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub notification_type: NotificationType,
    /// Recipient (local actor) ap_id
    pub account_ap_id: String,
    /// Who triggered this notification
    pub origin_ap_id: String,
    /// Related status URI (if applicable)
    pub status_uri: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        notification_type: NotificationType,
        account_ap_id: String,
        origin_ap_id: String,
        status_uri: Option<String>,
    ) -> Self {
        Self {
            id: EntityId::generate().to_string(),
            notification_type,
            account_ap_id,
            origin_ap_id,
            status_uri,
            read: false,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_type_round_trips_known_verbs() {
        for verb in [
            "Create", "Update", "Delete", "Follow", "Accept", "Reject", "Undo", "Like", "Announce",
        ] {
            assert_eq!(ActivityType::parse(verb).as_str(), verb);
        }
    }

    #[test]
    fn activity_type_preserves_unknown_verbs() {
        let parsed = ActivityType::parse("Arrive");
        assert_eq!(parsed, ActivityType::Unsupported("Arrive".to_string()));
        assert_eq!(parsed.as_str(), "Arrive");
    }

    #[test]
    fn actor_delivery_inbox_prefers_shared_inbox() {
        let mut actor = test_actor();
        assert_eq!(actor.delivery_inbox(), "https://remote.example/users/bob/inbox");

        actor.shared_inbox_uri = Some("https://remote.example/inbox".to_string());
        assert_eq!(actor.delivery_inbox(), "https://remote.example/inbox");
    }

    #[test]
    fn acct_includes_domain_only_for_remote_actors() {
        let mut actor = test_actor();
        assert_eq!(actor.acct(), "bob@remote.example");

        actor.domain = None;
        assert_eq!(actor.acct(), "bob");
    }

    fn test_actor() -> Actor {
        Actor {
            id: EntityId::generate().to_string(),
            ap_id: "https://remote.example/users/bob".to_string(),
            username: "bob".to_string(),
            domain: Some("remote.example".to_string()),
            display_name: None,
            summary: None,
            inbox_uri: "https://remote.example/users/bob/inbox".to_string(),
            shared_inbox_uri: None,
            outbox_uri: None,
            followers_uri: None,
            following_uri: None,
            public_key_pem: "pem".to_string(),
            private_key_pem: None,
            actor_type: ActorType::Person,
            locked: false,
            bot: false,
            suspended: false,
            discoverable: true,
            followers_count: 0,
            following_count: 0,
            statuses_count: 0,
            fetched_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
