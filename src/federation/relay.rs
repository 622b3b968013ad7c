//! Relay bridge
//!
//! Server-to-server broadcast relays, both directions. Outbound: public
//! local statuses are mirrored to accepted relay inboxes as Announce
//! activities referencing the object by URI only. Inbound: a
//! relay-forwarded Announce of unknown content is expanded by fetching the
//! object and its author, persisted as non-local with forced public
//! visibility. Both paths start with one seen-id lookup; already-seen ids
//! are never re-broadcast.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::data::{
    Activity, ActivityType, Actor, ObjectType, Relay, RelayState, Status, Store, Visibility,
};
use crate::error::AppError;
use crate::federation::content::{self, PUBLIC_COLLECTION};
use crate::federation::inbound::DispatchOutcome;
use crate::federation::outbound::{DeliveryService, builder};
use crate::federation::resolver::ActorResolver;
use crate::federation::signature::Signer;
use crate::id::EntityId;
use crate::metrics::{ACTIVITIES_DROPPED, ACTIVITIES_SENT};

/// Bridges the engine to broadcast relays.
pub struct RelayBridge {
    store: Arc<dyn Store>,
    resolver: Arc<ActorResolver>,
    delivery: Arc<DeliveryService>,
    /// ap_id of the instance service actor that signs relay traffic
    instance_actor_ap_id: String,
}

impl RelayBridge {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<ActorResolver>,
        delivery: Arc<DeliveryService>,
        instance_actor_ap_id: String,
    ) -> Self {
        Self {
            store,
            resolver,
            delivery,
            instance_actor_ap_id,
        }
    }

    /// Subscribe to a relay: register it pending and send a Follow of the
    /// public collection from the instance actor.
    pub async fn subscribe(&self, inbox_uri: &str) -> Result<Relay, AppError> {
        let instance_actor = self.instance_actor().await?;
        let follow_uri = self.delivery.activity_uri(&instance_actor, "follow");

        let relay = Relay {
            id: EntityId::generate().to_string(),
            inbox_uri: inbox_uri.to_string(),
            state: RelayState::Pending,
            follow_activity_uri: Some(follow_uri.clone()),
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.upsert_relay(&relay).await?;

        let activity = Activity::local(
            follow_uri.clone(),
            ActivityType::Follow,
            instance_actor.ap_id.clone(),
            Some(PUBLIC_COLLECTION.to_string()),
        );
        self.store.insert_activity(&activity).await?;

        let signer = Signer::for_actor(&instance_actor)?;
        let body = builder::follow(&follow_uri, &instance_actor.ap_id, PUBLIC_COLLECTION);

        ACTIVITIES_SENT.with_label_values(&["Follow"]).inc();
        if let Err(error) = self
            .delivery
            .deliver_tracked(&activity.uri, &body, inbox_uri, &signer)
            .await
        {
            self.store
                .record_relay_error(inbox_uri, &error.to_string())
                .await?;
            self.store
                .set_relay_state(inbox_uri, RelayState::Idle)
                .await?;
            return Err(error);
        }

        Ok(relay)
    }

    /// Unsubscribe from a relay: Undo the original Follow and return the
    /// registration to idle.
    pub async fn unsubscribe(&self, inbox_uri: &str) -> Result<(), AppError> {
        let relay = self
            .store
            .relay_by_inbox(inbox_uri)
            .await?
            .ok_or(AppError::NotFound)?;
        let Some(follow_uri) = relay.follow_activity_uri else {
            return self.store.set_relay_state(inbox_uri, RelayState::Idle).await;
        };

        let instance_actor = self.instance_actor().await?;
        if let Some(follow_activity) = self.store.activity_by_uri(&follow_uri).await? {
            self.delivery
                .send_undo(&instance_actor, &follow_activity, inbox_uri)
                .await?;
        }
        self.store.set_relay_state(inbox_uri, RelayState::Idle).await
    }

    /// The relay approved our subscription Follow.
    ///
    /// Returns false when the URI does not belong to a relay
    /// subscription.
    pub async fn handle_accept(&self, follow_uri: &str) -> Result<bool, AppError> {
        let Some(relay) = self.store.relay_by_follow_uri(follow_uri).await? else {
            return Ok(false);
        };
        self.store
            .set_relay_state(&relay.inbox_uri, RelayState::Accepted)
            .await?;
        tracing::info!(inbox = %relay.inbox_uri, "Relay subscription accepted");
        Ok(true)
    }

    /// The relay refused our subscription Follow.
    pub async fn handle_reject(&self, follow_uri: &str) -> Result<bool, AppError> {
        let Some(relay) = self.store.relay_by_follow_uri(follow_uri).await? else {
            return Ok(false);
        };
        self.store
            .record_relay_error(&relay.inbox_uri, "Subscription rejected")
            .await?;
        self.store
            .set_relay_state(&relay.inbox_uri, RelayState::Idle)
            .await?;
        tracing::info!(inbox = %relay.inbox_uri, "Relay subscription rejected");
        Ok(true)
    }

    /// Mirror a public local status to all accepted relays.
    ///
    /// The Announce references the object by URI only; relays fetch the
    /// body themselves, so the content travels once. Returns whether a
    /// broadcast happened.
    pub async fn mirror_status(&self, status: &Status) -> Result<bool, AppError> {
        if !status.local || status.visibility != Visibility::Public {
            return Ok(false);
        }

        // Seen-id check before any fan-out decision: a status already
        // announced to relays is never re-broadcast.
        let announce_uri = format!("{}#relay-announce", status.uri);
        if self.store.object_known(&announce_uri).await? {
            return Ok(false);
        }

        let relays = self.store.accepted_relays().await?;
        if relays.is_empty() {
            return Ok(false);
        }

        let instance_actor = self.instance_actor().await?;
        let signer = Signer::for_actor(&instance_actor)?;
        let to = vec![PUBLIC_COLLECTION.to_string()];
        let body = builder::announce(&announce_uri, &instance_actor.ap_id, &status.uri, &to, &[]);

        let activity = Activity::local(
            announce_uri.clone(),
            ActivityType::Announce,
            instance_actor.ap_id.clone(),
            Some(status.uri.clone()),
        );
        self.store.insert_activity(&activity).await?;

        let inboxes = relays.into_iter().map(|relay| relay.inbox_uri).collect();
        ACTIVITIES_SENT.with_label_values(&["Announce"]).inc();
        self.delivery
            .fan_out(&announce_uri, &body, inboxes, &signer)
            .await;
        Ok(true)
    }

    /// Expand a relay-forwarded Announce of unknown content.
    ///
    /// Fetches the referenced object and its author, then persists the
    /// object as non-local with visibility forced to public: relay traffic
    /// has no meaningful followers-only semantics here.
    pub async fn expand_announce(&self, object_uri: &str) -> Result<DispatchOutcome, AppError> {
        // Seen-id check at the top of the path.
        if self.store.object_known(object_uri).await? {
            return Ok(DispatchOutcome::Duplicate);
        }

        let object = self.resolver.fetch_object(object_uri).await?;

        let Some(object_type) = object
            .get("type")
            .and_then(Value::as_str)
            .and_then(ObjectType::parse)
        else {
            ACTIVITIES_DROPPED
                .with_label_values(&["unsupported-object"])
                .inc();
            return Ok(DispatchOutcome::Dropped);
        };

        let canonical_uri = object
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(object_uri)
            .to_string();
        if canonical_uri != object_uri && self.store.object_known(&canonical_uri).await? {
            return Ok(DispatchOutcome::Duplicate);
        }

        let author_uri = object
            .get("attributedTo")
            .and_then(|attributed| {
                attributed
                    .as_str()
                    .or_else(|| attributed.get("id").and_then(Value::as_str))
            })
            .ok_or_else(|| {
                AppError::ActorFetch(format!("Object {} has no attributedTo", object_uri))
            })?;
        let author = self.resolver.resolve_uri(author_uri).await?;

        let content_html = content::sanitize_html(
            object.get("content").and_then(Value::as_str).unwrap_or(""),
        );
        let text = content::plain_text(&content_html);
        let published_at = object
            .get("published")
            .and_then(Value::as_str)
            .and_then(|published| chrono::DateTime::parse_from_rfc3339(published).ok())
            .map(|timestamp| timestamp.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let status = Status {
            id: EntityId::generate().to_string(),
            uri: canonical_uri,
            object_type,
            account_ap_id: author.ap_id.clone(),
            content: content_html,
            text,
            // Forced public, never unlisted: see module docs.
            visibility: Visibility::Public,
            sensitive: object
                .get("sensitive")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            spoiler_text: object
                .get("summary")
                .and_then(Value::as_str)
                .map(str::to_string),
            in_reply_to_uri: object
                .get("inReplyTo")
                .and_then(Value::as_str)
                .map(str::to_string),
            conversation_uri: None,
            language: None,
            local: false,
            replies_count: 0,
            reblogs_count: 0,
            favourites_count: 0,
            published_at,
            edited_at: None,
        };
        self.store.insert_status(&status).await?;

        tracing::info!(status = %status.uri, author = %author.ap_id, "Expanded relay announce");
        Ok(DispatchOutcome::Processed)
    }

    async fn instance_actor(&self) -> Result<Actor, AppError> {
        self.store
            .actor_by_ap_id(&self.instance_actor_ap_id)
            .await?
            .ok_or_else(|| {
                AppError::Config(format!(
                    "Instance actor {} is not provisioned",
                    self.instance_actor_ap_id
                ))
            })
    }
}
