//! Inbound activity dispatcher
//!
//! Turns untrusted remote JSON into validated local state transitions:
//! structural validation, the activity-id idempotency check, then
//! exhaustive dispatch over the known activity types. Unknown types are
//! dropped without error; a referenced object or actor that cannot be
//! resolved drops the single activity with a logged warning and is not
//! retried (the sender redelivers related activities independently).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::data::{
    Activity, ActivityType, Actor, Favourite, Notification, NotificationType, ObjectType, Reblog,
    Status, StatusEdit, Store,
};
use crate::error::AppError;
use crate::federation::content;
use crate::federation::outbound::DeliveryService;
use crate::federation::relay::RelayBridge;
use crate::federation::resolver::ActorResolver;
use crate::id::EntityId;
use crate::metrics::ACTIVITIES_DROPPED;

/// How the dispatcher disposed of one inbound activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Side effects applied
    Processed,
    /// Idempotency hit; no side effects re-run
    Duplicate,
    /// Dropped without side effects (unknown type, unresolvable
    /// reference, unknown object)
    Dropped,
}

/// Validated activity envelope.
///
/// Carries the fields every activity must have plus the raw object for
/// type-specific handlers.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub uri: String,
    pub activity_type: ActivityType,
    pub actor: String,
    pub object: Option<Value>,
}

impl Envelope {
    /// Structural validation: `id`, `type` and `actor` are required;
    /// every supported type also requires `object`.
    pub fn parse(raw: &Value) -> Result<Self, AppError> {
        let uri = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Activity missing id".to_string()))?
            .to_string();

        let type_str = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Activity missing type".to_string()))?;
        let activity_type = ActivityType::parse(type_str);

        let actor = raw
            .get("actor")
            .and_then(|actor| {
                actor
                    .as_str()
                    .or_else(|| actor.get("id").and_then(Value::as_str))
            })
            .ok_or_else(|| AppError::Validation("Activity missing actor".to_string()))?
            .to_string();

        let object = raw.get("object").cloned();
        if object.is_none() && !matches!(activity_type, ActivityType::Unsupported(_)) {
            return Err(AppError::Validation(format!(
                "{} activity missing object",
                activity_type.as_str()
            )));
        }

        Ok(Self {
            uri,
            activity_type,
            actor,
            object,
        })
    }

    /// The object as a URI: either a plain string or the embedded
    /// object's `id`.
    pub fn object_uri(&self) -> Option<String> {
        object_reference(self.object.as_ref()?)
    }
}

/// URI referenced by an object value (plain string or embedded `id`).
fn object_reference(object: &Value) -> Option<String> {
    object
        .as_str()
        .or_else(|| object.get("id").and_then(Value::as_str))
        .map(str::to_string)
}

/// Routes verified inbound activities to type-specific handlers.
pub struct InboundDispatcher {
    store: Arc<dyn Store>,
    resolver: Arc<ActorResolver>,
    delivery: Arc<DeliveryService>,
    relay: Arc<RelayBridge>,
    /// This node's domain, for recognizing inline mentions of local actors
    local_domain: String,
}

impl InboundDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<ActorResolver>,
        delivery: Arc<DeliveryService>,
        relay: Arc<RelayBridge>,
        local_domain: String,
    ) -> Self {
        Self {
            store,
            resolver,
            delivery,
            relay,
            local_domain,
        }
    }

    /// Process one verified inbound activity.
    ///
    /// `sender` is the actor authenticated by the HTTP signature; the
    /// activity's `actor` field must name the same identity.
    pub async fn dispatch(
        &self,
        raw: &Value,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        // 1. Structural validation.
        let envelope = Envelope::parse(raw)?;
        if envelope.actor != sender.ap_id {
            return Err(AppError::Validation(
                "Activity actor does not match signer".to_string(),
            ));
        }

        // 2. Idempotency: the activity URI is the engine-wide key. A
        // duplicate returns success without re-running side effects.
        let record = Activity::remote(
            envelope.uri.clone(),
            envelope.activity_type.clone(),
            sender.ap_id.clone(),
            envelope.object_uri(),
        );
        match self.store.insert_activity(&record).await {
            Ok(()) => {}
            Err(AppError::DuplicateActivity) => {
                tracing::debug!(uri = %envelope.uri, "Duplicate activity ignored");
                return Ok(DispatchOutcome::Duplicate);
            }
            Err(other) => return Err(other),
        }

        // 3. Type dispatch.
        let result = match &envelope.activity_type {
            ActivityType::Follow => self.handle_follow(&envelope, sender).await,
            ActivityType::Undo => self.handle_undo(&envelope, sender).await,
            ActivityType::Accept => self.handle_accept(&envelope, sender).await,
            ActivityType::Reject => self.handle_reject(&envelope, sender).await,
            ActivityType::Like => self.handle_like(&envelope, sender).await,
            ActivityType::Announce => self.handle_announce(&envelope, sender).await,
            ActivityType::Create => self.handle_create(&envelope, sender).await,
            ActivityType::Update => self.handle_update(&envelope, sender).await,
            ActivityType::Delete => self.handle_delete(&envelope, sender).await,
            ActivityType::Unsupported(other) => {
                tracing::debug!(activity_type = %other, uri = %envelope.uri, "Unsupported activity type dropped");
                ACTIVITIES_DROPPED
                    .with_label_values(&["unsupported-type"])
                    .inc();
                Ok(DispatchOutcome::Dropped)
            }
        };

        // 4. Failure policy: unresolvable references drop the single
        // activity; the remote side redelivers related activities on its
        // own schedule.
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error @ (AppError::ActorFetch(_) | AppError::Network(_))) => {
                tracing::warn!(
                    uri = %envelope.uri,
                    error = %error,
                    "Dropping activity with unresolvable reference"
                );
                ACTIVITIES_DROPPED.with_label_values(&["unresolvable"]).inc();
                DispatchOutcome::Dropped
            }
            Err(error) => return Err(error),
        };

        self.store.mark_activity_processed(&envelope.uri).await?;
        Ok(outcome)
    }

    // =========================================================================
    // Activity type handlers
    // =========================================================================

    /// Follow: create a pending edge; auto-accept unless the target
    /// manually approves followers.
    async fn handle_follow(
        &self,
        envelope: &Envelope,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        let target_uri = envelope
            .object_uri()
            .ok_or_else(|| AppError::Validation("Follow missing target".to_string()))?;

        let target = self
            .store
            .actor_by_ap_id(&target_uri)
            .await?
            .filter(Actor::is_local)
            .ok_or_else(|| {
                AppError::Validation("Follow target is not a local actor".to_string())
            })?;

        if self
            .store
            .follow_by_pair(&sender.ap_id, &target.ap_id)
            .await?
            .is_some()
        {
            tracing::debug!(
                actor = %sender.ap_id,
                target = %target.ap_id,
                "Follow edge already exists"
            );
            return Ok(DispatchOutcome::Processed);
        }

        let follow = crate::data::Follow {
            id: EntityId::generate().to_string(),
            actor_ap_id: sender.ap_id.clone(),
            target_ap_id: target.ap_id.clone(),
            uri: envelope.uri.clone(),
            state: crate::data::FollowState::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.insert_follow(&follow).await?;

        self.store
            .insert_notification(&Notification::new(
                NotificationType::Follow,
                target.ap_id.clone(),
                sender.ap_id.clone(),
                None,
            ))
            .await?;

        if !target.locked {
            self.store.accept_follow(&follow.uri).await?;

            // Deliver the Accept off the dispatch path; its retry budget
            // runs to minutes.
            let delivery = self.delivery.clone();
            let follower_inbox = sender.inbox_uri.clone();
            tokio::spawn(async move {
                if let Err(error) = delivery
                    .send_accept(&target, &follow, &follower_inbox)
                    .await
                {
                    tracing::warn!(%error, "Accept delivery failed");
                }
            });
        }

        Ok(DispatchOutcome::Processed)
    }

    /// Undo: locate the undone activity and reverse its edge.
    async fn handle_undo(
        &self,
        envelope: &Envelope,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        let object = envelope
            .object
            .as_ref()
            .ok_or_else(|| AppError::Validation("Undo missing object".to_string()))?;

        // The object is either the embedded original activity or its URI.
        let (undone_type, undone_uri, undone_object) = if let Some(uri) = object.as_str() {
            match self.store.activity_by_uri(uri).await? {
                Some(original) => (
                    original.activity_type.clone(),
                    original.uri,
                    original.object_uri,
                ),
                None => {
                    ACTIVITIES_DROPPED
                        .with_label_values(&["unknown-object"])
                        .inc();
                    return Ok(DispatchOutcome::Dropped);
                }
            }
        } else {
            let undone_type = object
                .get("type")
                .and_then(Value::as_str)
                .map(ActivityType::parse)
                .ok_or_else(|| AppError::Validation("Undo object missing type".to_string()))?;
            let uri = object
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let inner_object = object.get("object").and_then(object_reference);
            (undone_type, uri, inner_object)
        };

        match undone_type {
            ActivityType::Follow => {
                let follow = if undone_uri.is_empty() {
                    // Minimal Undo payloads omit the Follow id; fall back
                    // to the pair.
                    match undone_object {
                        Some(target) => self.store.follow_by_pair(&sender.ap_id, &target).await?,
                        None => None,
                    }
                } else {
                    self.store.follow_by_uri(&undone_uri).await?
                };

                if let Some(follow) = follow {
                    if follow.actor_ap_id != sender.ap_id {
                        return Err(AppError::Forbidden);
                    }
                    self.store.remove_follow(&follow.uri).await?;
                    tracing::info!(actor = %sender.ap_id, "Unfollowed");
                }
                Ok(DispatchOutcome::Processed)
            }
            ActivityType::Like => {
                if let Some(status_uri) = undone_object {
                    self.store
                        .remove_favourite(&sender.ap_id, &status_uri)
                        .await?;
                }
                Ok(DispatchOutcome::Processed)
            }
            ActivityType::Announce => {
                if let Some(status_uri) = undone_object {
                    self.store.remove_reblog(&sender.ap_id, &status_uri).await?;
                }
                Ok(DispatchOutcome::Processed)
            }
            _ => {
                ACTIVITIES_DROPPED
                    .with_label_values(&["unsupported-undo"])
                    .inc();
                Ok(DispatchOutcome::Dropped)
            }
        }
    }

    /// Accept: the remote side approved a Follow this node initiated
    /// (actor follow or relay subscription).
    async fn handle_accept(
        &self,
        envelope: &Envelope,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        let follow_uri = envelope
            .object_uri()
            .ok_or_else(|| AppError::Validation("Accept missing object".to_string()))?;

        if let Some(follow) = self.store.follow_by_uri(&follow_uri).await? {
            if follow.target_ap_id != sender.ap_id {
                return Err(AppError::Forbidden);
            }
            self.store.accept_follow(&follow.uri).await?;
            tracing::info!(follow = %follow.uri, "Outgoing follow accepted");
            return Ok(DispatchOutcome::Processed);
        }

        if self.relay.handle_accept(&follow_uri).await? {
            return Ok(DispatchOutcome::Processed);
        }

        ACTIVITIES_DROPPED
            .with_label_values(&["unknown-object"])
            .inc();
        Ok(DispatchOutcome::Dropped)
    }

    /// Reject: the remote side refused a Follow this node initiated.
    async fn handle_reject(
        &self,
        envelope: &Envelope,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        let follow_uri = envelope
            .object_uri()
            .ok_or_else(|| AppError::Validation("Reject missing object".to_string()))?;

        if let Some(follow) = self.store.follow_by_uri(&follow_uri).await? {
            if follow.target_ap_id != sender.ap_id {
                return Err(AppError::Forbidden);
            }
            self.store.remove_follow(&follow.uri).await?;
            tracing::info!(follow = %follow.uri, "Outgoing follow rejected");
            return Ok(DispatchOutcome::Processed);
        }

        if self.relay.handle_reject(&follow_uri).await? {
            return Ok(DispatchOutcome::Processed);
        }

        ACTIVITIES_DROPPED
            .with_label_values(&["unknown-object"])
            .inc();
        Ok(DispatchOutcome::Dropped)
    }

    /// Like: favourite edge plus counter, and a notification to the
    /// object's local owner.
    async fn handle_like(
        &self,
        envelope: &Envelope,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        let status_uri = envelope
            .object_uri()
            .ok_or_else(|| AppError::Validation("Like missing object".to_string()))?;

        let Some(status) = self.store.status_by_uri(&status_uri).await? else {
            ACTIVITIES_DROPPED
                .with_label_values(&["unknown-object"])
                .inc();
            return Ok(DispatchOutcome::Dropped);
        };

        let favourite = Favourite {
            id: EntityId::generate().to_string(),
            actor_ap_id: sender.ap_id.clone(),
            status_uri: status.uri.clone(),
            uri: envelope.uri.clone(),
            created_at: Utc::now(),
        };
        let inserted = self.store.insert_favourite(&favourite).await?;

        if inserted && status.local && status.account_ap_id != sender.ap_id {
            self.store
                .insert_notification(&Notification::new(
                    NotificationType::Favourite,
                    status.account_ap_id.clone(),
                    sender.ap_id.clone(),
                    Some(status.uri.clone()),
                ))
                .await?;
        }

        Ok(DispatchOutcome::Processed)
    }

    /// Announce: reblog edge for known objects; unknown objects take the
    /// relay expansion path.
    async fn handle_announce(
        &self,
        envelope: &Envelope,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        let object_uri = envelope
            .object_uri()
            .ok_or_else(|| AppError::Validation("Announce missing object".to_string()))?;

        let Some(status) = self.store.status_by_uri(&object_uri).await? else {
            // Relay-forwarded announce of content this node has never
            // seen: expand it by fetching the object and its author.
            return self.relay.expand_announce(&object_uri).await;
        };

        let reblog = Reblog {
            id: EntityId::generate().to_string(),
            actor_ap_id: sender.ap_id.clone(),
            status_uri: status.uri.clone(),
            uri: envelope.uri.clone(),
            created_at: Utc::now(),
        };
        let inserted = self.store.insert_reblog(&reblog).await?;

        if inserted && status.local && status.account_ap_id != sender.ap_id {
            self.store
                .insert_notification(&Notification::new(
                    NotificationType::Reblog,
                    status.account_ap_id.clone(),
                    sender.ap_id.clone(),
                    Some(status.uri.clone()),
                ))
                .await?;
        }

        Ok(DispatchOutcome::Processed)
    }

    /// Create: persist a non-local content object and notify mentioned
    /// local actors.
    async fn handle_create(
        &self,
        envelope: &Envelope,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        let object = match &envelope.object {
            Some(object) if object.is_object() => object.clone(),
            Some(reference) => {
                let uri = reference
                    .as_str()
                    .ok_or_else(|| AppError::Validation("Create object is invalid".to_string()))?;
                self.resolver.fetch_object(uri).await?
            }
            None => return Err(AppError::Validation("Create missing object".to_string())),
        };

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

        let status_uri = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Create object missing id".to_string()))?
            .to_string();

        if self.store.status_by_uri(&status_uri).await?.is_some() {
            return Ok(DispatchOutcome::Processed);
        }

        // Resolve the object's author when it is not the sender (e.g. a
        // forwarded create).
        let author_uri = object
            .get("attributedTo")
            .and_then(object_reference)
            .unwrap_or_else(|| sender.ap_id.clone());
        let author = if author_uri == sender.ap_id {
            sender.clone()
        } else {
            self.resolver.resolve_uri(&author_uri).await?
        };

        let status = self.build_remote_status(&object, object_type, &status_uri, &author);

        let hashtags = content::extract_hashtags(&status.text);
        if !hashtags.is_empty() {
            tracing::debug!(status = %status.uri, ?hashtags, "Extracted hashtags");
        }

        self.store.insert_status(&status).await?;
        self.notify_mentions(&object, &status, sender).await?;

        Ok(DispatchOutcome::Processed)
    }

    /// Update: refresh the named actor, or snapshot and mutate the named
    /// content object.
    async fn handle_update(
        &self,
        envelope: &Envelope,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        // An Update naming the sender by URI alone triggers a re-fetch.
        if let Some(uri) = envelope.object.as_ref().and_then(Value::as_str) {
            if uri == sender.ap_id {
                self.resolver.refresh_actor(uri).await?;
                return Ok(DispatchOutcome::Processed);
            }
            return Err(AppError::Validation(
                "Update requires an embedded object".to_string(),
            ));
        }

        let object = envelope
            .object
            .as_ref()
            .filter(|object| object.is_object())
            .ok_or_else(|| AppError::Validation("Update requires an embedded object".to_string()))?;

        let object_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Update object missing type".to_string()))?;

        // Actor update: merge the profile document.
        if crate::data::ActorType::parse(object_type).is_some() {
            let object_id = object.get("id").and_then(Value::as_str).unwrap_or_default();
            if object_id != sender.ap_id {
                return Err(AppError::Forbidden);
            }
            self.resolver.upsert_from_document(object).await?;
            return Ok(DispatchOutcome::Processed);
        }

        // Content update: snapshot first, then mutate the body fields.
        let Some(status_uri) = object.get("id").and_then(Value::as_str) else {
            return Err(AppError::Validation("Update object missing id".to_string()));
        };
        let Some(status) = self.store.status_by_uri(status_uri).await? else {
            ACTIVITIES_DROPPED
                .with_label_values(&["unknown-object"])
                .inc();
            return Ok(DispatchOutcome::Dropped);
        };
        if status.account_ap_id != sender.ap_id {
            return Err(AppError::Forbidden);
        }

        let content_html = content::sanitize_html(
            object.get("content").and_then(Value::as_str).unwrap_or(""),
        );
        let text = content::plain_text(&content_html);
        let sensitive = object
            .get("sensitive")
            .and_then(Value::as_bool)
            .unwrap_or(status.sensitive);
        let spoiler_text = object
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string);

        if content_html == status.content
            && sensitive == status.sensitive
            && spoiler_text == status.spoiler_text
        {
            return Ok(DispatchOutcome::Processed);
        }

        self.store
            .insert_status_edit(&StatusEdit {
                id: EntityId::generate().to_string(),
                status_uri: status.uri.clone(),
                content: status.content.clone(),
                spoiler_text: status.spoiler_text.clone(),
                sensitive: status.sensitive,
                created_at: Utc::now(),
            })
            .await?;

        self.store
            .update_status_content(
                &status.uri,
                &content_html,
                &text,
                sensitive,
                spoiler_text.as_deref(),
            )
            .await?;

        Ok(DispatchOutcome::Processed)
    }

    /// Delete: remove the referenced content object, sender-owned only.
    async fn handle_delete(
        &self,
        envelope: &Envelope,
        sender: &Actor,
    ) -> Result<DispatchOutcome, AppError> {
        let target_uri = delete_target_uri(envelope)
            .ok_or_else(|| AppError::Validation("Delete missing object".to_string()))?;

        // Actor self-deletion is an account-lifecycle concern handled
        // outside the engine.
        if target_uri == sender.ap_id {
            ACTIVITIES_DROPPED
                .with_label_values(&["actor-delete"])
                .inc();
            return Ok(DispatchOutcome::Dropped);
        }

        let Some(status) = self.store.status_by_uri(&target_uri).await? else {
            return Ok(DispatchOutcome::Processed);
        };
        if status.local || status.account_ap_id != sender.ap_id {
            tracing::debug!(
                actor = %sender.ap_id,
                status = %target_uri,
                "Delete from non-owner ignored"
            );
            return Ok(DispatchOutcome::Dropped);
        }

        self.store.delete_status(&status.uri).await?;
        Ok(DispatchOutcome::Processed)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn build_remote_status(
        &self,
        object: &Value,
        object_type: ObjectType,
        status_uri: &str,
        author: &Actor,
    ) -> Status {
        let content_html = content::sanitize_html(
            object.get("content").and_then(Value::as_str).unwrap_or(""),
        );
        let text = content::plain_text(&content_html);
        let published_at = object
            .get("published")
            .and_then(Value::as_str)
            .and_then(|published| DateTime::parse_from_rfc3339(published).ok())
            .map(|timestamp| timestamp.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Status {
            id: EntityId::generate().to_string(),
            uri: status_uri.to_string(),
            object_type,
            account_ap_id: author.ap_id.clone(),
            visibility: content::visibility_from_audience(object, author.followers_uri.as_deref()),
            content: content_html,
            text,
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
            conversation_uri: object
                .get("conversation")
                .and_then(Value::as_str)
                .map(str::to_string),
            language: None,
            local: false,
            replies_count: 0,
            reblogs_count: 0,
            favourites_count: 0,
            published_at,
            edited_at: None,
        }
    }

    /// Notify local actors mentioned by tag entries or inline handles.
    async fn notify_mentions(
        &self,
        object: &Value,
        status: &Status,
        sender: &Actor,
    ) -> Result<(), AppError> {
        let mut notified = Vec::new();

        for href in content::mention_hrefs(object) {
            if let Some(actor) = self.store.actor_by_ap_id(&href).await? {
                if actor.is_local() && actor.ap_id != sender.ap_id {
                    notified.push(actor.ap_id.clone());
                    self.store
                        .insert_notification(&Notification::new(
                            NotificationType::Mention,
                            actor.ap_id,
                            sender.ap_id.clone(),
                            Some(status.uri.clone()),
                        ))
                        .await?;
                }
            }
        }

        for (username, domain) in content::extract_mentions(&status.text) {
            if domain != self.local_domain {
                continue;
            }
            if let Some(actor) = self.store.actor_by_acct(&username, None).await? {
                if notified.contains(&actor.ap_id) || actor.ap_id == sender.ap_id {
                    continue;
                }
                notified.push(actor.ap_id.clone());
                self.store
                    .insert_notification(&Notification::new(
                        NotificationType::Mention,
                        actor.ap_id,
                        sender.ap_id.clone(),
                        Some(status.uri.clone()),
                    ))
                    .await?;
            }
        }

        Ok(())
    }
}

/// Target URI of a Delete: a plain string, a Tombstone, or an embedded id.
fn delete_target_uri(envelope: &Envelope) -> Option<String> {
    let object = envelope.object.as_ref()?;

    if let Some(uri) = object.as_str() {
        return Some(uri.to_string());
    }

    object
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| object.get("object").and_then(Value::as_str))
        .map(str::to_string)
}
