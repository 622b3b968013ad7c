//! Outbound delivery pipeline
//!
//! Renders canonical activity bodies, computes audiences from content
//! visibility, resolves recipient inboxes (deduplicated to each server's
//! shared inbox), then signs and POSTs with bounded-concurrency fan-out
//! and per-target retry budgets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::data::{
    Activity, ActivityType, Actor, Follow, Recipient, Status, Store, Visibility,
};
use crate::error::AppError;
use crate::federation::content::PUBLIC_COLLECTION;
use crate::federation::signature::{Signer, sign_request};
use crate::id::EntityId;
use crate::metrics::{ACTIVITIES_SENT, DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS};
use crate::tasks::{RetryPolicy, run_with_retry};

/// Delivery pipeline configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Per-delivery request timeout
    pub request_timeout: Duration,
    /// Concurrent deliveries per fan-out batch
    pub concurrency: usize,
    /// Retry budget applied to each individual delivery
    pub retry_policy: RetryPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            concurrency: 10,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Outcome of delivering one activity to one inbox.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub inbox_uri: String,
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Signs and sends activities to remote inboxes.
#[derive(Clone)]
pub struct DeliveryService {
    store: Arc<dyn Store>,
    http_client: reqwest::Client,
    config: DeliveryConfig,
    base_url: String,
}

impl DeliveryService {
    pub fn new(
        store: Arc<dyn Store>,
        config: DeliveryConfig,
        base_url: String,
    ) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("Lagoon/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            store,
            http_client,
            config,
            base_url,
        })
    }

    /// Mint an activity URI under a local actor.
    pub fn activity_uri(&self, actor: &Actor, verb: &str) -> String {
        format!(
            "{}/{}/{}",
            actor.ap_id,
            verb.to_lowercase(),
            EntityId::generate()
        )
    }

    // ---------------------------------------------------------------------
    // High-level sends
    // ---------------------------------------------------------------------

    /// Wrap a local status in a Create activity and fan it out to the
    /// author's followers and any mentioned actors.
    pub async fn send_status_create(
        &self,
        author: &Actor,
        status: &Status,
        mentioned: &[Actor],
    ) -> Result<Activity, AppError> {
        let signer = Signer::for_actor(author)?;
        let (to, cc) = audience_for_visibility(author, status.visibility, mentioned);
        let note = builder::note(status, author, &to, &cc);
        let uri = format!("{}/activity", status.uri);
        let body = builder::create(&uri, &author.ap_id, note, &to, &cc);

        let activity = Activity::local(
            uri,
            ActivityType::Create,
            author.ap_id.clone(),
            Some(status.uri.clone()),
        );
        self.store.insert_activity(&activity).await?;

        let inboxes = self.status_inboxes(author, status.visibility, mentioned).await?;
        ACTIVITIES_SENT.with_label_values(&["Create"]).inc();
        self.fan_out(&activity.uri, &body, inboxes, &signer).await;
        Ok(activity)
    }

    /// Announce a status Update to the same audience as the original.
    pub async fn send_status_update(
        &self,
        author: &Actor,
        status: &Status,
        mentioned: &[Actor],
    ) -> Result<Activity, AppError> {
        let signer = Signer::for_actor(author)?;
        let (to, cc) = audience_for_visibility(author, status.visibility, mentioned);
        let note = builder::note(status, author, &to, &cc);
        let uri = self.activity_uri(author, "update");
        let body = builder::update(&uri, &author.ap_id, note, &to, &cc);

        let activity = Activity::local(
            uri,
            ActivityType::Update,
            author.ap_id.clone(),
            Some(status.uri.clone()),
        );
        self.store.insert_activity(&activity).await?;

        let inboxes = self.status_inboxes(author, status.visibility, mentioned).await?;
        ACTIVITIES_SENT.with_label_values(&["Update"]).inc();
        self.fan_out(&activity.uri, &body, inboxes, &signer).await;
        Ok(activity)
    }

    /// Deliver a Delete (Tombstone) for a removed local status.
    pub async fn send_status_delete(
        &self,
        author: &Actor,
        status: &Status,
    ) -> Result<Activity, AppError> {
        let signer = Signer::for_actor(author)?;
        let (to, cc) = audience_for_visibility(author, status.visibility, &[]);
        let uri = self.activity_uri(author, "delete");
        let body = builder::delete(&uri, &author.ap_id, &status.uri, &to, &cc);

        let activity = Activity::local(
            uri,
            ActivityType::Delete,
            author.ap_id.clone(),
            Some(status.uri.clone()),
        );
        self.store.insert_activity(&activity).await?;

        let inboxes = self.status_inboxes(author, status.visibility, &[]).await?;
        ACTIVITIES_SENT.with_label_values(&["Delete"]).inc();
        self.fan_out(&activity.uri, &body, inboxes, &signer).await;
        Ok(activity)
    }

    /// Send a Follow to a remote actor. The pending edge must already be
    /// persisted; permanent delivery failure rolls it back.
    pub async fn send_follow(
        &self,
        actor: &Actor,
        target: &Actor,
        follow: &Follow,
    ) -> Result<(), AppError> {
        let signer = Signer::for_actor(actor)?;
        let body = builder::follow(&follow.uri, &actor.ap_id, &target.ap_id);

        let activity = Activity::local(
            follow.uri.clone(),
            ActivityType::Follow,
            actor.ap_id.clone(),
            Some(target.ap_id.clone()),
        );
        self.store.insert_activity(&activity).await?;

        ACTIVITIES_SENT.with_label_values(&["Follow"]).inc();
        self.deliver_tracked(&activity.uri, &body, &target.inbox_uri, &signer)
            .await
    }

    /// Accept an inbound follow request. Permanent delivery failure rolls
    /// the (already accepted or pending) edge back, because an edge the
    /// other side never learned about must not persist.
    pub async fn send_accept(
        &self,
        local_actor: &Actor,
        follow: &Follow,
        follower_inbox: &str,
    ) -> Result<(), AppError> {
        let signer = Signer::for_actor(local_actor)?;
        let uri = self.activity_uri(local_actor, "accept");
        let body = builder::accept(
            &uri,
            &local_actor.ap_id,
            builder::follow_ref(&follow.uri, &follow.actor_ap_id, &follow.target_ap_id),
        );

        let activity = Activity::local(
            uri,
            ActivityType::Accept,
            local_actor.ap_id.clone(),
            Some(follow.uri.clone()),
        );
        self.store.insert_activity(&activity).await?;

        ACTIVITIES_SENT.with_label_values(&["Accept"]).inc();
        self.deliver_tracked(&activity.uri, &body, follower_inbox, &signer)
            .await
    }

    /// Reject an inbound follow request.
    pub async fn send_reject(
        &self,
        local_actor: &Actor,
        follow: &Follow,
        follower_inbox: &str,
    ) -> Result<(), AppError> {
        let signer = Signer::for_actor(local_actor)?;
        let uri = self.activity_uri(local_actor, "reject");
        let body = builder::reject(
            &uri,
            &local_actor.ap_id,
            builder::follow_ref(&follow.uri, &follow.actor_ap_id, &follow.target_ap_id),
        );

        let activity = Activity::local(
            uri,
            ActivityType::Reject,
            local_actor.ap_id.clone(),
            Some(follow.uri.clone()),
        );
        self.store.insert_activity(&activity).await?;

        ACTIVITIES_SENT.with_label_values(&["Reject"]).inc();
        self.deliver_tracked(&activity.uri, &body, follower_inbox, &signer)
            .await
    }

    /// Like a status, delivered to its owner's inbox.
    pub async fn send_like(
        &self,
        actor: &Actor,
        status_uri: &str,
        owner_inbox: &str,
    ) -> Result<Activity, AppError> {
        let signer = Signer::for_actor(actor)?;
        let uri = self.activity_uri(actor, "like");
        let body = builder::like(&uri, &actor.ap_id, status_uri);

        let activity = Activity::local(
            uri,
            ActivityType::Like,
            actor.ap_id.clone(),
            Some(status_uri.to_string()),
        );
        self.store.insert_activity(&activity).await?;

        ACTIVITIES_SENT.with_label_values(&["Like"]).inc();
        self.deliver_tracked(&activity.uri, &body, owner_inbox, &signer)
            .await?;
        Ok(activity)
    }

    /// Undo a previously delivered activity.
    pub async fn send_undo(
        &self,
        actor: &Actor,
        undone: &Activity,
        inbox_uri: &str,
    ) -> Result<(), AppError> {
        let signer = Signer::for_actor(actor)?;
        let uri = self.activity_uri(actor, "undo");
        let body = builder::undo(
            &uri,
            &actor.ap_id,
            builder::activity_ref(undone),
        );

        let activity = Activity::local(
            uri,
            ActivityType::Undo,
            actor.ap_id.clone(),
            Some(undone.uri.clone()),
        );
        self.store.insert_activity(&activity).await?;

        ACTIVITIES_SENT.with_label_values(&["Undo"]).inc();
        self.deliver_tracked(&activity.uri, &body, inbox_uri, &signer)
            .await
    }

    /// Announce an object by URI to an explicit set of inboxes.
    ///
    /// Relay mirroring uses this: the body references the object, never
    /// embeds it.
    pub async fn send_announce(
        &self,
        actor: &Actor,
        object_uri: &str,
        inboxes: Vec<String>,
    ) -> Result<Activity, AppError> {
        let signer = Signer::for_actor(actor)?;
        let uri = self.activity_uri(actor, "announce");
        let to = vec![PUBLIC_COLLECTION.to_string()];
        let body = builder::announce(&uri, &actor.ap_id, object_uri, &to, &[]);

        let activity = Activity::local(
            uri,
            ActivityType::Announce,
            actor.ap_id.clone(),
            Some(object_uri.to_string()),
        );
        self.store.insert_activity(&activity).await?;

        ACTIVITIES_SENT.with_label_values(&["Announce"]).inc();
        self.fan_out(&activity.uri, &body, inboxes, &signer).await;
        Ok(activity)
    }

    // ---------------------------------------------------------------------
    // Addressing
    // ---------------------------------------------------------------------

    /// Resolve the inbox set for a status: followers (except for direct
    /// posts) unioned with mentioned actors' personal inboxes, then
    /// collapsed to shared inboxes.
    async fn status_inboxes(
        &self,
        author: &Actor,
        visibility: Visibility,
        mentioned: &[Actor],
    ) -> Result<Vec<String>, AppError> {
        let mut recipients = match visibility {
            Visibility::Direct => Vec::new(),
            _ => self.store.follower_recipients(&author.ap_id).await?,
        };

        for actor in mentioned {
            if actor.is_local() {
                continue;
            }
            recipients.push(Recipient {
                ap_id: actor.ap_id.clone(),
                inbox_uri: actor.inbox_uri.clone(),
                // Mentions go to the personal inbox so the recipient's
                // server routes the notification precisely.
                shared_inbox_uri: None,
            });
        }

        Ok(dedupe_delivery_inboxes(recipients))
    }

    // ---------------------------------------------------------------------
    // Transport
    // ---------------------------------------------------------------------

    /// Deliver with retry and record the outcome on the activity row.
    /// Permanent failure of a Follow or Accept rolls the edge back.
    pub async fn deliver_tracked(
        &self,
        activity_uri: &str,
        body: &Value,
        inbox_uri: &str,
        signer: &Signer,
    ) -> Result<(), AppError> {
        let outcome = self.deliver_with_retry(body, inbox_uri, signer).await;

        match outcome {
            Ok(attempts) => {
                self.store
                    .record_delivery_attempt(activity_uri, attempts, None)
                    .await?;
                self.store.mark_activity_delivered(activity_uri).await?;
                Ok(())
            }
            Err((attempts, error)) => {
                let message = error.to_string();
                self.store
                    .record_delivery_attempt(activity_uri, attempts, Some(&message))
                    .await?;
                self.rollback_follow_edge(activity_uri).await?;
                tracing::warn!(
                    inbox = %inbox_uri,
                    attempts,
                    error = %message,
                    "Delivery permanently failed"
                );
                Err(error)
            }
        }
    }

    /// Fan an activity out to many inboxes on a bounded worker pool.
    ///
    /// Each target gets its own timeout and retry budget so one slow peer
    /// cannot stall the batch. The activity is marked delivered when at
    /// least one target succeeded.
    pub async fn fan_out(
        &self,
        activity_uri: &str,
        body: &Value,
        inboxes: Vec<String>,
        signer: &Signer,
    ) -> Vec<DeliveryOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let body = Arc::new(body.clone());
        let mut tasks = Vec::with_capacity(inboxes.len());

        for inbox_uri in inboxes {
            let semaphore = semaphore.clone();
            let body = body.clone();
            let signer = signer.clone();
            let service = self.clone();

            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return DeliveryOutcome {
                        inbox_uri,
                        success: false,
                        attempts: 0,
                        error: Some("worker pool closed".to_string()),
                    };
                };

                match service.deliver_with_retry(&body, &inbox_uri, &signer).await {
                    Ok(attempts) => DeliveryOutcome {
                        inbox_uri,
                        success: true,
                        attempts,
                        error: None,
                    },
                    Err((attempts, error)) => DeliveryOutcome {
                        inbox_uri,
                        success: false,
                        attempts,
                        error: Some(error.to_string()),
                    },
                }
            }));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            if let Ok(outcome) = task.await {
                outcomes.push(outcome);
            }
        }

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let failed = outcomes.len() - succeeded;
        tracing::info!(succeeded, failed, "Fan-out complete");

        let attempts = outcomes.iter().map(|o| o.attempts).max().unwrap_or(0);
        let first_error = outcomes
            .iter()
            .filter(|o| !o.success)
            .find_map(|o| o.error.clone());
        let _ = self
            .store
            .record_delivery_attempt(activity_uri, attempts, first_error.as_deref())
            .await;
        if succeeded > 0 {
            let _ = self.store.mark_activity_delivered(activity_uri).await;
        }

        outcomes
    }

    /// One signed POST to one inbox, run under the retry policy.
    /// Returns the attempt count on success, or the terminal error and the
    /// attempts made.
    async fn deliver_with_retry(
        &self,
        body: &Value,
        inbox_uri: &str,
        signer: &Signer,
    ) -> Result<u32, (u32, AppError)> {
        let result = run_with_retry(&self.config.retry_policy, || {
            self.deliver_once(body, inbox_uri, signer)
        })
        .await;

        match result {
            Ok(((), attempts)) => Ok(attempts),
            Err(failure) => Err((failure.attempts, failure.last_error)),
        }
    }

    /// Sign and POST one activity body to one inbox.
    async fn deliver_once(
        &self,
        body: &Value,
        inbox_uri: &str,
        signer: &Signer,
    ) -> Result<(), AppError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;
        let signed = sign_request("POST", inbox_uri, Some(&bytes), signer)?;

        let timer = DELIVERY_DURATION_SECONDS
            .with_label_values(&["post"])
            .start_timer();
        let mut request = self
            .http_client
            .post(inbox_uri)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(bytes).send().await.map_err(|e| {
            DELIVERIES_TOTAL.with_label_values(&["error"]).inc();
            AppError::Network(format!("Delivery to {} failed: {}", inbox_uri, e))
        })?;
        timer.observe_duration();

        let status = response.status();
        if status.is_success() {
            DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
            tracing::debug!(inbox = %inbox_uri, "Delivered activity");
            return Ok(());
        }

        DELIVERIES_TOTAL.with_label_values(&["rejected"]).inc();
        if status.is_server_error() {
            Err(AppError::Network(format!(
                "Inbox {} answered HTTP {}",
                inbox_uri, status
            )))
        } else {
            // 4xx is a rejection of this specific payload; retrying the
            // identical request cannot succeed.
            Err(AppError::Validation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox_uri, status
            )))
        }
    }

    /// Compensating rollback after a permanently failed Follow or Accept
    /// delivery: the edge the other side never learned about is deleted.
    async fn rollback_follow_edge(&self, activity_uri: &str) -> Result<(), AppError> {
        let Some(activity) = self.store.activity_by_uri(activity_uri).await? else {
            return Ok(());
        };

        let follow_uri = match activity.activity_type {
            ActivityType::Follow => Some(activity.uri.clone()),
            ActivityType::Accept => activity.object_uri.clone(),
            _ => None,
        };

        if let Some(follow_uri) = follow_uri {
            if self.store.remove_follow(&follow_uri).await?.is_some() {
                tracing::info!(follow = %follow_uri, "Rolled back unacknowledged follow");
            }
        }
        Ok(())
    }

    /// Base URL of this node.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Compute `to`/`cc` for a status from its visibility.
///
/// | visibility | to                  | cc                |
/// |------------|---------------------|-------------------|
/// | public     | public collection   | author followers  |
/// | unlisted   | author followers    | public collection |
/// | private    | author followers    | (none)            |
/// | direct     | mentioned actors    | (none)            |
pub fn audience_for_visibility(
    author: &Actor,
    visibility: Visibility,
    mentioned: &[Actor],
) -> (Vec<String>, Vec<String>) {
    let followers = author
        .followers_uri
        .clone()
        .unwrap_or_else(|| format!("{}/followers", author.ap_id));
    let mentioned_ids: Vec<String> = mentioned.iter().map(|a| a.ap_id.clone()).collect();

    match visibility {
        Visibility::Public => {
            let mut cc = vec![followers];
            cc.extend(mentioned_ids);
            (vec![PUBLIC_COLLECTION.to_string()], cc)
        }
        Visibility::Unlisted => {
            let mut cc = vec![PUBLIC_COLLECTION.to_string()];
            cc.extend(mentioned_ids);
            (vec![followers], cc)
        }
        Visibility::Private => (vec![followers], mentioned_ids),
        Visibility::Direct => (mentioned_ids, Vec::new()),
    }
}

/// Collapse a recipient set to concrete delivery inboxes.
///
/// Recipients on a server that advertises a shared inbox collapse to one
/// entry for that inbox; distinct personal inboxes are all kept. A server
/// with ten thousand followers of one account receives exactly one
/// delivery.
pub fn dedupe_delivery_inboxes(recipients: Vec<Recipient>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut inboxes = Vec::new();

    for recipient in recipients {
        let inbox = recipient.delivery_inbox().to_string();
        if seen.insert(inbox.clone()) {
            inboxes.push(inbox);
        }
    }
    inboxes
}

/// Build ActivityPub activity JSON.
pub mod builder {
    use serde_json::Value;

    use crate::data::{Activity, Actor, Status};

    /// Build a Follow activity.
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Reference to a Follow used as the object of Accept/Reject/Undo.
    pub fn follow_ref(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Reference to an arbitrary prior activity used as an Undo object.
    pub fn activity_ref(activity: &Activity) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("id".to_string(), serde_json::json!(activity.uri));
        object.insert(
            "type".to_string(),
            serde_json::json!(activity.activity_type.as_str()),
        );
        object.insert("actor".to_string(), serde_json::json!(activity.actor_ap_id));
        if let Some(target) = &activity.object_uri {
            object.insert("object".to_string(), serde_json::json!(target));
        }
        Value::Object(object)
    }

    /// Build an Accept activity wrapping an embedded object.
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Reject activity.
    pub fn reject(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Reject",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity embedding the full object body.
    pub fn create(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Update activity embedding the edited object body.
    pub fn update(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Update",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc
        })
    }

    /// Build a Delete activity referencing the object as a Tombstone.
    pub fn delete(id: &str, actor: &str, object: &str, to: &[String], cc: &[String]) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Tombstone",
                "id": object
            },
            "to": to,
            "cc": cc
        })
    }

    /// Build a Like activity referencing the object by URI.
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Announce activity referencing the object by URI.
    pub fn announce(id: &str, actor: &str, object: &str, to: &[String], cc: &[String]) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Announce",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Undo activity wrapping the undone object.
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Render a status as its wire object (Note/Article/Question).
    pub fn note(status: &Status, author: &Actor, to: &[String], cc: &[String]) -> Value {
        serde_json::json!({
            "type": status.object_type.as_str(),
            "id": status.uri,
            "attributedTo": author.ap_id,
            "content": status.content,
            "published": status.published_at.to_rfc3339(),
            "inReplyTo": status.in_reply_to_uri,
            "conversation": status.conversation_uri,
            "sensitive": status.sensitive,
            "summary": status.spoiler_text,
            "to": to,
            "cc": cc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ActorType;
    use chrono::Utc;

    fn actor(ap_id: &str) -> Actor {
        Actor {
            id: EntityId::generate().to_string(),
            ap_id: ap_id.to_string(),
            username: "alice".to_string(),
            domain: None,
            display_name: None,
            summary: None,
            inbox_uri: format!("{}/inbox", ap_id),
            shared_inbox_uri: None,
            outbox_uri: None,
            followers_uri: Some(format!("{}/followers", ap_id)),
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

    fn recipient(ap_id: &str, inbox: &str, shared: Option<&str>) -> Recipient {
        Recipient {
            ap_id: ap_id.to_string(),
            inbox_uri: inbox.to_string(),
            shared_inbox_uri: shared.map(str::to_string),
        }
    }

    #[test]
    fn audience_public_targets_public_then_followers() {
        let author = actor("https://local.example/users/alice");
        let (to, cc) = audience_for_visibility(&author, Visibility::Public, &[]);

        assert_eq!(to, vec![PUBLIC_COLLECTION.to_string()]);
        assert_eq!(
            cc,
            vec!["https://local.example/users/alice/followers".to_string()]
        );
    }

    #[test]
    fn audience_unlisted_swaps_to_and_cc() {
        let author = actor("https://local.example/users/alice");
        let (to, cc) = audience_for_visibility(&author, Visibility::Unlisted, &[]);

        assert_eq!(
            to,
            vec!["https://local.example/users/alice/followers".to_string()]
        );
        assert_eq!(cc, vec![PUBLIC_COLLECTION.to_string()]);
    }

    #[test]
    fn audience_private_targets_only_followers() {
        let author = actor("https://local.example/users/alice");
        let (to, cc) = audience_for_visibility(&author, Visibility::Private, &[]);

        assert_eq!(
            to,
            vec!["https://local.example/users/alice/followers".to_string()]
        );
        assert!(cc.is_empty());
    }

    #[test]
    fn audience_direct_targets_only_mentioned_actors() {
        let author = actor("https://local.example/users/alice");
        let mentioned = vec![actor("https://remote.example/users/bob")];
        let (to, cc) = audience_for_visibility(&author, Visibility::Direct, &mentioned);

        assert_eq!(to, vec!["https://remote.example/users/bob".to_string()]);
        assert!(cc.is_empty());
    }

    #[test]
    fn dedupe_collapses_shared_inbox_recipients_to_one_delivery() {
        let inboxes = dedupe_delivery_inboxes(vec![
            recipient(
                "https://remote.example/users/bob",
                "https://remote.example/users/bob/inbox",
                Some("https://remote.example/inbox"),
            ),
            recipient(
                "https://remote.example/users/carol",
                "https://remote.example/users/carol/inbox",
                Some("https://remote.example/inbox"),
            ),
            recipient(
                "https://other.example/users/dan",
                "https://other.example/users/dan/inbox",
                None,
            ),
        ]);

        assert_eq!(
            inboxes,
            vec![
                "https://remote.example/inbox".to_string(),
                "https://other.example/users/dan/inbox".to_string(),
            ]
        );
    }

    #[test]
    fn dedupe_keeps_distinct_personal_inboxes_on_same_domain() {
        let inboxes = dedupe_delivery_inboxes(vec![
            recipient(
                "https://remote.example/users/bob",
                "https://remote.example/users/bob/inbox",
                None,
            ),
            recipient(
                "https://remote.example/users/carol",
                "https://remote.example/users/carol/inbox",
                None,
            ),
        ]);

        assert_eq!(inboxes.len(), 2);
    }

    #[test]
    fn builder_delete_wraps_object_in_tombstone() {
        let body = builder::delete(
            "https://local.example/users/alice/delete/1",
            "https://local.example/users/alice",
            "https://local.example/statuses/1",
            &[PUBLIC_COLLECTION.to_string()],
            &[],
        );

        assert_eq!(body["object"]["type"], "Tombstone");
        assert_eq!(body["object"]["id"], "https://local.example/statuses/1");
    }

    #[test]
    fn builder_announce_references_object_by_uri_only() {
        let body = builder::announce(
            "https://local.example/users/alice/announce/1",
            "https://local.example/users/alice",
            "https://local.example/statuses/1",
            &[PUBLIC_COLLECTION.to_string()],
            &[],
        );

        assert!(body["object"].is_string());
        assert_eq!(body["object"], "https://local.example/statuses/1");
    }
}
