//! Lagoon - A federated ActivityPub publishing server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub actor documents and inboxes                  │
//! │  - WebFinger / NodeInfo discovery                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Federation Engine                          │
//! │  - HTTP signature signing/verification                      │
//! │  - Inbound dispatch, outbound delivery, relays              │
//! │  - Remote actor resolution and caching                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Store trait (external persistence contract)              │
//! │  - In-memory reference store                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: server-to-server HTTP endpoints
//! - `federation`: the federation engine
//! - `data`: models and the store abstraction
//! - `tasks`: retry policy and task execution
//! - `id`: entity id generation
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod id;
pub mod metrics;
pub mod tasks;

use std::sync::Arc;

use chrono::Utc;

use crate::data::{
    Actor, ActorType, Follow, FollowState, MemoryStore, Status, Store, Visibility,
};
use crate::error::AppError;
use crate::federation::outbound::{DeliveryConfig, DeliveryService};
use crate::federation::resolver::{ActorResolver, ResolverConfig};
use crate::federation::signature::Signer;
use crate::federation::{InboundDispatcher, RelayBridge, content};
use crate::id::EntityId;
use crate::tasks::RetryPolicy;

/// Application state shared across all handlers
///
/// Cloned per request; every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,
    /// Persistence (external collaborator behind the Store trait)
    pub store: Arc<dyn Store>,
    /// Remote actor resolution and caching
    pub resolver: Arc<ActorResolver>,
    /// Outbound delivery pipeline
    pub delivery: Arc<DeliveryService>,
    /// Relay broadcast bridge
    pub relay: Arc<RelayBridge>,
    /// Inbound activity dispatcher
    pub dispatcher: Arc<InboundDispatcher>,
}

impl AppState {
    /// Initialize application state over the in-memory reference store.
    pub async fn new(config: config::AppConfig) -> Result<Self, AppError> {
        Self::with_store(config, Arc::new(MemoryStore::new())).await
    }

    /// Initialize application state over an externally provided store.
    ///
    /// # Steps
    /// 1. Provision the instance service actor (signs fetches and relay
    ///    traffic)
    /// 2. Build the resolver, delivery pipeline, relay bridge and
    ///    dispatcher
    pub async fn with_store(
        config: config::AppConfig,
        store: Arc<dyn Store>,
    ) -> Result<Self, AppError> {
        tracing::info!("Initializing application state...");

        let instance_actor = Self::ensure_instance_actor(&store, &config).await?;

        let resolver = Arc::new(
            ActorResolver::new(
                store.clone(),
                ResolverConfig {
                    cache_ttl: config.federation.actor_cache_ttl(),
                    request_timeout: config.federation.request_timeout(),
                    max_redirects: config.federation.max_redirects,
                    allow_private_addresses: config.federation.allow_private_addresses,
                },
            )?
            .with_signer(Signer::for_actor(&instance_actor)?),
        );

        let delivery = Arc::new(DeliveryService::new(
            store.clone(),
            DeliveryConfig {
                request_timeout: config.federation.request_timeout(),
                concurrency: config.federation.delivery_concurrency,
                retry_policy: RetryPolicy::new(
                    config.federation.delivery_attempts,
                    config.federation.retry_base(),
                ),
            },
            config.server.base_url(),
        )?);

        let relay = Arc::new(RelayBridge::new(
            store.clone(),
            resolver.clone(),
            delivery.clone(),
            instance_actor.ap_id.clone(),
        ));

        let dispatcher = Arc::new(InboundDispatcher::new(
            store.clone(),
            resolver.clone(),
            delivery.clone(),
            relay.clone(),
            config.server.domain.clone(),
        ));

        tracing::info!("Application state initialized");

        Ok(Self {
            config: Arc::new(config),
            store,
            resolver,
            delivery,
            relay,
            dispatcher,
        })
    }

    /// Ensure the instance service actor exists.
    ///
    /// Generates an RSA keypair on first start. The actor signs outbound
    /// fetches and owns relay subscriptions.
    async fn ensure_instance_actor(
        store: &Arc<dyn Store>,
        config: &config::AppConfig,
    ) -> Result<Actor, AppError> {
        let username = &config.instance.actor_username;
        if let Some(actor) = store.actor_by_acct(username, None).await? {
            return Ok(actor);
        }

        tracing::info!(username = %username, "Provisioning instance actor...");
        let actor = build_local_actor(config, username, ActorType::Service)?;
        store.upsert_actor(&actor).await?;
        Ok(actor)
    }

    /// Provision a local Person actor with a fresh RSA keypair.
    pub async fn provision_local_actor(&self, username: &str) -> Result<Actor, AppError> {
        if self.store.actor_by_acct(username, None).await?.is_some() {
            return Err(AppError::Validation(format!(
                "Username {} is taken",
                username
            )));
        }

        let actor = build_local_actor(&self.config, username, ActorType::Person)?;
        self.store.upsert_actor(&actor).await?;
        tracing::info!(username = %username, "Local actor provisioned");
        Ok(actor)
    }

    /// Publish a status from a local actor and fan it out.
    ///
    /// Mentions are resolved from inline `@user@domain` handles; delivery
    /// and relay mirroring run off the calling task.
    pub async fn publish_status(
        &self,
        author: &Actor,
        content_html: &str,
        visibility: Visibility,
        in_reply_to_uri: Option<String>,
    ) -> Result<Status, AppError> {
        let content_html = content::sanitize_html(content_html);
        let text = content::plain_text(&content_html);

        let id = EntityId::generate();
        let status = Status {
            id: id.to_string(),
            uri: format!("{}/statuses/{}", author.ap_id, id),
            object_type: crate::data::ObjectType::Note,
            account_ap_id: author.ap_id.clone(),
            content: content_html,
            text,
            visibility,
            sensitive: false,
            spoiler_text: None,
            in_reply_to_uri,
            conversation_uri: None,
            language: None,
            local: true,
            replies_count: 0,
            reblogs_count: 0,
            favourites_count: 0,
            published_at: Utc::now(),
            edited_at: None,
        };
        self.store.insert_status(&status).await?;

        let mentioned = self.resolve_mentions(&status.text).await;

        let delivery = self.delivery.clone();
        let relay = self.relay.clone();
        let mirror = self.config.federation.mirror_to_relays;
        let author = author.clone();
        let spawned_status = status.clone();
        tokio::spawn(async move {
            if let Err(error) = delivery
                .send_status_create(&author, &spawned_status, &mentioned)
                .await
            {
                tracing::warn!(%error, "Status fan-out failed");
            }
            if mirror {
                if let Err(error) = relay.mirror_status(&spawned_status).await {
                    tracing::warn!(%error, "Relay mirroring failed");
                }
            }
        });

        Ok(status)
    }

    /// Follow a remote actor from a local one.
    ///
    /// Persists a pending edge and delivers the Follow; permanent
    /// delivery failure rolls the edge back.
    pub async fn follow_remote(
        &self,
        local: &Actor,
        handle_or_uri: &str,
    ) -> Result<Follow, AppError> {
        let target = self.resolver.resolve(handle_or_uri).await?;

        let follow = Follow {
            id: EntityId::generate().to_string(),
            actor_ap_id: local.ap_id.clone(),
            target_ap_id: target.ap_id.clone(),
            uri: format!("{}/follow/{}", local.ap_id, EntityId::generate()),
            state: FollowState::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.insert_follow(&follow).await?;

        let delivery = self.delivery.clone();
        let local = local.clone();
        let spawned_follow = follow.clone();
        tokio::spawn(async move {
            if let Err(error) = delivery.send_follow(&local, &target, &spawned_follow).await {
                tracing::warn!(%error, "Follow delivery failed");
            }
        });

        Ok(follow)
    }

    /// Undo a follow of a remote actor.
    pub async fn unfollow_remote(
        &self,
        local: &Actor,
        target_ap_id: &str,
    ) -> Result<(), AppError> {
        let follow = self
            .store
            .follow_by_pair(&local.ap_id, target_ap_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let target = self.resolver.resolve_uri(target_ap_id).await?;

        self.store.remove_follow(&follow.uri).await?;

        if let Some(follow_activity) = self.store.activity_by_uri(&follow.uri).await? {
            let delivery = self.delivery.clone();
            let local = local.clone();
            tokio::spawn(async move {
                if let Err(error) = delivery
                    .send_undo(&local, &follow_activity, &target.inbox_uri)
                    .await
                {
                    tracing::warn!(%error, "Undo delivery failed");
                }
            });
        }

        Ok(())
    }

    /// Resolve inline mentions to actors, dropping the unresolvable.
    async fn resolve_mentions(&self, text: &str) -> Vec<Actor> {
        let mut mentioned = Vec::new();
        for (username, domain) in content::extract_mentions(text) {
            let result = if domain == self.config.server.domain {
                self.store.actor_by_acct(&username, None).await
            } else {
                self.resolver.resolve_handle(&username, &domain).await.map(Some)
            };
            match result {
                Ok(Some(actor)) => mentioned.push(actor),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        mention = %format!("{}@{}", username, domain),
                        %error,
                        "Dropping unresolvable mention"
                    );
                }
            }
        }
        mentioned
    }
}

/// Build a local actor with a fresh RSA keypair.
fn build_local_actor(
    config: &config::AppConfig,
    username: &str,
    actor_type: ActorType,
) -> Result<Actor, AppError> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key =
        RsaPrivateKey::new(&mut rng, 2048).map_err(|e| AppError::Internal(e.into()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?;

    let base_url = config.server.base_url();
    let ap_id = format!("{}/users/{}", base_url, username);
    let now = Utc::now();

    Ok(Actor {
        id: EntityId::generate().to_string(),
        ap_id: ap_id.clone(),
        username: username.to_string(),
        domain: None,
        display_name: None,
        summary: None,
        inbox_uri: format!("{}/inbox", ap_id),
        shared_inbox_uri: Some(format!("{}/inbox", base_url)),
        outbox_uri: Some(format!("{}/outbox", ap_id)),
        followers_uri: Some(format!("{}/followers", ap_id)),
        following_uri: Some(format!("{}/following", ap_id)),
        public_key_pem,
        private_key_pem: Some(private_key_pem),
        actor_type,
        locked: false,
        bot: actor_type == ActorType::Service,
        suspended: false,
        discoverable: actor_type == ActorType::Person,
        followers_count: 0,
        following_count: 0,
        statuses_count: 0,
        fetched_at: None,
        created_at: now,
        updated_at: now,
    })
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests to keep route composition
/// consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone())
        .merge(api::metrics_router().with_state(state))
}

async fn health_check() -> &'static str {
    "OK"
}
