//! ActivityPub endpoints
//!
//! - Actor documents
//! - Personal and shared inboxes (activity receiving)
//! - Outbox/followers/following collections
//!
//! Inbox handlers verify the HTTP signature synchronously, then hand the
//! activity to the dispatcher on a background task: the acceptance
//! response and the side effects are decoupled.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    response::Json,
    routing::{get, post},
};
use http::HeaderMap;
use serde_json::Value;

use crate::AppState;
use crate::data::{Actor, Store};
use crate::error::AppError;
use crate::federation::{Envelope, extract_key_id, key_owner_matches_actor, verify_request};
use crate::metrics::{ACTIVITIES_RECEIVED, HTTP_REQUESTS_TOTAL};

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox collection
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor_document))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
}

/// GET /users/:username
///
/// Returns the ActivityPub actor document for a local actor.
async fn actor_document(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, AppError> {
    let actor = local_actor(&state, &username).await?;
    let base_url = state.config.server.base_url();

    let response = Json(serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": actor.actor_type.as_str(),
        "id": actor.ap_id,
        "preferredUsername": actor.username,
        "name": actor.display_name.clone().unwrap_or_else(|| actor.username.clone()),
        "summary": actor.summary.clone().unwrap_or_default(),
        "inbox": actor.inbox_uri,
        "outbox": format!("{}/outbox", actor.ap_id),
        "followers": format!("{}/followers", actor.ap_id),
        "following": format!("{}/following", actor.ap_id),
        "url": actor.ap_id,
        "manuallyApprovesFollowers": actor.locked,
        "discoverable": actor.discoverable,
        "endpoints": {
            "sharedInbox": format!("{}/inbox", base_url)
        },
        "publicKey": {
            "id": actor.key_id(),
            "owner": actor.ap_id,
            "publicKeyPem": actor.public_key_pem
        }
    }));

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/users/:username", "200"])
        .inc();
    Ok(response)
}

/// POST /users/:username/inbox
///
/// Receives activities addressed to one local actor.
///
/// # Steps
/// 1. Verify the HTTP signature (resolving the key through the cache)
/// 2. Structurally validate the activity
/// 3. Dispatch on a background task
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(), AppError> {
    local_actor(&state, &username).await?;
    let path = format!("/users/{}/inbox", username);
    accept_activity(state, &path, "/users/:username/inbox", headers, body).await
}

/// POST /inbox
///
/// Shared inbox: one delivery per server for broadcast activities.
async fn shared_inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(), AppError> {
    accept_activity(state, "/inbox", "/inbox", headers, body).await
}

async fn accept_activity(
    state: AppState,
    path: &str,
    endpoint: &'static str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(), AppError> {
    let (activity, sender) = verify_inbound(&state, path, &headers, &body).await?;

    // Structural invalidity is a synchronous 400; everything after the
    // envelope parse runs off the request thread.
    let envelope = Envelope::parse(&activity)?;
    ACTIVITIES_RECEIVED
        .with_label_values(&[envelope.activity_type.as_str()])
        .inc();

    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        match dispatcher.dispatch(&activity, &sender).await {
            Ok(outcome) => {
                tracing::debug!(uri = %envelope.uri, ?outcome, "Inbound activity handled");
            }
            Err(error) => {
                tracing::warn!(uri = %envelope.uri, %error, "Inbound activity failed");
            }
        }
    });

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, "200"])
        .inc();
    Ok(())
}

/// Authenticate an inbound request.
///
/// Resolves the signature keyId through the actor cache, checks that the
/// key owner is the activity's actor, and verifies the signature. A
/// verification failure against a cached key triggers one forced re-fetch
/// before rejecting, to survive key rotation.
async fn verify_inbound(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(Value, Actor), AppError> {
    if headers.get("signature").is_none() {
        return Err(AppError::Unauthorized);
    }

    let activity: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
    let actor_id = activity
        .get("actor")
        .and_then(|actor| {
            actor
                .as_str()
                .or_else(|| actor.get("id").and_then(Value::as_str))
        })
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?
        .to_string();

    // The keyId must belong to the claimed actor before any remote fetch.
    let key_id = extract_key_id(headers)?;
    if !key_owner_matches_actor(&key_id, &actor_id) {
        return Err(AppError::Signature(
            "Signature keyId does not match actor".to_string(),
        ));
    }

    let sender = state.resolver.actor_for_key(&key_id).await?;
    if sender.suspended {
        return Err(AppError::Forbidden);
    }

    let window = state.config.federation.signature_replay_window_secs;
    match verify_request(
        "POST",
        path,
        headers,
        Some(body),
        &sender.public_key_pem,
        window,
    ) {
        Ok(()) => Ok((activity, sender)),
        Err(first_failure) => {
            // The cached key may be stale after a rotation; re-fetch once.
            let refreshed = state
                .resolver
                .refresh_actor(&sender.ap_id)
                .await
                .map_err(|_| first_failure)?;
            verify_request(
                "POST",
                path,
                headers,
                Some(body),
                &refreshed.public_key_pem,
                window,
            )?;
            Ok((activity, refreshed))
        }
    }
}

/// GET /users/:username/outbox
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, AppError> {
    let actor = local_actor(&state, &username).await?;

    Ok(Json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": format!("{}/outbox", actor.ap_id),
        "totalItems": actor.statuses_count,
        "orderedItems": []
    })))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, AppError> {
    let actor = local_actor(&state, &username).await?;
    let items: Vec<String> = state
        .store
        .follower_recipients(&actor.ap_id)
        .await?
        .into_iter()
        .map(|recipient| recipient.ap_id)
        .collect();

    Ok(Json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": format!("{}/followers", actor.ap_id),
        "totalItems": actor.followers_count,
        "orderedItems": items
    })))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, AppError> {
    let actor = local_actor(&state, &username).await?;

    Ok(Json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": format!("{}/following", actor.ap_id),
        "totalItems": actor.following_count,
        "orderedItems": []
    })))
}

async fn local_actor(state: &AppState, username: &str) -> Result<Actor, AppError> {
    state
        .store
        .actor_by_acct(username, None)
        .await?
        .ok_or(AppError::NotFound)
}
