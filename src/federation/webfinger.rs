//! WebFinger protocol
//!
//! Maps `user@domain` handles to canonical ActivityPub actor URIs, and
//! serves JRD responses for local actors.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Media type of ActivityPub documents.
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// WebFinger JRD response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

impl WebFingerResponse {
    /// The canonical actor URI: the `rel=self` link typed
    /// `application/activity+json`.
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link
                        .link_type
                        .as_deref()
                        .is_some_and(|t| t == ACTIVITY_JSON || t.starts_with("application/ld+json"))
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// WebFinger link entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Query a remote server's WebFinger endpoint for a handle.
///
/// # Errors
/// - `Network` for transport failures (retryable by callers that want to)
/// - `ActorFetch` when the server answers but the JRD is unusable
pub async fn fetch_jrd(
    username: &str,
    domain: &str,
    http_client: &reqwest::Client,
) -> Result<WebFingerResponse, AppError> {
    let resource = format!("acct:{}@{}", username, domain);
    let url = format!(
        "https://{}/.well-known/webfinger?resource={}",
        domain,
        urlencoding::encode(&resource)
    );

    let response = http_client
        .get(&url)
        .header("Accept", "application/jrd+json, application/json")
        .send()
        .await
        .map_err(|e| AppError::Network(format!("WebFinger request to {} failed: {}", domain, e)))?;

    if !response.status().is_success() {
        return Err(AppError::ActorFetch(format!(
            "WebFinger for {} returned HTTP {}",
            resource,
            response.status()
        )));
    }

    response
        .json::<WebFingerResponse>()
        .await
        .map_err(|e| AppError::ActorFetch(format!("Invalid JRD for {}: {}", resource, e)))
}

/// Generate the JRD served for a local actor.
pub fn local_jrd(username: &str, domain: &str, base_url: &str) -> WebFingerResponse {
    let subject = format!("acct:{}@{}", username, domain);
    let actor_url = format!("{}/users/{}", base_url.trim_end_matches('/'), username);

    WebFingerResponse {
        subject,
        aliases: Some(vec![actor_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_url.clone()),
                template: None,
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_url),
                template: None,
            },
        ],
    }
}

/// Split a `user@domain` or `acct:user@domain` handle.
pub fn split_handle(handle: &str) -> Result<(String, String), AppError> {
    let handle = handle.strip_prefix("acct:").unwrap_or(handle);
    let handle = handle.strip_prefix('@').unwrap_or(handle);

    match handle.split_once('@') {
        Some((username, domain)) if !username.is_empty() && !domain.is_empty() => Ok((
            username.to_ascii_lowercase(),
            domain.to_ascii_lowercase(),
        )),
        _ => Err(AppError::Validation(format!(
            "Invalid account handle: {}",
            handle
        ))),
    }
}
