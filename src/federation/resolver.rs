//! Remote actor discovery and caching
//!
//! Resolves `user@domain` handles and actor URIs to cached [`Actor`]
//! records. Cache hits inside the freshness TTL short-circuit; otherwise
//! the resolver performs WebFinger discovery (for handles), fetches the
//! profile document with an ActivityPub Accept header, and upserts the
//! actor, merging mutable fields over any existing record.
//!
//! All failures come back as explicit error values so callers can choose
//! "drop this activity" vs "retry later".

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::data::{Actor, ActorType, Store};
use crate::error::AppError;
use crate::federation::signature::{Signer, sign_request};
use crate::federation::webfinger::{self, ACTIVITY_JSON};
use crate::id::EntityId;
use crate::metrics::ACTORS_RESOLVED_TOTAL;

/// Usernames probed by the heuristic instance-discovery fallback.
const COMMON_USERNAMES: &[&str] = &["admin", "info", "contact"];

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Freshness TTL for cached remote actors
    pub cache_ttl: Duration,
    /// Per-request timeout for discovery and profile fetches
    pub request_timeout: Duration,
    /// Redirect hops followed during resolution
    pub max_redirects: usize,
    /// Permit loopback/private destinations (development and tests only)
    pub allow_private_addresses: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(86_400),
            request_timeout: Duration::from_secs(10),
            max_redirects: 3,
            allow_private_addresses: false,
        }
    }
}

/// Discovers and caches remote identities.
pub struct ActorResolver {
    store: Arc<dyn Store>,
    http_client: reqwest::Client,
    config: ResolverConfig,
    /// Identity used to sign fetches, for peers that require it
    signer: Option<Signer>,
}

impl ActorResolver {
    /// Create a resolver with its own bounded HTTP client.
    pub fn new(store: Arc<dyn Store>, config: ResolverConfig) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("Lagoon/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            store,
            http_client,
            config,
            signer: None,
        })
    }

    /// Sign outbound fetches with this identity.
    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Resolve a `user@domain` handle or an actor URI.
    pub async fn resolve(&self, handle_or_uri: &str) -> Result<Actor, AppError> {
        if handle_or_uri.starts_with("http://") || handle_or_uri.starts_with("https://") {
            self.resolve_uri(handle_or_uri).await
        } else {
            let (username, domain) = webfinger::split_handle(handle_or_uri)?;
            self.resolve_handle(&username, &domain).await
        }
    }

    /// Resolve an actor by URI, cache-first.
    pub async fn resolve_uri(&self, uri: &str) -> Result<Actor, AppError> {
        if let Some(actor) = self.store.actor_by_ap_id(uri).await? {
            if actor.is_local() || !self.is_stale(&actor) {
                ACTORS_RESOLVED_TOTAL.with_label_values(&["cache"]).inc();
                return Ok(actor);
            }
        }
        self.refresh_actor(uri).await
    }

    /// Resolve a handle, cache-first, via WebFinger on a miss.
    pub async fn resolve_handle(&self, username: &str, domain: &str) -> Result<Actor, AppError> {
        if let Some(actor) = self.store.actor_by_acct(username, Some(domain)).await? {
            if !self.is_stale(&actor) {
                ACTORS_RESOLVED_TOTAL.with_label_values(&["cache"]).inc();
                return Ok(actor);
            }
        }

        self.guard_host(domain)?;
        let jrd = webfinger::fetch_jrd(username, domain, &self.http_client).await?;
        let actor_uri = jrd.actor_uri().ok_or_else(|| {
            AppError::ActorFetch(format!(
                "WebFinger for {}@{} has no ActivityPub self link",
                username, domain
            ))
        })?;
        ACTORS_RESOLVED_TOTAL.with_label_values(&["webfinger"]).inc();

        // The document's own id becomes the canonical ap_id, even when it
        // names a different domain than the one queried.
        self.refresh_actor(actor_uri).await
    }

    /// Fetch an actor document unconditionally and upsert the result.
    ///
    /// Used on cache staleness and on receipt of an `Update` naming the
    /// actor.
    pub async fn refresh_actor(&self, uri: &str) -> Result<Actor, AppError> {
        let document = self.fetch_document(uri).await?;
        let actor = self.upsert_from_document(&document).await?;
        ACTORS_RESOLVED_TOTAL.with_label_values(&["fetch"]).inc();
        Ok(actor)
    }

    /// Resolve a signature keyId to its owning actor and public key.
    ///
    /// Cache-first through [`Self::resolve_uri`]; the fragment is stripped
    /// to obtain the actor URI.
    pub async fn actor_for_key(&self, key_id: &str) -> Result<Actor, AppError> {
        let owner_uri = key_id.split('#').next().unwrap_or(key_id);
        self.resolve_uri(owner_uri).await
    }

    /// Upsert an actor from a fetched or inlined actor document, merging
    /// mutable fields over any existing record.
    pub async fn upsert_from_document(&self, document: &Value) -> Result<Actor, AppError> {
        let parsed = parse_actor_document(document)?;
        let domain = host_of(&parsed.ap_id)?;

        let now = Utc::now();
        let actor = match self.store.actor_by_ap_id(&parsed.ap_id).await? {
            Some(mut existing) => {
                existing.display_name = parsed.display_name;
                existing.summary = parsed.summary;
                existing.inbox_uri = parsed.inbox_uri;
                existing.shared_inbox_uri = parsed.shared_inbox_uri;
                existing.outbox_uri = parsed.outbox_uri;
                existing.followers_uri = parsed.followers_uri;
                existing.following_uri = parsed.following_uri;
                existing.public_key_pem = parsed.public_key_pem;
                existing.actor_type = parsed.actor_type;
                existing.locked = parsed.locked;
                existing.bot = parsed.bot;
                existing.discoverable = parsed.discoverable;
                existing.fetched_at = Some(now);
                existing.updated_at = now;
                existing
            }
            None => Actor {
                id: EntityId::generate().to_string(),
                ap_id: parsed.ap_id,
                username: parsed.username,
                domain: Some(domain),
                display_name: parsed.display_name,
                summary: parsed.summary,
                inbox_uri: parsed.inbox_uri,
                shared_inbox_uri: parsed.shared_inbox_uri,
                outbox_uri: parsed.outbox_uri,
                followers_uri: parsed.followers_uri,
                following_uri: parsed.following_uri,
                public_key_pem: parsed.public_key_pem,
                private_key_pem: None,
                actor_type: parsed.actor_type,
                locked: parsed.locked,
                bot: parsed.bot,
                suspended: false,
                discoverable: parsed.discoverable,
                followers_count: 0,
                following_count: 0,
                statuses_count: 0,
                fetched_at: Some(now),
                created_at: now,
                updated_at: now,
            },
        };

        self.store.upsert_actor(&actor).await?;
        Ok(actor)
    }

    /// Fetch an arbitrary ActivityPub object document.
    ///
    /// Used by the relay bridge to expand announces that reference objects
    /// by URI.
    pub async fn fetch_object(&self, uri: &str) -> Result<Value, AppError> {
        self.fetch_document(uri).await
    }

    /// Best-effort handle discovery for a domain.
    ///
    /// Reads the instance's public directory and probes a short list of
    /// conventional usernames. The result is a set of suggestions only,
    /// never authoritative identity resolution.
    pub async fn suggest_handles(&self, domain: &str) -> Vec<String> {
        if self.guard_host(domain).is_err() {
            return Vec::new();
        }

        let mut handles = Vec::new();

        let directory_url = format!("https://{}/api/v1/directory?limit=10", domain);
        if let Ok(response) = self.http_client.get(&directory_url).send().await {
            if let Ok(entries) = response.json::<Value>().await {
                for entry in entries.as_array().into_iter().flatten() {
                    if let Some(acct) = entry.get("acct").and_then(Value::as_str) {
                        let handle = if acct.contains('@') {
                            acct.to_string()
                        } else {
                            format!("{}@{}", acct, domain)
                        };
                        if !handles.contains(&handle) {
                            handles.push(handle);
                        }
                    }
                }
            }
        }

        if handles.is_empty() {
            for username in COMMON_USERNAMES {
                if webfinger::fetch_jrd(username, domain, &self.http_client)
                    .await
                    .is_ok()
                {
                    handles.push(format!("{}@{}", username, domain));
                }
            }
        }

        handles
    }

    fn is_stale(&self, actor: &Actor) -> bool {
        match actor.fetched_at {
            Some(fetched_at) => {
                let age = Utc::now().signed_duration_since(fetched_at);
                age.to_std().map_or(true, |age| age > self.config.cache_ttl)
            }
            None => true,
        }
    }

    async fn fetch_document(&self, uri: &str) -> Result<Value, AppError> {
        self.guard_url(uri)?;

        let mut request = self.http_client.get(uri).header("Accept", ACTIVITY_JSON);
        if let Some(signer) = &self.signer {
            let signed = sign_request("GET", uri, None, signer)?;
            request = request
                .header("Date", signed.date)
                .header("Signature", signed.signature);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Network(format!("Fetch of {} failed: {}", uri, e)))?;

        if !response.status().is_success() {
            return Err(AppError::ActorFetch(format!(
                "Fetch of {} returned HTTP {}",
                uri,
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::ActorFetch(format!("Invalid document at {}: {}", uri, e)))
    }

    /// Reject non-HTTP(S) URLs and local/private destinations.
    fn guard_url(&self, uri: &str) -> Result<(), AppError> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::Validation(format!(
                    "Unsupported URL scheme: {}",
                    scheme
                )));
            }
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
        self.guard_host(host)
    }

    fn guard_host(&self, host: &str) -> Result<(), AppError> {
        if self.config.allow_private_addresses {
            return Ok(());
        }
        if is_disallowed_host(host) {
            return Err(AppError::Forbidden);
        }
        Ok(())
    }
}

/// Fields extracted from a Person/Service/Group document.
#[derive(Debug, Clone)]
pub struct ParsedActor {
    pub ap_id: String,
    pub actor_type: ActorType,
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox_uri: String,
    pub shared_inbox_uri: Option<String>,
    pub outbox_uri: Option<String>,
    pub followers_uri: Option<String>,
    pub following_uri: Option<String>,
    pub public_key_pem: String,
    pub locked: bool,
    pub bot: bool,
    pub discoverable: bool,
}

/// Parse an actor document into its relevant fields.
///
/// # Errors
/// `ActorFetch` when the document is not an actor or lacks required
/// fields (`id`, actor type, `inbox`, `publicKey.publicKeyPem`).
pub fn parse_actor_document(document: &Value) -> Result<ParsedActor, AppError> {
    let ap_id = string_field(document, "id")
        .ok_or_else(|| AppError::ActorFetch("Actor document missing id".to_string()))?;

    let type_str = string_field(document, "type")
        .ok_or_else(|| AppError::ActorFetch("Actor document missing type".to_string()))?;
    let actor_type = ActorType::parse(&type_str)
        .ok_or_else(|| AppError::ActorFetch(format!("Not an actor document: type {}", type_str)))?;

    let inbox_uri = string_field(document, "inbox")
        .ok_or_else(|| AppError::ActorFetch("Actor document missing inbox".to_string()))?;

    let public_key_pem = document
        .get("publicKey")
        .and_then(|key| key.get("publicKeyPem"))
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::ActorFetch("Actor document missing publicKeyPem".to_string()))?
        .to_string();

    let username = string_field(document, "preferredUsername")
        .or_else(|| last_path_segment(&ap_id))
        .ok_or_else(|| AppError::ActorFetch("Cannot derive username".to_string()))?;

    Ok(ParsedActor {
        shared_inbox_uri: document
            .get("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .and_then(Value::as_str)
            .map(str::to_string),
        ap_id,
        actor_type,
        username,
        display_name: string_field(document, "name"),
        summary: string_field(document, "summary"),
        inbox_uri,
        outbox_uri: string_field(document, "outbox"),
        followers_uri: string_field(document, "followers"),
        following_uri: string_field(document, "following"),
        public_key_pem,
        locked: bool_field(document, "manuallyApprovesFollowers"),
        bot: bool_field(document, "bot") || actor_type == ActorType::Service,
        discoverable: document
            .get("discoverable")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    })
}

fn string_field(document: &Value, field: &str) -> Option<String> {
    document.get(field).and_then(Value::as_str).map(str::to_string)
}

fn bool_field(document: &Value, field: &str) -> bool {
    document.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn last_path_segment(uri: &str) -> Option<String> {
    url::Url::parse(uri).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(|segment| segment.trim_start_matches('@').to_string())
    })
}

fn host_of(uri: &str) -> Result<String, AppError> {
    let parsed =
        url::Url::parse(uri).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?
        .to_ascii_lowercase();
    match parsed.port() {
        Some(port) => Ok(format!("{}:{}", host, port)),
        None => Ok(host),
    }
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .split(':')
        .next()
        .unwrap_or(host)
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryStore;
    use serde_json::json;

    fn person_document(ap_id: &str) -> Value {
        json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": ap_id,
            "type": "Person",
            "preferredUsername": "bob",
            "name": "Bob",
            "summary": "<p>hello</p>",
            "inbox": format!("{}/inbox", ap_id),
            "outbox": format!("{}/outbox", ap_id),
            "followers": format!("{}/followers", ap_id),
            "following": format!("{}/following", ap_id),
            "endpoints": { "sharedInbox": "https://remote.example/inbox" },
            "manuallyApprovesFollowers": false,
            "publicKey": {
                "id": format!("{}#main-key", ap_id),
                "owner": ap_id,
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nfake\n-----END PUBLIC KEY-----\n"
            }
        })
    }

    fn resolver(allow_private: bool) -> ActorResolver {
        let config = ResolverConfig {
            allow_private_addresses: allow_private,
            ..ResolverConfig::default()
        };
        ActorResolver::new(Arc::new(MemoryStore::new()), config).unwrap()
    }

    #[test]
    fn parse_actor_document_extracts_all_fields() {
        let parsed = parse_actor_document(&person_document("https://remote.example/users/bob"))
            .expect("valid document");

        assert_eq!(parsed.ap_id, "https://remote.example/users/bob");
        assert_eq!(parsed.username, "bob");
        assert_eq!(parsed.actor_type, ActorType::Person);
        assert_eq!(parsed.inbox_uri, "https://remote.example/users/bob/inbox");
        assert_eq!(
            parsed.shared_inbox_uri.as_deref(),
            Some("https://remote.example/inbox")
        );
        assert!(!parsed.locked);
        assert!(!parsed.bot);
    }

    #[test]
    fn parse_actor_document_rejects_non_actor_types() {
        let mut document = person_document("https://remote.example/users/bob");
        document["type"] = json!("Note");

        assert!(matches!(
            parse_actor_document(&document),
            Err(AppError::ActorFetch(_))
        ));
    }

    #[test]
    fn parse_actor_document_requires_public_key() {
        let mut document = person_document("https://remote.example/users/bob");
        document.as_object_mut().unwrap().remove("publicKey");

        assert!(matches!(
            parse_actor_document(&document),
            Err(AppError::ActorFetch(_))
        ));
    }

    #[tokio::test]
    async fn upsert_from_document_stores_document_id_as_canonical_ap_id() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ActorResolver::new(store.clone(), ResolverConfig::default()).unwrap();

        // The document id names a different domain than the one a caller
        // may have queried; it still becomes the canonical ap_id.
        let actor = resolver
            .upsert_from_document(&person_document("https://other.example/users/bob"))
            .await
            .unwrap();

        assert_eq!(actor.ap_id, "https://other.example/users/bob");
        assert_eq!(actor.domain.as_deref(), Some("other.example"));
        assert!(store
            .actor_by_ap_id("https://other.example/users/bob")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn upsert_from_document_merges_mutable_fields() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ActorResolver::new(store.clone(), ResolverConfig::default()).unwrap();

        let first = resolver
            .upsert_from_document(&person_document("https://remote.example/users/bob"))
            .await
            .unwrap();

        let mut updated = person_document("https://remote.example/users/bob");
        updated["name"] = json!("Bob Updated");
        updated["publicKey"]["publicKeyPem"] = json!("-----BEGIN PUBLIC KEY-----\nnew\n-----END PUBLIC KEY-----\n");

        let second = resolver.upsert_from_document(&updated).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.display_name.as_deref(), Some("Bob Updated"));
        assert!(second.public_key_pem.contains("new"));
    }

    #[test]
    fn guard_url_rejects_localhost_and_private_ranges() {
        let resolver = resolver(false);
        assert!(matches!(
            resolver.guard_url("https://localhost/users/alice"),
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            resolver.guard_url("http://192.168.1.10/users/alice"),
            Err(AppError::Forbidden)
        ));
        assert!(resolver.guard_url("https://example.com/users/alice").is_ok());
    }

    #[test]
    fn guard_url_rejects_unsupported_schemes() {
        let resolver = resolver(false);
        assert!(matches!(
            resolver.guard_url("ftp://example.com/users/alice"),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn guard_url_allows_private_ranges_when_configured() {
        let resolver = resolver(true);
        assert!(resolver.guard_url("http://127.0.0.1:3000/users/alice").is_ok());
    }
}
