//! Shared helpers for integration tests
//!
//! Boots a Lagoon node on an ephemeral port over the in-memory store, and
//! stands up stub remote peers that serve actor documents and capture
//! inbox deliveries.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::{Json as JsonBody, Router};
use http::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use lagoon::AppState;
use lagoon::config::{AppConfig, FederationConfig, InstanceConfig, LoggingConfig, ServerConfig};
use lagoon::data::MemoryStore;
use lagoon::federation::{Signer, sign_request};

/// Configuration for a test node: private addresses allowed, zero retry
/// backoff, relay mirroring off unless a test turns it on.
pub fn test_config(domain: &str) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: domain.to_string(),
            protocol: "http".to_string(),
        },
        instance: InstanceConfig {
            title: "Lagoon test".to_string(),
            description: "Test node".to_string(),
            actor_username: "instance.actor".to_string(),
        },
        federation: FederationConfig {
            request_timeout_secs: 5,
            max_redirects: 3,
            delivery_concurrency: 4,
            delivery_attempts: 3,
            retry_base_secs: 0,
            actor_cache_ttl_secs: 86_400,
            mirror_to_relays: false,
            allow_private_addresses: true,
            signature_replay_window_secs: 300,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// A running Lagoon node.
pub struct TestNode {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub base_url: String,
}

/// Boot a node on an ephemeral port and serve its router.
pub async fn start_node() -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let domain = addr.to_string();

    let store = Arc::new(MemoryStore::new());
    let state = AppState::with_store(test_config(&domain), store.clone())
        .await
        .expect("app state");

    let app = lagoon::build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    TestNode {
        state,
        store,
        base_url: format!("http://{}", domain),
    }
}

#[derive(Clone)]
struct PeerState {
    base_url: String,
    public_key_pem: String,
    deliveries: Arc<Mutex<Vec<Value>>>,
    personal_hits: Arc<AtomicUsize>,
    shared_hits: Arc<AtomicUsize>,
    fail_hits: Arc<AtomicUsize>,
}

/// A stub remote server: serves actor documents for any username, records
/// everything POSTed to its inboxes, and exposes an always-failing inbox.
pub struct RemotePeer {
    pub base_url: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
    deliveries: Arc<Mutex<Vec<Value>>>,
    personal_hits: Arc<AtomicUsize>,
    shared_hits: Arc<AtomicUsize>,
    fail_hits: Arc<AtomicUsize>,
}

impl RemotePeer {
    pub fn actor_uri(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url, username)
    }

    pub fn key_id(&self, username: &str) -> String {
        format!("{}#main-key", self.actor_uri(username))
    }

    pub fn inbox_uri(&self, username: &str) -> String {
        format!("{}/users/{}/inbox", self.base_url, username)
    }

    pub fn shared_inbox_uri(&self) -> String {
        format!("{}/inbox", self.base_url)
    }

    pub fn failing_inbox_uri(&self) -> String {
        format!("{}/fail", self.base_url)
    }

    pub async fn deliveries(&self) -> Vec<Value> {
        self.deliveries.lock().await.clone()
    }

    pub fn personal_inbox_hits(&self) -> usize {
        self.personal_hits.load(Ordering::SeqCst)
    }

    pub fn shared_inbox_hits(&self) -> usize {
        self.shared_hits.load(Ordering::SeqCst)
    }

    pub fn failing_inbox_hits(&self) -> usize {
        self.fail_hits.load(Ordering::SeqCst)
    }

    /// Sign an activity with this peer's key and POST it to a URL.
    pub async fn post_signed(&self, username: &str, url: &str, activity: &Value) -> u16 {
        let bytes = serde_json::to_vec(activity).expect("serialize");
        let signer = Signer {
            key_id: self.key_id(username),
            private_key_pem: self.private_key_pem.clone(),
        };
        let signed = sign_request("POST", url, Some(&bytes), &signer).expect("sign");

        let client = reqwest::Client::new();
        let mut request = client
            .post(url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        request
            .body(bytes)
            .send()
            .await
            .expect("request")
            .status()
            .as_u16()
    }
}

/// Boot a stub peer with a fresh RSA keypair.
pub async fn start_remote_peer() -> RemotePeer {
    let (private_key_pem, public_key_pem) = generate_keypair();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let base_url = format!("http://{}", addr);

    let peer_state = PeerState {
        base_url: base_url.clone(),
        public_key_pem: public_key_pem.clone(),
        deliveries: Arc::new(Mutex::new(Vec::new())),
        personal_hits: Arc::new(AtomicUsize::new(0)),
        shared_hits: Arc::new(AtomicUsize::new(0)),
        fail_hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route("/users/:username", get(peer_actor_document))
        .route("/users/:username/inbox", post(peer_personal_inbox))
        .route("/inbox", post(peer_shared_inbox))
        .route("/fail", post(peer_failing_inbox))
        .with_state(peer_state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve peer");
    });

    RemotePeer {
        base_url,
        private_key_pem,
        public_key_pem,
        deliveries: peer_state.deliveries,
        personal_hits: peer_state.personal_hits,
        shared_hits: peer_state.shared_hits,
        fail_hits: peer_state.fail_hits,
    }
}

async fn peer_actor_document(
    State(peer): State<PeerState>,
    Path(username): Path<String>,
) -> Json<Value> {
    let actor_uri = format!("{}/users/{}", peer.base_url, username);
    Json(json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": actor_uri,
        "type": "Person",
        "preferredUsername": username,
        "inbox": format!("{}/inbox", actor_uri),
        "outbox": format!("{}/outbox", actor_uri),
        "followers": format!("{}/followers", actor_uri),
        "endpoints": { "sharedInbox": format!("{}/inbox", peer.base_url) },
        "manuallyApprovesFollowers": false,
        "publicKey": {
            "id": format!("{}#main-key", actor_uri),
            "owner": actor_uri,
            "publicKeyPem": peer.public_key_pem
        }
    }))
}

async fn peer_personal_inbox(
    State(peer): State<PeerState>,
    JsonBody(activity): JsonBody<Value>,
) -> StatusCode {
    peer.personal_hits.fetch_add(1, Ordering::SeqCst);
    peer.deliveries.lock().await.push(activity);
    StatusCode::ACCEPTED
}

async fn peer_shared_inbox(
    State(peer): State<PeerState>,
    JsonBody(activity): JsonBody<Value>,
) -> StatusCode {
    peer.shared_hits.fetch_add(1, Ordering::SeqCst);
    peer.deliveries.lock().await.push(activity);
    StatusCode::ACCEPTED
}

async fn peer_failing_inbox(State(peer): State<PeerState>) -> StatusCode {
    peer.fail_hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Generate a small RSA keypair for test actors.
pub fn generate_keypair() -> (String, String) {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation");
    let public_key = RsaPublicKey::from(&private_key);

    (
        private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private pem")
            .to_string(),
        public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("public pem"),
    )
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
