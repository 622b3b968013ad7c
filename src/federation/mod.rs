//! ActivityPub federation engine
//!
//! Handles:
//! - HTTP Signatures (signing and verification)
//! - WebFinger discovery
//! - Remote actor resolution and caching
//! - Inbound activity dispatch
//! - Outbound delivery with audience computation and retry
//! - Relay broadcast bridging

pub mod content;
pub mod inbound;
pub mod outbound;
pub mod relay;
pub mod resolver;
pub mod signature;
pub mod webfinger;

pub use inbound::{DispatchOutcome, Envelope, InboundDispatcher};
pub use outbound::{DeliveryConfig, DeliveryOutcome, DeliveryService, audience_for_visibility, dedupe_delivery_inboxes};
pub use relay::RelayBridge;
pub use resolver::{ActorResolver, ResolverConfig, parse_actor_document};
pub use signature::{
    Signer, extract_key_id, key_owner_matches_actor, parse_signature_header, sign_request,
    verify_request,
};
pub use webfinger::{WebFingerLink, WebFingerResponse, local_jrd, split_handle};
