//! HTTP Signatures for ActivityPub
//!
//! Signs outgoing requests with a local actor's RSA key and verifies
//! incoming ones against a resolved public key. The signing string covers
//! `(request-target)`, `host`, `date` and, when a body is present,
//! `digest`. Verification fails closed: any missing or unparseable piece
//! rejects the request with no local state change.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use crate::data::Actor;
use crate::error::AppError;

/// Replay window for inbound Date headers, in seconds.
pub const DEFAULT_REPLAY_WINDOW_SECS: i64 = 300;

/// Signing identity for outbound requests.
///
/// Carried separately from [`Actor`] so delivery code never handles an
/// actor without key material.
#[derive(Debug, Clone)]
pub struct Signer {
    /// Key URL advertised in the actor document (`<ap_id>#main-key`)
    pub key_id: String,
    /// RSA private key (PEM)
    pub private_key_pem: String,
}

impl Signer {
    /// Build a signer from a local actor.
    ///
    /// # Errors
    /// Validation error when the actor carries no private key (remote
    /// actors never do).
    pub fn for_actor(actor: &Actor) -> Result<Self, AppError> {
        let private_key_pem = actor.private_key_pem.clone().ok_or_else(|| {
            AppError::Validation(format!("Actor {} has no private key", actor.ap_id))
        })?;
        Ok(Self {
            key_id: actor.key_id(),
            private_key_pem,
        })
    }
}

/// Headers to attach to a signed request.
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616 / IMF-fixdate)
    pub date: String,
    /// Digest header value (when a body is present)
    pub digest: Option<String>,
}

/// Sign an HTTP request.
///
/// Builds the canonical signing string over `(request-target)`, `host`,
/// `date` and (with a body) `digest`, signs it RSA-SHA256 and returns the
/// headers to attach.
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    signer: &Signer,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    // Non-default ports appear in the Host header the peer receives, so
    // they must be part of the signed string too.
    let host = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut request_target = format!("{} {}", method.to_lowercase(), parsed_url.path());
    if let Some(query) = parsed_url.query() {
        request_target.push('?');
        request_target.push_str(query);
    }

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(body_digest);

    let mut signed_headers = vec!["(request-target)", "host", "date"];
    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    if let Some(ref digest_value) = digest {
        signed_headers.push("digest");
        signing_parts.push(format!("digest: {}", digest_value));
    }
    let signing_string = signing_parts.join("\n");

    let private_key = RsaPrivateKey::from_pkcs8_pem(&signer.private_key_pem)
        .map_err(|e| AppError::Signature(format!("Invalid private key: {}", e)))?;
    // new_unprefixed matches the hash handling of the wider ecosystem.
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        signer.key_id,
        signed_headers.join(" "),
        BASE64.encode(signature.to_bytes()),
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// Verify an inbound request signature against a known public key.
///
/// Reconstructs the signing string from exactly the headers named in the
/// `Signature` header and checks it cryptographically. The `Date` header
/// must fall inside the replay window, and the body digest (when a body is
/// present) must match.
///
/// # Errors
/// `AppError::Signature` on every rejection path; verification failures
/// are terminal for the request and never retried.
pub fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    replay_window_secs: i64,
) -> Result<(), AppError> {
    let parsed = parse_signature_header(signature_header_value(headers)?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Signature(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Signature(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }
    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Signature(
            "Signed headers must include: digest".to_string(),
        ));
    }

    let date_str = header_str(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Signature("Invalid Date format".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > replay_window_secs {
        return Err(AppError::Signature(
            "Date header outside of replay window".to_string(),
        ));
    }

    if let Some(body_bytes) = body {
        let digest_str = header_str(headers, "digest")?;
        if digest_str != body_digest(body_bytes) {
            return Err(AppError::Signature("Digest mismatch".to_string()));
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            name => format!("{}: {}", name, header_str(headers, name)?),
        };
        signing_parts.push(value);
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Signature("Invalid signature encoding".to_string()))?;
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Signature(format!("Invalid public key: {}", e)))?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Signature(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::Signature("Signature verification failed".to_string()))
}

/// Extract the keyId from a request's Signature header.
pub fn extract_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let parsed = parse_signature_header(signature_header_value(headers)?)?;
    Ok(parsed.key_id)
}

/// Whether a keyId and an actor id name the same actor (fragment ignored).
pub fn key_owner_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_owner = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_owner == actor
}

/// Parsed Signature header fields.
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse a `Signature` header value of the form
/// `keyId="...",algorithm="...",headers="...",signature="..."`.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(str::to_ascii_lowercase)
                        .collect(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {} // Ignore unknown fields
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Signature("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Signature("Missing algorithm".to_string()))?,
        headers: headers.ok_or_else(|| AppError::Signature("Missing headers".to_string()))?,
        signature: signature
            .ok_or_else(|| AppError::Signature("Missing signature".to_string()))?,
    })
}

/// SHA-256 body digest in `SHA-256=<base64>` form.
pub fn body_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}

fn signature_header_value(headers: &http::HeaderMap) -> Result<&str, AppError> {
    headers
        .get("signature")
        .ok_or_else(|| AppError::Signature("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Signature("Invalid Signature header".to_string()))
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Signature(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Signature(format!("Invalid {} header", name)))
}
