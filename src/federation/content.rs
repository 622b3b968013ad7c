//! Content processing for inbound objects
//!
//! Sanitizes remote HTML, extracts mentions and hashtags, and derives
//! visibility from the audience fields of an object.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::data::Visibility;

/// The ActivityStreams public collection.
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

static MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@([A-Za-z0-9_]+)@([A-Za-z0-9][A-Za-z0-9.-]*\.[A-Za-z]{2,})").expect("valid regex")
});

static HASHTAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#([\p{L}\p{N}_]+)").expect("valid regex"));

/// Sanitize remote HTML down to a safe subset.
pub fn sanitize_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Strip all markup, leaving the plain-text rendering.
pub fn plain_text(content: &str) -> String {
    ammonia::Builder::empty().clean(content).to_string()
}

/// Extract `user@domain` mentions from plain text.
///
/// Returns lowercased `(username, domain)` pairs, deduplicated in order of
/// first appearance.
pub fn extract_mentions(text: &str) -> Vec<(String, String)> {
    let mut mentions = Vec::new();
    for capture in MENTION_RE.captures_iter(text) {
        let pair = (
            capture[1].to_ascii_lowercase(),
            capture[2].to_ascii_lowercase(),
        );
        if !mentions.contains(&pair) {
            mentions.push(pair);
        }
    }
    mentions
}

/// Extract hashtags from plain text, lowercased and deduplicated.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut hashtags = Vec::new();
    for capture in HASHTAG_RE.captures_iter(text) {
        let tag = capture[1].to_lowercase();
        if !hashtags.contains(&tag) {
            hashtags.push(tag);
        }
    }
    hashtags
}

/// Actor URIs named by `tag` entries of type `Mention`.
pub fn mention_hrefs(object: &Value) -> Vec<String> {
    let mut hrefs = Vec::new();
    for tag in object
        .get("tag")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if tag.get("type").and_then(Value::as_str) != Some("Mention") {
            continue;
        }
        if let Some(href) = tag.get("href").and_then(Value::as_str) {
            if !hrefs.iter().any(|existing| existing == href) {
                hrefs.push(href.to_string());
            }
        }
    }
    hrefs
}

/// Derive visibility from an object's `to`/`cc` audience.
///
/// Public collection in `to` is public; in `cc` it is unlisted. The
/// author's followers collection in `to` without the public collection is
/// followers-only; anything else is direct.
pub fn visibility_from_audience(object: &Value, followers_uri: Option<&str>) -> Visibility {
    let to_public = audience_contains(object.get("to"), PUBLIC_COLLECTION);
    let cc_public = audience_contains(object.get("cc"), PUBLIC_COLLECTION);

    if to_public {
        Visibility::Public
    } else if cc_public {
        Visibility::Unlisted
    } else if followers_uri.is_some_and(|uri| audience_contains(object.get("to"), uri)) {
        Visibility::Private
    } else {
        Visibility::Direct
    }
}

fn audience_contains(audience: Option<&Value>, uri: &str) -> bool {
    match audience {
        Some(Value::String(value)) => value == uri,
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(Value::as_str)
            .any(|value| value == uri),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_mentions_finds_remote_handles() {
        let mentions = extract_mentions("hey @Alice@local.example and @bob@remote.example!");
        assert_eq!(
            mentions,
            vec![
                ("alice".to_string(), "local.example".to_string()),
                ("bob".to_string(), "remote.example".to_string()),
            ]
        );
    }

    #[test]
    fn extract_mentions_deduplicates() {
        let mentions = extract_mentions("@bob@remote.example @bob@remote.example");
        assert_eq!(mentions.len(), 1);
    }

    #[test]
    fn extract_hashtags_lowercases_and_deduplicates() {
        let hashtags = extract_hashtags("#Rust is great #rust #Federation");
        assert_eq!(hashtags, vec!["rust".to_string(), "federation".to_string()]);
    }

    #[test]
    fn mention_hrefs_reads_mention_tags_only() {
        let object = json!({
            "tag": [
                { "type": "Mention", "href": "https://local.example/users/alice", "name": "@alice" },
                { "type": "Hashtag", "href": "https://remote.example/tags/rust", "name": "#rust" },
            ]
        });

        assert_eq!(
            mention_hrefs(&object),
            vec!["https://local.example/users/alice".to_string()]
        );
    }

    #[test]
    fn sanitize_html_strips_script_tags() {
        let sanitized = sanitize_html("<p>hello</p><script>alert(1)</script>");
        assert!(sanitized.contains("<p>hello</p>"));
        assert!(!sanitized.contains("script"));
    }

    #[test]
    fn plain_text_strips_all_markup() {
        assert_eq!(plain_text("<p>hello <b>world</b></p>"), "hello world");
    }

    #[test]
    fn visibility_public_when_to_contains_public_collection() {
        let object = json!({
            "to": [PUBLIC_COLLECTION],
            "cc": ["https://remote.example/users/bob/followers"],
        });
        assert_eq!(
            visibility_from_audience(&object, Some("https://remote.example/users/bob/followers")),
            Visibility::Public
        );
    }

    #[test]
    fn visibility_unlisted_when_public_collection_is_cc() {
        let object = json!({
            "to": ["https://remote.example/users/bob/followers"],
            "cc": [PUBLIC_COLLECTION],
        });
        assert_eq!(
            visibility_from_audience(&object, Some("https://remote.example/users/bob/followers")),
            Visibility::Unlisted
        );
    }

    #[test]
    fn visibility_private_for_followers_only_audience() {
        let object = json!({
            "to": ["https://remote.example/users/bob/followers"],
        });
        assert_eq!(
            visibility_from_audience(&object, Some("https://remote.example/users/bob/followers")),
            Visibility::Private
        );
    }

    #[test]
    fn visibility_direct_for_explicit_recipients_only() {
        let object = json!({
            "to": ["https://local.example/users/alice"],
        });
        assert_eq!(
            visibility_from_audience(&object, Some("https://remote.example/users/bob/followers")),
            Visibility::Direct
        );
    }
}
