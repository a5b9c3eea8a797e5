use base64::Engine;
use nostr::JsonUtil;
use nostr_sdk::{
    hashes::{sha256::Hash as Sha256Hash, Hash},
    PublicKey, Timestamp,
};
use thiserror::Error;

/// Maximum clock skew accepted on a NIP-98 event, in either direction.
pub const AUTH_FRESHNESS_SECS: u64 = 60;

const NIP98_KIND: u16 = 27235;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no nostr authorization supplied")]
    MissingAuth,
    #[error("authorization header is not a nostr event")]
    Malformed,
    #[error("event signature does not verify")]
    BadSignature,
    #[error("event is not kind 27235")]
    WrongKind,
    #[error("auth event content must be empty")]
    NonEmptyContent,
    #[error("auth event is bound to a different url")]
    UrlMismatch,
    #[error("auth event is bound to a different method")]
    MethodMismatch,
    #[error("auth event has expired")]
    Expired,
    #[error("auth event is timestamped in the future")]
    FutureTimestamp,
    #[error("auth event payload hash does not match the request body")]
    BodyHashMismatch,
}

/// Extract the signed event from an `Authorization` header value.
///
/// Accepts `Nostr <base64 event>` directly, or the credential-helper
/// translation `Basic <base64 of "nostr:<base64 event>">`.
pub fn parse_authorization(header: &str) -> Result<nostr::Event, AuthError> {
    let encoded = if let Some(rest) = header.strip_prefix("Nostr ") {
        rest.trim().to_string()
    } else if let Some(rest) = header.strip_prefix("Basic ") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(rest.trim())
            .map_err(|_| AuthError::MissingAuth)?;
        let credentials = String::from_utf8(decoded).map_err(|_| AuthError::MissingAuth)?;
        let (username, password) = credentials.split_once(':').ok_or(AuthError::MissingAuth)?;
        if username != "nostr" {
            return Err(AuthError::MissingAuth);
        }
        password
            .chars()
            .filter(|c| !matches!(c, '\r' | '\n' | '\t' | '\0'))
            .collect()
    } else {
        return Err(AuthError::MissingAuth);
    };

    let json = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|_| AuthError::Malformed)?;
    nostr::Event::from_json(json).map_err(|_| AuthError::Malformed)
}

/// Verify a NIP-98 event against the request it claims to authorize and
/// return the authenticated public key.
pub fn verify_nip98(
    header: &str,
    expected_url: &str,
    expected_method: &str,
    body: Option<&[u8]>,
) -> Result<PublicKey, AuthError> {
    let event = parse_authorization(header)?;
    verify_nip98_event(&event, expected_url, expected_method, body)?;
    Ok(event.pubkey)
}

pub fn verify_nip98_event(
    event: &nostr::Event,
    expected_url: &str,
    expected_method: &str,
    body: Option<&[u8]>,
) -> Result<(), AuthError> {
    event.verify().map_err(|_| AuthError::BadSignature)?;

    if event.kind.as_u16() != NIP98_KIND {
        return Err(AuthError::WrongKind);
    }
    if !event.content.is_empty() {
        return Err(AuthError::NonEmptyContent);
    }

    let url = tag_value(event, "u").ok_or(AuthError::UrlMismatch)?;
    if normalize_url(&url) != normalize_url(expected_url) {
        return Err(AuthError::UrlMismatch);
    }

    let method = tag_value(event, "method").ok_or(AuthError::MethodMismatch)?;
    if method.to_uppercase() != expected_method.to_uppercase() {
        return Err(AuthError::MethodMismatch);
    }

    let now = Timestamp::now().as_u64();
    let created_at = event.created_at.as_u64();
    if created_at > now + AUTH_FRESHNESS_SECS {
        return Err(AuthError::FutureTimestamp);
    }
    if created_at + AUTH_FRESHNESS_SECS < now {
        return Err(AuthError::Expired);
    }

    if let Some(body) = body {
        if !body.is_empty() {
            // A payload tag, when present, must commit to the body. Helpers
            // signing ahead of the POST cannot know the pack bytes, so an
            // absent tag is accepted.
            if let Some(payload) = tag_value(event, "payload") {
                if payload != Sha256Hash::hash(body).to_string() {
                    return Err(AuthError::BodyHashMismatch);
                }
            }
        }
    }

    Ok(())
}

fn tag_value(event: &nostr::Event, tag_name: &str) -> Option<String> {
    event
        .tags
        .iter()
        .find(|t| t.as_slice()[0].eq(tag_name))
        .and_then(|t| t.as_slice().get(1).cloned())
}

/// Compare URLs with the trailing slash of the path removed, so that
/// `https://h/a/` and `https://h/a` bind to the same request.
fn normalize_url(url: &str) -> String {
    match url.split_once('?') {
        Some((path, query)) => format!("{}?{query}", path.trim_end_matches('/')),
        None => url.trim_end_matches('/').to_string(),
    }
}
