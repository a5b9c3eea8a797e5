use std::sync::LazyLock;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use regex::Regex;
use thiserror::Error;

use crate::auth::AuthError;

pub const WWW_AUTHENTICATE_VALUE: &str = "Basic realm=\"GitRepublic\"";

const CREDENTIAL_HELPER_HINT: &str = "\
pushing requires nostr authentication.

install the credential helper and point git at it:

    git config --global credential.helper nostr

then export your key in one of NOSTRGIT_SECRET_KEY_CLIENT, NOSTRGIT_SECRET_KEY,
NOSTR_PRIVATE_KEY or NSEC and push again.
";

/// Request-level error taxonomy. Everything that leaves the process goes
/// through [`sanitize`] so key material never reaches a response body.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Backend(String),
    #[error("git backend timed out")]
    Timeout,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, sanitize(&msg)).into_response()
            }
            GatewayError::Auth(reason) => (
                StatusCode::UNAUTHORIZED,
                [
                    (header::WWW_AUTHENTICATE, WWW_AUTHENTICATE_VALUE),
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                ],
                format!("{}\n\n{CREDENTIAL_HELPER_HINT}", sanitize(&reason.to_string())),
            )
                .into_response(),
            GatewayError::Permission(body) => (
                StatusCode::FORBIDDEN,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                sanitize(&body),
            )
                .into_response(),
            GatewayError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, sanitize(&msg)).into_response()
            }
            GatewayError::Backend(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                sanitize(&msg),
            )
                .into_response(),
            GatewayError::Timeout => {
                (StatusCode::GATEWAY_TIMEOUT, "git backend timed out".to_string()).into_response()
            }
        }
    }
}

static HEX64_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9a-f]{64}").expect("valid regex"));
static NSEC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"nsec1[02-9ac-hj-np-z]+").expect("valid regex"));

/// Strip anything that could be a key encoding from an outbound string:
/// 64-char lowercase hex runs and nsec bech32 strings.
pub fn sanitize(msg: &str) -> String {
    let msg = NSEC_RE.replace_all(msg, "<redacted>");
    HEX64_RE.replace_all(&msg, "<redacted>").to_string()
}
