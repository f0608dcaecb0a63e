//! Authentication plumbing for the gatehouse server.
//!
//! This module provides:
//! - the service routes for the OAuth2 gateway (login, callback, logout,
//!   decrypt, token, validate, introspect, discovery)
//! - authentication middleware and the [`AuthUser`] extractor for
//!   protected routes
//! - shared helpers for session cookies and request-parameter merging
//!
//! All protocol and policy decisions live in `gatehouse-gateway`; this
//! module only translates between axum and the gateway's operations.

pub mod middleware;
pub mod routes;

pub use middleware::{AuthUser, optional_auth, require_auth};
pub use routes::router;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Request, request::Parts};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use gatehouse_gateway::{CookieUpdate, MergedParams, Provider};

/// Request bodies past this size are ignored rather than buffered.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub provider: Provider,
    pub secure_cookies: bool,
}

/// Splits a request and merges its query and body parameters.
pub(crate) async fn read_params(req: Request<Body>) -> (Parts, MergedParams) {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .unwrap_or_default();
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let params = MergedParams::from_query_and_body(parts.uri.query(), content_type, &bytes);
    (parts, params)
}

/// The callback URL the identity provider should redirect back to, as
/// seen by the client: forwarded proto and host when behind a proxy,
/// otherwise derived from the server's own settings.
pub(crate) fn derive_callback_url(state: &AppState, headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(if state.secure_cookies { "https" } else { "http" });
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}{}", state.provider.config().basepath())
}

/// Applies a gateway cookie instruction to the jar.
pub(crate) fn apply_cookie_update(
    state: &AppState,
    jar: CookieJar,
    update: Option<CookieUpdate>,
) -> CookieJar {
    let name = state.provider.config().session_cookie().to_string();
    match update {
        None => jar,
        Some(CookieUpdate::Set(value)) => {
            let mut builder = Cookie::build((name, value))
                .path("/")
                .http_only(true)
                .secure(state.secure_cookies)
                .same_site(SameSite::Lax);
            if let Some(bound) = state.provider.config().expires_in() {
                builder = builder.max_age(time::Duration::seconds(bound.num_seconds()));
            }
            jar.add(builder.build())
        }
        Some(CookieUpdate::Remove) => jar.remove(Cookie::build((name, "")).path("/").build()),
    }
}

/// The session cookie value from a request, if present.
pub(crate) fn session_cookie_value(state: &AppState, jar: &CookieJar) -> Option<String> {
    jar.get(state.provider.config().session_cookie())
        .map(|c| c.value().to_string())
}
