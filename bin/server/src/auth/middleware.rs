//! Authentication middleware and extractors for Axum.
//!
//! [`require_auth`] gates protected routes: it loads a session from the
//! cookie or a bearer token, revalidates it against the identity provider
//! when stale, and either forwards the request with an [`AuthUser`]
//! attached or turns it away. [`optional_auth`] attaches the user when
//! present but never blocks.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode, header, request::Parts};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use axum_extra::extract::CookieJar;
use gatehouse_gateway::{Session, SessionSource, TokenInfo};
use std::convert::Infallible;

use super::{AppState, apply_cookie_update, session_cookie_value};

/// The authenticated principal, attached as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: Option<String>,
    pub access_token: String,
    pub token_info: Option<TokenInfo>,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AuthRejection)
    }
}

impl<S> OptionalFromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<AuthUser>().cloned())
    }
}

/// Raised when a handler extracts [`AuthUser`] on a route that never went
/// through [`require_auth`].
#[derive(Debug)]
pub struct AuthRejection;

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        tracing::error!("AuthUser extracted on a route without require_auth");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

/// The bearer token from an `Authorization` header, if any.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn redirect_to_login(state: &AppState, original: &str) -> Response {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("redirect_uri", original)
        .finish();
    let target = format!("{}/login?{query}", state.provider.config().basepath());
    Redirect::temporary(&target).into_response()
}

/// Gate for protected routes.
///
/// Cookie callers without a granted session are cleared and sent through
/// login with the original URL as `redirect_uri`. Bearer callers
/// presented credentials, so a denial is a plain 403. Revalidation
/// failures (timeouts, unreachable provider) deny by default.
pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let bearer = bearer_token(req.headers());
    let jar = CookieJar::from_headers(req.headers());
    let cookie = session_cookie_value(&state, &jar);
    let original = req
        .uri()
        .path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());

    let mut session = match &bearer {
        Some(token) => state.provider.load_bearer_session(token),
        None => state.provider.load_cookie_session(cookie.as_deref()).await,
    };

    if !session.is_authenticated() {
        // No usable credentials at all.
        return redirect_to_login(&state, &original);
    }

    if let Err(err) = session
        .update(state.provider.client(), state.provider.config())
        .await
    {
        tracing::error!(error = %err, "session revalidation failed, denying");
        return deny(&state, &mut session, jar, cookie.as_deref(), &original, bearer.is_some())
            .await;
    }

    if !session.is_access_granted(state.provider.config()) {
        if bearer.is_some() {
            // Remember the denial so repeated presentations of the same
            // dead token skip the upstream round trip.
            state.provider.store_bearer_session(&mut session);
            return StatusCode::FORBIDDEN.into_response();
        }
        return deny(&state, &mut session, jar, cookie.as_deref(), &original, false).await;
    }

    let Some(access_token) = session.access_token().map(str::to_string) else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let user = AuthUser {
        username: session.username().map(str::to_string),
        access_token,
        token_info: session.token_info().cloned(),
    };

    let mut req = req;
    req.extensions_mut().insert(user);
    let response = next.run(req).await;

    // Write back whatever revalidation changed.
    if bearer.is_some() {
        state.provider.store_bearer_session(&mut session);
        return response;
    }
    match state
        .provider
        .store_cookie_session(&mut session, cookie.as_deref())
        .await
    {
        Ok(update) => (apply_cookie_update(&state, jar, update), response).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to persist session");
            response
        }
    }
}

/// Attaches an [`AuthUser`] when a granted session is present; never
/// blocks the request.
pub async fn optional_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let bearer = bearer_token(req.headers());
    let jar = CookieJar::from_headers(req.headers());
    let cookie = session_cookie_value(&state, &jar);

    let mut session = match &bearer {
        Some(token) => state.provider.load_bearer_session(token),
        None => state.provider.load_cookie_session(cookie.as_deref()).await,
    };

    if session.is_authenticated() {
        if let Err(err) = session
            .update(state.provider.client(), state.provider.config())
            .await
        {
            tracing::debug!(error = %err, "optional revalidation failed");
        }
    }

    let mut req = req;
    if session.is_access_granted(state.provider.config())
        && let Some(access_token) = session.access_token().map(str::to_string)
    {
        req.extensions_mut().insert(AuthUser {
            username: session.username().map(str::to_string),
            access_token,
            token_info: session.token_info().cloned(),
        });
    }
    let response = next.run(req).await;

    if bearer.is_some() {
        state.provider.store_bearer_session(&mut session);
        return response;
    }
    match state
        .provider
        .store_cookie_session(&mut session, cookie.as_deref())
        .await
    {
        Ok(update) => (apply_cookie_update(&state, jar, update), response).into_response(),
        Err(err) => {
            tracing::debug!(error = %err, "failed to persist session");
            response
        }
    }
}

/// Clears a known-invalid cookie session and sends the browser through
/// login.
async fn deny(
    state: &AppState,
    session: &mut Session,
    jar: CookieJar,
    cookie: Option<&str>,
    original: &str,
    is_bearer: bool,
) -> Response {
    if is_bearer {
        return StatusCode::FORBIDDEN.into_response();
    }
    debug_assert_eq!(session.source(), SessionSource::Cookie);

    session.clear();
    match state.provider.store_cookie_session(session, cookie).await {
        Ok(update) => {
            let jar = apply_cookie_update(state, jar, update);
            (jar, redirect_to_login(state, original)).into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to clear session");
            redirect_to_login(state, original)
        }
    }
}
