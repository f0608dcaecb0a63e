//! Service routes for the OAuth2 gateway.
//!
//! Every endpoint accepts GET with query parameters or POST with a form
//! or JSON body; query parameters win for overlapping keys. Handlers stay
//! thin: merge parameters, call the provider operation, translate the
//! outcome to a response.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::{any, get};
use axum::Router;
use axum_extra::extract::cookie::CookieJar;
use gatehouse_gateway::{CallbackOutcome, GatewayError, LoginAttempt, SessionSource};

use super::{
    AppState, apply_cookie_update, derive_callback_url, read_params, session_cookie_value,
};

/// Builds the service router, nested under the configured basepath.
pub fn router(state: AppState) -> Router {
    let basepath = state.provider.config().basepath().to_string();
    let service = Router::new()
        // Dispatch target for the identity provider's redirect: the
        // basepath root carries the `state` parameter.
        .route("/", any(authorize_response))
        .route("/login", any(login))
        .route("/logout", any(logout))
        .route("/decrypt", any(decrypt))
        .route("/token", any(token))
        .route("/validate", any(validate))
        .route("/introspect", any(introspect))
        .route("/.well-known/openid-configuration", get(discovery))
        .with_state(state);
    Router::new().nest(&basepath, service)
}

/// Translates a gateway error into a response.
///
/// Reload-class errors send the browser back through login; everything
/// else becomes its mapped status with the error text as the body. Tokens
/// never appear in these messages.
pub(crate) fn error_response(state: &AppState, err: GatewayError) -> Response {
    if err.wants_reload() {
        tracing::warn!(error = %err, "sending client back through login");
        let login = format!("{}/login", state.provider.config().basepath());
        return Redirect::temporary(&login).into_response();
    }

    if err.suppress_logging() {
        tracing::debug!(error = %err, "request rejected");
    } else {
        tracing::error!(error = %err, "auth service error");
    }

    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

/// Starts the authorization-code dance.
async fn login(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (parts, params) = read_params(req).await;
    let callback_url = derive_callback_url(&state, &parts.headers);
    let attempt = LoginAttempt {
        accept: parts
            .headers
            .get(axum::http::header::ACCEPT)
            .and_then(|v| v.to_str().ok()),
        user_agent: parts
            .headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok()),
    };

    match state.provider.begin_login(&params, &attempt, &callback_url) {
        Ok(location) => Redirect::temporary(&location).into_response(),
        Err(err) => error_response(&state, err),
    }
}

/// Completes the dance when the identity provider redirects back.
async fn authorize_response(State(state): State<AppState>, req: Request<Body>) -> Response {
    let jar = CookieJar::from_headers(req.headers());
    let cookie = session_cookie_value(&state, &jar);
    let (parts, params) = read_params(req).await;
    let callback_url = derive_callback_url(&state, &parts.headers);

    let mut session = state.provider.load_cookie_session(cookie.as_deref()).await;
    let outcome = match state
        .provider
        .handle_authorize_response(&params, &mut session, &callback_url)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return error_response(&state, err),
    };

    match outcome {
        CallbackOutcome::SessionEstablished { location } => {
            match state
                .provider
                .store_cookie_session(&mut session, cookie.as_deref())
                .await
            {
                Ok(update) => {
                    let jar = apply_cookie_update(&state, jar, update);
                    (jar, Redirect::temporary(&location)).into_response()
                }
                Err(err) => error_response(&state, err),
            }
        }
        CallbackOutcome::TokenBundle { body } => Json(body).into_response(),
        CallbackOutcome::TokenLink { location } => Redirect::temporary(&location).into_response(),
    }
}

/// Ends the session, best-effort revoking its tokens.
async fn logout(State(state): State<AppState>, req: Request<Body>) -> Response {
    let jar = CookieJar::from_headers(req.headers());
    let cookie = session_cookie_value(&state, &jar);
    let bearer = super::middleware::bearer_token(req.headers());
    let (_, params) = read_params(req).await;

    let mut session = match &bearer {
        Some(token) => state.provider.load_bearer_session(token),
        None => state.provider.load_cookie_session(cookie.as_deref()).await,
    };

    let location = state.provider.logout(&params, &mut session).await;

    if session.source() == SessionSource::Bearer {
        return Redirect::temporary(&location).into_response();
    }

    match state
        .provider
        .store_cookie_session(&mut session, cookie.as_deref())
        .await
    {
        Ok(update) => {
            let jar = apply_cookie_update(&state, jar, update);
            (jar, Redirect::temporary(&location)).into_response()
        }
        Err(err) => error_response(&state, err),
    }
}

/// Decrypts a previously issued opaque value.
async fn decrypt(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (_, params) = read_params(req).await;
    match state.provider.decrypt_value(&params) {
        Ok(value) => Json(value).into_response(),
        Err(err) => error_response(&state, err),
    }
}

/// Mints a fresh token bundle from a sealed refresh token.
async fn token(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (_, params) = read_params(req).await;
    match state.provider.mint_from_refresh(&params).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => error_response(&state, err),
    }
}

/// Checks an access token; 200 with the introspection claims when
/// active.
async fn validate(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (_, params) = read_params(req).await;
    match state.provider.validate_token(&params).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => error_response(&state, err),
    }
}

/// Raw introspection passthrough, gated by configuration.
async fn introspect(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (_, params) = read_params(req).await;
    match state.provider.introspect_token(&params).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => error_response(&state, err),
    }
}

/// The `.well-known/openid-configuration` document.
async fn discovery(State(state): State<AppState>) -> Response {
    Json(state.provider.discovery_document()).into_response()
}

#[cfg(test)]
mod tests {
    use super::super::middleware::{AuthUser, require_auth};
    use super::*;
    use axum::extract::Form;
    use axum::http::header;
    use axum::middleware::from_fn_with_state;
    use gatehouse_gateway::{AuthorizeState, Provider, ProviderSettings};
    use serde_json::json;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    /// Mock identity provider backing the end-to-end scenarios. The
    /// revoke endpoint always fails so logout covers the worst case.
    async fn spawn_idp() -> SocketAddr {
        let router = Router::new()
            .route(
                "/token",
                axum::routing::post(|Form(form): Form<HashMap<String, String>>| async move {
                    if form.get("code").map(String::as_str) == Some("good-code") {
                        Ok(Json(json!({
                            "access_token": "at-e2e",
                            "refresh_token": "rt-e2e",
                            "expires_in": 3600
                        })))
                    } else {
                        Err((StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#))
                    }
                }),
            )
            .route(
                "/introspect",
                axum::routing::post(|Form(form): Form<HashMap<String, String>>| async move {
                    let active = form.get("token").map(String::as_str) == Some("at-e2e");
                    Json(json!({"active": active, "preferred_username": "alice"}))
                }),
            )
            .route(
                "/revoke",
                axum::routing::post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        addr
    }

    async fn test_state() -> AppState {
        let addr = spawn_idp().await;
        let base = format!("http://{addr}");
        let mut settings = ProviderSettings::new(
            "test-client",
            "test-secret",
            format!("{base}/authorize"),
            format!("{base}/token"),
        );
        settings.introspect_url = Some(format!("{base}/introspect"));
        settings.revoke_url = Some(format!("{base}/revoke"));
        settings.expires_in_seconds = Some(3600);
        let provider = Provider::new(settings.build().expect("config")).expect("provider");
        AppState {
            provider,
            secure_cookies: false,
        }
    }

    fn app(state: AppState) -> Router {
        let protected = Router::new()
            .route(
                "/protected",
                get(|user: AuthUser| async move {
                    Json(json!({"username": user.username}))
                }),
            )
            .route_layer(from_fn_with_state(state.clone(), require_auth));
        router(state).merge(protected)
    }

    fn location(response: &Response) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .expect("location header")
            .to_str()
            .expect("utf8")
            .to_string()
    }

    fn set_cookie(response: &Response) -> String {
        response
            .headers()
            .get(header::SET_COOKIE)
            .expect("set-cookie header")
            .to_str()
            .expect("utf8")
            .to_string()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn browser_get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::ACCEPT, "text/html,application/xhtml+xml")
            .header(header::HOST, "app.example.com")
            .body(Body::empty())
            .expect("request")
    }

    /// Runs the login redirect and returns the sealed state parameter.
    async fn login_state(app: &Router, state: &AppState, redirect_uri: &str) -> String {
        let response = app
            .clone()
            .oneshot(browser_get(&format!(
                "/oauth2/login?redirect_uri={redirect_uri}"
            )))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

        let authorize = url::Url::parse(&location(&response)).expect("authorize url");
        let pairs: HashMap<String, String> = authorize.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(
            pairs.get("client_id").map(String::as_str),
            Some("test-client")
        );

        let sealed = pairs.get("state").expect("state param").clone();
        let decrypted: AuthorizeState = state
            .provider
            .codec()
            .decrypt(&sealed)
            .expect("state decrypts");
        assert_eq!(
            decrypted.redirect_uri.as_deref(),
            Some(&*urlencoding_decode(redirect_uri))
        );
        sealed
    }

    fn urlencoding_decode(raw: &str) -> String {
        url::form_urlencoded::parse(format!("v={raw}").as_bytes())
            .next()
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default()
    }

    /// Completes the code exchange and returns the session cookie pair.
    async fn establish_session(app: &Router, state: &AppState) -> String {
        let sealed = login_state(app, state, "%2Fapp%2Fhome").await;
        let response = app
            .clone()
            .oneshot(browser_get(&format!(
                "/oauth2?code=good-code&state={sealed}"
            )))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(location(&response), "/app/home");

        let cookie = set_cookie(&response);
        cookie.split(';').next().expect("cookie pair").to_string()
    }

    #[tokio::test]
    async fn unauthenticated_request_redirects_to_login() {
        let state = test_state().await;
        let app = app(state);

        let response = app
            .oneshot(browser_get("/protected"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            location(&response),
            "/oauth2/login?redirect_uri=%2Fprotected"
        );
    }

    #[tokio::test]
    async fn login_redirects_to_authorize_with_sealed_state() {
        let state = test_state().await;
        let app = app(state.clone());
        login_state(&app, &state, "%2Fapp%2Fhome").await;
    }

    #[tokio::test]
    async fn non_browser_login_gets_403() {
        let state = test_state().await;
        let app = app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/oauth2/login")
                    .header(header::ACCEPT, "application/json")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn callback_establishes_session_and_grants_access() {
        let state = test_state().await;
        let app = app(state.clone());
        let cookie = establish_session(&app, &state).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["username"], "alice");
    }

    #[tokio::test]
    async fn callback_with_bad_code_is_bad_gateway() {
        let state = test_state().await;
        let app = app(state.clone());
        let sealed = login_state(&app, &state, "%2Fapp").await;

        let response = app
            .oneshot(browser_get(&format!("/oauth2?code=bad-code&state={sealed}")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn callback_with_provider_error_redirects_to_login() {
        let state = test_state().await;
        let app = app(state);

        let response = app
            .oneshot(browser_get("/oauth2?error=access_denied"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(location(&response), "/oauth2/login");
    }

    #[tokio::test]
    async fn callback_without_state_is_404() {
        let state = test_state().await;
        let app = app(state);

        let response = app
            .oneshot(browser_get("/oauth2?code=good-code"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logout_ends_the_session_despite_failing_revocation() {
        let state = test_state().await;
        let app = app(state.clone());
        let cookie = establish_session(&app, &state).await;

        // The mock revoke endpoint always answers 503.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/oauth2/logout?redirect_uri=%2Fbye")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(location(&response), "/bye");
        // The session cookie is removed.
        let removal = set_cookie(&response);
        assert!(removal.contains("Max-Age=0"), "got {removal}");

        // A request without the cookie is back to square one.
        let response = app
            .oneshot(browser_get("/protected"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    }

    #[tokio::test]
    async fn bearer_tokens_pass_the_middleware() {
        let state = test_state().await;
        let app = app(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(header::AUTHORIZATION, "Bearer at-e2e")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        // An unknown bearer token presented credentials, so it gets a
        // plain denial rather than a login redirect.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(header::AUTHORIZATION, "Bearer at-bogus")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn validate_and_gated_introspect() {
        let state = test_state().await;
        let app = app(state);

        let response = app
            .clone()
            .oneshot(browser_get("/oauth2/validate?access_token=at-e2e"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["active"], true);

        let response = app
            .clone()
            .oneshot(browser_get("/oauth2/validate?access_token=at-bogus"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Introspect is disabled unless opted in.
        let response = app
            .oneshot(browser_get("/oauth2/introspect?access_token=at-e2e"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn token_endpoint_accepts_post_bodies() {
        // Enable the oidc_token surface for this state.
        let addr = spawn_idp().await;
        let base = format!("http://{addr}");
        let mut settings = ProviderSettings::new(
            "test-client",
            "test-secret",
            format!("{base}/authorize"),
            format!("{base}/token"),
        );
        settings.introspect_url = Some(format!("{base}/introspect"));
        settings.expires_in_seconds = Some(3600);
        settings.enable_oidc_token = true;
        let provider = Provider::new(settings.build().expect("config")).expect("provider");
        let sealed = provider
            .codec()
            .encrypt(&json!("anything"), None)
            .expect("seal");
        let app = app(AppState {
            provider,
            secure_cookies: false,
        });

        // The mock only refreshes for a known token, so this fails
        // upstream, but it proves body parameters reach the operation.
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/oauth2/token")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(format!("refresh_token={sealed}")))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn optional_auth_attaches_but_never_blocks() {
        use super::super::middleware::optional_auth;

        let state = test_state().await;
        let maybe = Router::new()
            .route(
                "/maybe",
                get(|user: Option<AuthUser>| async move {
                    Json(json!({"username": user.and_then(|u| u.username)}))
                }),
            )
            .route_layer(from_fn_with_state(state.clone(), optional_auth));
        let app = router(state).merge(maybe);

        // Anonymous requests pass through.
        let response = app
            .clone()
            .oneshot(browser_get("/maybe"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["username"], json!(null));

        // Bearer credentials attach the principal.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/maybe")
                    .header(header::AUTHORIZATION, "Bearer at-e2e")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["username"], "alice");
    }

    #[tokio::test]
    async fn discovery_document_is_served() {
        let state = test_state().await;
        let app = app(state);

        let response = app
            .oneshot(browser_get("/oauth2/.well-known/openid-configuration"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["token_endpoint"].is_string());
        assert!(body["issuer"].is_null());
    }
}
