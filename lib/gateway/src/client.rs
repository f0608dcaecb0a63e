//! HTTP client for the identity provider's token endpoints.
//!
//! Stateless wrapper over [`reqwest`] that composes the form-encoded
//! requests for the token, introspection, and revocation endpoints and
//! parses the JSON answers. Session policy lives elsewhere; this module
//! only speaks the wire protocol.

use crate::config::ProviderConfig;
use crate::error::{ConfigError, GatewayError, token_tail};
use serde::Deserialize;
use url::Url;

/// Upstream error bodies are kept for diagnostics but capped so a
/// misbehaving provider cannot balloon our logs.
const MAX_ERROR_BODY: usize = 2048;

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// A successful answer from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// An introspection result (RFC 7662).
///
/// Only `active` is interpreted; every other claim is carried verbatim so
/// downstream consumers can read provider-specific fields.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct TokenInfo {
    #[serde(default)]
    pub active: bool,
    #[serde(flatten)]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl TokenInfo {
    /// A synthesized result for providers without an introspection
    /// endpoint. Only valid alongside a hard session expiry bound.
    #[must_use]
    pub fn assumed_active() -> Self {
        Self {
            active: true,
            claims: serde_json::Map::new(),
        }
    }

    /// A raw claim by name.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&serde_json::Value> {
        self.claims.get(name)
    }

    /// Best-effort principal name from the standard claim fallback chain.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        ["preferred_username", "username", "email", "sub"]
            .iter()
            .find_map(|key| self.claims.get(*key).and_then(|v| v.as_str()))
    }
}

/// Stateless client for the provider's token, introspection, and
/// revocation endpoints.
#[derive(Debug, Clone)]
pub struct TokenExchangeClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: Url,
    introspect_url: Option<Url>,
    revoke_url: Option<Url>,
}

impl TokenExchangeClient {
    /// Builds a client from validated provider configuration.
    ///
    /// The underlying HTTP client applies the configured timeout to every
    /// call, never follows redirects, and routes through the configured
    /// proxy when one is set.
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .redirect(reqwest::redirect::Policy::none());

        if let Some(proxy) = config.proxy() {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| {
                ConfigError::HttpClient {
                    reason: format!("invalid proxy: {e}"),
                }
            })?);
        }

        let http = builder.build().map_err(|e| ConfigError::HttpClient {
            reason: e.to_string(),
        })?;

        Ok(Self {
            http,
            client_id: config.client_id().to_string(),
            client_secret: config.client_secret().to_string(),
            token_url: config.token_url().clone(),
            introspect_url: config.introspect_url().cloned(),
            revoke_url: config.revoke_url().cloned(),
        })
    }

    /// POSTs a grant request to the token endpoint.
    ///
    /// # Errors
    ///
    /// `Upstream` on a non-2xx answer, `Timeout` past the configured
    /// deadline, `Transport` for connection and decoding failures.
    pub async fn get_token(
        &self,
        grant_type: &str,
        extra: &[(&str, &str)],
    ) -> Result<TokenResponse, GatewayError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("grant_type", grant_type),
        ];
        form.extend_from_slice(extra);

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| request_error(e, "token"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status.as_u16(), response).await);
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| GatewayError::Transport {
                reason: format!("invalid token response: {e}"),
            })
    }

    /// Exchanges an authorization code for tokens.
    pub async fn get_token_from_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, GatewayError> {
        self.get_token(
            "authorization_code",
            &[("code", code), ("redirect_uri", redirect_uri)],
        )
        .await
    }

    /// Exchanges a refresh token for a new token set.
    pub async fn get_token_from_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, GatewayError> {
        self.get_token("refresh_token", &[("refresh_token", refresh_token)])
            .await
    }

    /// Asks the provider whether a token is still active.
    ///
    /// Without a configured introspection URL the token is assumed active;
    /// configuration validation guarantees a hard expiry bound exists in
    /// that case.
    pub async fn introspect(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
    ) -> Result<TokenInfo, GatewayError> {
        let Some(url) = &self.introspect_url else {
            return Ok(TokenInfo::assumed_active());
        };

        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("token", token),
        ];
        if let Some(hint) = token_type_hint {
            form.push(("token_type_hint", hint));
        }

        let response = self
            .http
            .post(url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| request_error(e, "introspect"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status.as_u16(), response).await);
        }

        response
            .json::<TokenInfo>()
            .await
            .map_err(|e| GatewayError::Transport {
                reason: format!("invalid introspection response: {e}"),
            })
    }

    /// Revokes a token.
    ///
    /// Callers clearing a session must treat failures here as advisory;
    /// see [`crate::provider::Provider::logout`].
    pub async fn revoke(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
    ) -> Result<(), GatewayError> {
        let Some(url) = &self.revoke_url else {
            tracing::debug!(
                token_tail = token_tail(token),
                "no revocation endpoint configured, skipping revoke"
            );
            return Ok(());
        };

        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("token", token),
        ];
        if let Some(hint) = token_type_hint {
            form.push(("token_type_hint", hint));
        }

        let response = self
            .http
            .post(url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| request_error(e, "revoke"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status.as_u16(), response).await);
        }

        Ok(())
    }
}

fn request_error(err: reqwest::Error, operation: &'static str) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout { operation }
    } else {
        GatewayError::Transport {
            reason: err.to_string(),
        }
    }
}

async fn upstream_error(status: u16, response: reqwest::Response) -> GatewayError {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    GatewayError::Upstream { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;
    use axum::extract::Form;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    async fn spawn(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        addr
    }

    fn client_for(addr: SocketAddr, timeout_secs: u64) -> TokenExchangeClient {
        let base = format!("http://{addr}");
        let mut settings = ProviderSettings::new(
            "test-client",
            "test-secret",
            format!("{base}/authorize"),
            format!("{base}/token"),
        );
        settings.introspect_url = Some(format!("{base}/introspect"));
        settings.revoke_url = Some(format!("{base}/revoke"));
        settings.request_timeout_seconds = timeout_secs;
        let config = settings.build().expect("config");
        TokenExchangeClient::new(&config).expect("client")
    }

    #[tokio::test]
    async fn code_exchange_posts_credentials_and_grant() {
        let router = Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("client_id").map(String::as_str), Some("test-client"));
                assert_eq!(
                    form.get("client_secret").map(String::as_str),
                    Some("test-secret")
                );
                assert_eq!(
                    form.get("grant_type").map(String::as_str),
                    Some("authorization_code")
                );
                assert_eq!(form.get("code").map(String::as_str), Some("abc"));
                assert_eq!(
                    form.get("redirect_uri").map(String::as_str),
                    Some("https://app.example.com/cb")
                );
                Json(json!({
                    "access_token": "at-1",
                    "refresh_token": "rt-1",
                    "expires_in": 3600,
                    "scope": "openid"
                }))
            }),
        );
        let addr = spawn(router).await;

        let token = client_for(addr, 5)
            .get_token_from_code("abc", "https://app.example.com/cb")
            .await
            .expect("exchange");

        assert_eq!(token.access_token, "at-1");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
        // token_type defaults when the provider omits it
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.expires_in, Some(3600));
    }

    #[tokio::test]
    async fn non_2xx_surfaces_status_and_body() {
        let router = Router::new().route(
            "/token",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    r#"{"error":"invalid_grant"}"#,
                )
            }),
        );
        let addr = spawn(router).await;

        let err = client_for(addr, 5)
            .get_token_from_refresh_token("stale")
            .await
            .expect_err("should fail");

        match err {
            GatewayError::Upstream { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("expected Upstream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let router = Router::new().route(
            "/token",
            post(|| async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                "too late"
            }),
        );
        let addr = spawn(router).await;

        let err = client_for(addr, 1)
            .get_token("client_credentials", &[])
            .await
            .expect_err("should time out");

        assert_eq!(err, GatewayError::Timeout { operation: "token" });
    }

    #[tokio::test]
    async fn introspection_parses_activity_and_claims() {
        let router = Router::new().route(
            "/introspect",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("token").map(String::as_str), Some("at-1"));
                assert_eq!(
                    form.get("token_type_hint").map(String::as_str),
                    Some("access_token")
                );
                Json(json!({
                    "active": true,
                    "preferred_username": "alice",
                    "sub": "user-1"
                }))
            }),
        );
        let addr = spawn(router).await;

        let info = client_for(addr, 5)
            .introspect("at-1", Some("access_token"))
            .await
            .expect("introspect");

        assert!(info.active);
        assert_eq!(info.username(), Some("alice"));
    }

    #[tokio::test]
    async fn inactive_tokens_report_inactive() {
        let router = Router::new().route(
            "/introspect",
            post(|| async { Json(json!({"active": false})) }),
        );
        let addr = spawn(router).await;

        let info = client_for(addr, 5)
            .introspect("gone", None)
            .await
            .expect("introspect");
        assert!(!info.active);
        assert_eq!(info.username(), None);
    }

    #[tokio::test]
    async fn missing_introspection_url_assumes_active() {
        let mut settings = ProviderSettings::new(
            "id",
            "secret",
            "https://idp.example.com/authorize",
            "https://idp.example.com/token",
        );
        settings.expires_in_seconds = Some(3600);
        let config = settings.build().expect("config");
        let client = TokenExchangeClient::new(&config).expect("client");

        let info = client.introspect("anything", None).await.expect("introspect");
        assert!(info.active);
        assert!(info.claims.is_empty());
    }

    #[tokio::test]
    async fn revoke_without_endpoint_is_a_no_op() {
        let mut settings = ProviderSettings::new(
            "id",
            "secret",
            "https://idp.example.com/authorize",
            "https://idp.example.com/token",
        );
        settings.expires_in_seconds = Some(3600);
        let config = settings.build().expect("config");
        let client = TokenExchangeClient::new(&config).expect("client");

        client.revoke("at-1", None).await.expect("revoke");
    }

    #[tokio::test]
    async fn revoke_posts_token_and_reports_failures() {
        let router = Router::new().route(
            "/revoke",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                if form.get("token").map(String::as_str) == Some("known") {
                    axum::http::StatusCode::OK
                } else {
                    axum::http::StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        );
        let addr = spawn(router).await;
        let client = client_for(addr, 5);

        client.revoke("known", None).await.expect("revoke ok");
        let err = client
            .revoke("unknown", Some("refresh_token"))
            .await
            .expect_err("revoke should fail");
        assert!(matches!(err, GatewayError::Upstream { status: 503, .. }));
    }

    #[test]
    fn username_fallback_chain() {
        let info: TokenInfo = serde_json::from_value(json!({
            "active": true,
            "email": "a@example.com",
            "sub": "user-1"
        }))
        .expect("parse");
        assert_eq!(info.username(), Some("a@example.com"));

        let info: TokenInfo = serde_json::from_value(json!({
            "active": true,
            "sub": "user-1"
        }))
        .expect("parse");
        assert_eq!(info.username(), Some("user-1"));
    }
}
