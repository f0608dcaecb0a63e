//! The provider: configuration, service operations, and session plumbing.
//!
//! One [`Provider`] instance exists per configured identity provider and
//! owns everything with process lifetime: the validated config, the state
//! codec, the token exchange client, the bearer token cache, and the
//! optional server-side session store. The HTTP layer stays thin; every
//! operation here takes already-merged request parameters and returns
//! either a value or a redirect target, leaving status-code translation to
//! the host.

use crate::cache::BearerTokenCache;
use crate::client::{TokenExchangeClient, TokenInfo, TokenResponse};
use crate::codec::StateCodec;
use crate::config::{LoginAttempt, ProviderConfig};
use crate::error::{ConfigError, GatewayError, token_tail};
use crate::session::{Session, SessionParams, SessionSource};
use crate::store::SessionStore;
use aes_gcm::aead::rand_core::RngCore;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Request parameters with query merged over body.
///
/// Every service endpoint accepts GET with query parameters or POST with
/// a form or JSON body; the body is parsed first and query parameters
/// overwrite overlapping keys.
#[derive(Debug, Clone, Default)]
pub struct MergedParams {
    values: HashMap<String, String>,
}

impl MergedParams {
    #[must_use]
    pub fn from_query_and_body(
        query: Option<&str>,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Self {
        let mut values = HashMap::new();

        if !body.is_empty() {
            if content_type.is_some_and(|ct| ct.contains("application/json")) {
                if let Ok(serde_json::Value::Object(map)) =
                    serde_json::from_slice::<serde_json::Value>(body)
                {
                    for (key, value) in map {
                        match value {
                            serde_json::Value::String(s) => {
                                values.insert(key, s);
                            }
                            serde_json::Value::Number(_) | serde_json::Value::Bool(_) => {
                                values.insert(key, value.to_string());
                            }
                            _ => {}
                        }
                    }
                }
            } else {
                for (key, value) in url::form_urlencoded::parse(body) {
                    values.insert(key.into_owned(), value.into_owned());
                }
            }
        }

        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                values.insert(key.into_owned(), value.into_owned());
            }
        }

        Self { values }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn require(&self, name: &'static str) -> Result<&str, GatewayError> {
        self.get(name)
            .ok_or(GatewayError::MissingParameter { name })
    }

    /// Treats `1`, `true`, and `yes` as set.
    fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some("1" | "true" | "yes"))
    }
}

/// What the callback should produce once the code exchange succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginResult {
    /// Establish a cookie session and redirect back.
    #[default]
    Session,
    /// Return an encrypted token bundle as JSON.
    Token,
    /// Redirect back with the encrypted bundle in a query parameter.
    TokenLink,
}

impl LoginResult {
    fn parse(raw: &str) -> Result<Self, GatewayError> {
        match raw {
            "session" => Ok(Self::Session),
            "token" => Ok(Self::Token),
            "token_link" => Ok(Self::TokenLink),
            _ => Err(GatewayError::InvalidParameter {
                name: "login_result",
            }),
        }
    }
}

/// The CSRF state sealed into the `state` parameter and round-tripped
/// through the identity provider. Tamper-evidence and expiry come from
/// the codec envelope; this only needs to carry the per-attempt data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeState {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub login_result: LoginResult,
    /// The caller's own opaque state, returned on the final redirect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_state: Option<String>,
}

/// Outcome of a successful authorize-response callback.
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    /// The session was authenticated; redirect the browser back.
    SessionEstablished { location: String },
    /// An encrypted token bundle, returned as a JSON body.
    TokenBundle { body: serde_json::Value },
    /// Redirect carrying the encrypted bundle in a `token` parameter.
    TokenLink { location: String },
}

/// Instruction for the host about the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieUpdate {
    Set(String),
    Remove,
}

/// One configured identity provider and all its process-wide state.
#[derive(Clone)]
pub struct Provider {
    config: ProviderConfig,
    codec: StateCodec,
    client: TokenExchangeClient,
    cache: BearerTokenCache,
    store: Option<Arc<dyn SessionStore>>,
}

impl Provider {
    /// Builds a provider from validated configuration.
    pub fn new(config: ProviderConfig) -> Result<Self, ConfigError> {
        let codec = StateCodec::new(config.encryption_key());
        let client = TokenExchangeClient::new(&config)?;
        let cache = BearerTokenCache::new(config.cache().clone());
        Ok(Self {
            config,
            codec,
            client,
            cache,
            store: None,
        })
    }

    /// Switches cookie persistence to a server-side store: the cookie
    /// then carries only a random session id.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    #[must_use]
    pub fn codec(&self) -> &StateCodec {
        &self.codec
    }

    #[must_use]
    pub fn client(&self) -> &TokenExchangeClient {
        &self.client
    }

    #[must_use]
    pub fn cache(&self) -> &BearerTokenCache {
        &self.cache
    }

    /// The callback URL the provider should send the browser back to:
    /// the configured one when set, otherwise the one derived from the
    /// incoming request.
    fn effective_redirect_uri<'a>(&'a self, derived: &'a str) -> &'a str {
        self.config.redirect_url().unwrap_or(derived)
    }

    /// Starts a login attempt: seals an [`AuthorizeState`] and returns
    /// the identity provider authorize URL to redirect to.
    ///
    /// # Errors
    ///
    /// `LoginNotAllowed` when the login-allow predicate rejects the
    /// request, `ServiceDisabled` for token-style results without
    /// `enable_oidc_token`.
    pub fn begin_login(
        &self,
        params: &MergedParams,
        attempt: &LoginAttempt<'_>,
        callback_url: &str,
    ) -> Result<String, GatewayError> {
        if !self.config.login_allowed(attempt) {
            return Err(GatewayError::LoginNotAllowed {
                reason: "request type not allowed to start a login".to_string(),
            });
        }

        let login_result = match params.get("login_result") {
            Some(raw) => LoginResult::parse(raw)?,
            None => LoginResult::Session,
        };
        if login_result != LoginResult::Session && !self.config.enable_oidc_token() {
            return Err(GatewayError::ServiceDisabled {
                service: "oidc_token",
            });
        }

        let state = AuthorizeState {
            created: Utc::now(),
            redirect_uri: params.get("redirect_uri").map(str::to_string),
            login_result,
            client_state: params.get("state").map(str::to_string),
        };
        let sealed = self.codec.encrypt(&state, Some(self.config.state_ttl()))?;

        let mut authorize = self.config.authorize_url().clone();
        authorize
            .query_pairs_mut()
            .append_pair("client_id", self.config.client_id())
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", self.effective_redirect_uri(callback_url))
            .append_pair("state", &sealed);
        let scope = self.config.scope_param();
        if !scope.is_empty() {
            authorize.query_pairs_mut().append_pair("scope", &scope);
        }

        Ok(authorize.into())
    }

    /// Completes the authorization-code dance when the provider redirects
    /// back.
    ///
    /// Validates the sealed state, exchanges the code, and either
    /// authenticates `session` or produces a token bundle, depending on
    /// the `login_result` sealed at login time.
    pub async fn handle_authorize_response(
        &self,
        params: &MergedParams,
        session: &mut Session,
        callback_url: &str,
    ) -> Result<CallbackOutcome, GatewayError> {
        if let Some(error) = params.get("error") {
            return Err(GatewayError::NotAuthorizedReload {
                reason: format!("identity provider returned error={error}"),
            });
        }

        let sealed = params.require("state")?;
        let state: AuthorizeState = self.codec.decrypt(sealed)?;

        if state.login_result != LoginResult::Session && !self.config.enable_oidc_token() {
            return Err(GatewayError::ServiceDisabled {
                service: "oidc_token",
            });
        }

        let code = params.require("code")?;
        let token = self
            .client
            .get_token_from_code(code, self.effective_redirect_uri(callback_url))
            .await?;

        match state.login_result {
            LoginResult::Session => {
                session.authenticate(&token);
                let target = state.redirect_uri.as_deref().unwrap_or("/");
                Ok(CallbackOutcome::SessionEstablished {
                    location: append_query(target, &[], state.client_state.as_deref()),
                })
            }
            LoginResult::Token => Ok(CallbackOutcome::TokenBundle {
                body: self.seal_token_bundle(&token)?,
            }),
            LoginResult::TokenLink => {
                let target = state.redirect_uri.as_deref().ok_or(
                    GatewayError::MissingParameter {
                        name: "redirect_uri",
                    },
                )?;
                let bundle = self.seal_token_bundle(&token)?;
                let sealed_token = bundle["token"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                Ok(CallbackOutcome::TokenLink {
                    location: append_query(
                        target,
                        &[("token", &sealed_token)],
                        state.client_state.as_deref(),
                    ),
                })
            }
        }
    }

    /// Seals a freshly minted token set into an opaque bundle whose
    /// lifetime tracks the token's own `expires_in`.
    fn seal_token_bundle(&self, token: &TokenResponse) -> Result<serde_json::Value, GatewayError> {
        let ttl = token
            .expires_in
            .map(Duration::seconds)
            .or(self.config.expires_in());
        let sealed = self.codec.encrypt(
            &json!({
                "access_token": token.access_token,
                "refresh_token": token.refresh_token,
                "id_token": token.id_token,
                "token_type": token.token_type,
                "scope": token.scope,
                "expires_in": token.expires_in,
            }),
            ttl,
        )?;
        Ok(json!({
            "token": sealed,
            "token_type": token.token_type,
            "expires_in": token.expires_in,
        }))
    }

    /// Clears the session, best-effort revoking its tokens first.
    ///
    /// Returns the redirect target. Revocation failures never block the
    /// clearing; a session the user asked to end always ends.
    pub async fn logout(&self, params: &MergedParams, session: &mut Session) -> String {
        if !params.flag("no_revoke") {
            let tokens = [
                (session.params().access_token.clone(), "access_token"),
                (session.params().refresh_token.clone(), "refresh_token"),
            ];
            for (token, hint) in tokens {
                let Some(token) = token else { continue };
                if let Err(err) = self.client.revoke(&token, Some(hint)).await {
                    tracing::warn!(
                        error = %err,
                        token_tail = token_tail(&token),
                        hint,
                        "token revocation failed during logout"
                    );
                }
            }
        }

        if session.source() == SessionSource::Bearer
            && let Some(token) = session.access_token()
        {
            self.cache.remove(token);
        }
        session.clear();

        params.get("redirect_uri").unwrap_or("/").to_string()
    }

    /// Decrypts an opaque value previously issued by this provider.
    pub fn decrypt_value(&self, params: &MergedParams) -> Result<serde_json::Value, GatewayError> {
        let sealed = params.require("value")?;
        Ok(self.codec.decrypt_value(sealed)?)
    }

    /// Mints a fresh token bundle from a sealed refresh token.
    ///
    /// Used when this gateway fronts a public client: the client holds
    /// only sealed material and this endpoint performs the confidential
    /// refresh grant for it.
    pub async fn mint_from_refresh(
        &self,
        params: &MergedParams,
    ) -> Result<serde_json::Value, GatewayError> {
        if !self.config.enable_oidc_token() {
            return Err(GatewayError::ServiceDisabled {
                service: "oidc_token",
            });
        }

        let sealed = params.require("refresh_token")?;
        let value = self.codec.decrypt_value(sealed)?;
        let refresh_token = match &value {
            serde_json::Value::String(s) => s.as_str(),
            serde_json::Value::Object(map) => map
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .ok_or(GatewayError::InvalidParameter {
                    name: "refresh_token",
                })?,
            _ => {
                return Err(GatewayError::InvalidParameter {
                    name: "refresh_token",
                });
            }
        };

        let token = self.client.get_token_from_refresh_token(refresh_token).await?;
        self.seal_token_bundle(&token)
    }

    /// Checks a raw access token against the provider.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` when introspection reports the token inactive.
    pub async fn validate_token(&self, params: &MergedParams) -> Result<TokenInfo, GatewayError> {
        let token = params.require("access_token")?;
        let info = self.client.introspect(token, Some("access_token")).await?;
        if !info.active {
            return Err(GatewayError::NotAuthorized {
                reason: "token is not active".to_string(),
            });
        }
        Ok(info)
    }

    /// Raw introspection passthrough, gated behind `enable_introspect`.
    pub async fn introspect_token(
        &self,
        params: &MergedParams,
    ) -> Result<TokenInfo, GatewayError> {
        if !self.config.enable_introspect() {
            return Err(GatewayError::ServiceDisabled {
                service: "introspect",
            });
        }
        let token = params.require("access_token")?;
        self.client.introspect(token, Some("access_token")).await
    }

    /// The `.well-known/openid-configuration` document: the fields this
    /// gateway understands, everything else explicitly null.
    #[must_use]
    pub fn discovery_document(&self) -> serde_json::Value {
        json!({
            "token_endpoint": self.config.token_url().as_str(),
            "scopes_supported": self.config.scopes(),
            "issuer": null,
            "authorization_endpoint": null,
            "userinfo_endpoint": null,
            "jwks_uri": null,
            "registration_endpoint": null,
            "response_types_supported": null,
            "subject_types_supported": null,
            "id_token_signing_alg_values_supported": null,
        })
    }

    /// Restores a session from the session cookie value, if any.
    ///
    /// A blob that fails to decrypt (tampered, expired, or sealed under a
    /// rotated key) yields an empty session rather than an error; the
    /// user just logs in again.
    pub async fn load_cookie_session(&self, cookie: Option<&str>) -> Session {
        let Some(cookie) = cookie else {
            return Session::new(SessionSource::Cookie);
        };

        if let Some(store) = &self.store {
            return match store.load(cookie).await {
                Some(params) => Session::from_params(params, SessionSource::Cookie),
                None => Session::new(SessionSource::Cookie),
            };
        }

        match self.codec.decrypt::<SessionParams>(cookie) {
            Ok(params) => Session::from_params(params, SessionSource::Cookie),
            Err(err) => {
                tracing::debug!(error = %err, "session cookie rejected, starting empty");
                Session::new(SessionSource::Cookie)
            }
        }
    }

    /// Persists a cookie session's changes, if any.
    ///
    /// Returns the cookie change the host must apply: `Set` with the new
    /// value, `Remove` when the session was cleared, `None` when nothing
    /// changed.
    pub async fn store_cookie_session(
        &self,
        session: &mut Session,
        existing_cookie: Option<&str>,
    ) -> Result<Option<CookieUpdate>, GatewayError> {
        if !session.take_dirty() {
            return Ok(None);
        }

        if !session.is_authenticated() {
            if let (Some(store), Some(id)) = (&self.store, existing_cookie) {
                store.clear(id).await;
            }
            return Ok(Some(CookieUpdate::Remove));
        }

        if let Some(store) = &self.store {
            let id = match existing_cookie {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => random_session_id(),
            };
            store.save(&id, session.params().clone()).await;
            return Ok(Some(CookieUpdate::Set(id)));
        }

        let blob = self
            .codec
            .encrypt(session.params(), self.config.expires_in())?;
        Ok(Some(CookieUpdate::Set(blob)))
    }

    /// Builds a session for a bearer token, consulting the cache.
    #[must_use]
    pub fn load_bearer_session(&self, token: &str) -> Session {
        match self.cache.get(token) {
            Some(params) => Session::from_params(params, SessionSource::Bearer),
            None => Session::from_params(
                SessionParams::from_bearer_token(token),
                SessionSource::Bearer,
            ),
        }
    }

    /// Writes a bearer session's changes back to the cache.
    pub fn store_bearer_session(&self, session: &mut Session) {
        if !session.take_dirty() {
            return;
        }
        if let Some(token) = session.access_token() {
            self.cache.set(token, session.params().clone());
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "<store>"))
            .finish_non_exhaustive()
    }
}

/// Appends query parameters to a possibly-relative redirect target.
fn append_query(target: &str, pairs: &[(&str, &str)], client_state: Option<&str>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    if let Some(state) = client_state {
        serializer.append_pair("state", state);
    }
    let query = serializer.finish();
    if query.is_empty() {
        return target.to_string();
    }
    let separator = if target.contains('?') { '&' } else { '?' };
    format!("{target}{separator}{query}")
}

fn random_session_id() -> String {
    let mut bytes = [0u8; 16];
    aes_gcm::aead::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
