//! Provider configuration.
//!
//! Configuration is supplied as a plain data struct ([`ProviderSettings`],
//! deserializable from the environment) and validated exactly once into a
//! [`ProviderConfig`]. Validation failures are fatal: a provider with a
//! missing credential or no way to ever invalidate a session must not
//! start.

use crate::cache::CacheConfig;
use crate::error::ConfigError;
use chrono::Duration;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use url::Url;

fn default_scopes() -> String {
    "openid".to_string()
}

fn default_recheck_interval_seconds() -> i64 {
    600
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_basepath() -> String {
    "/oauth2".to_string()
}

fn default_session_cookie() -> String {
    "gatehouse:oauth2:token".to_string()
}

fn default_state_ttl_seconds() -> i64 {
    600
}

/// Raw provider settings, typically loaded from the environment.
///
/// Fields with defaults can be omitted; [`ProviderSettings::build`] turns
/// the settings into a validated [`ProviderConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    /// OAuth2 client id registered with the identity provider.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// Optional service root; relative endpoint URLs resolve against it.
    #[serde(default)]
    pub service_url: Option<String>,
    /// Authorization endpoint (absolute, or relative to `service_url`).
    pub authorize_url: String,
    /// Token endpoint (absolute, or relative to `service_url`).
    pub token_url: String,
    /// Introspection endpoint. Omitting it is a configuration choice, but
    /// then `expires_in_seconds` must be set.
    #[serde(default)]
    pub introspect_url: Option<String>,
    /// Revocation endpoint. Revocation is skipped when omitted.
    #[serde(default)]
    pub revoke_url: Option<String>,
    /// Callback URL registered with the provider. When omitted the host
    /// derives it from the incoming request.
    #[serde(default)]
    pub redirect_url: Option<String>,
    /// Scopes to request, comma-separated.
    #[serde(default = "default_scopes")]
    pub scopes: String,
    /// How long an introspection result stays fresh before a session is
    /// revalidated.
    #[serde(default = "default_recheck_interval_seconds")]
    pub recheck_interval_seconds: i64,
    /// Hard session lifetime bound. Required when no introspection URL is
    /// configured.
    #[serde(default)]
    pub expires_in_seconds: Option<i64>,
    /// Timeout applied to every upstream call.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Optional HTTP proxy for upstream calls.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Path prefix the gateway's service endpoints are bound under.
    #[serde(default = "default_basepath")]
    pub basepath: String,
    /// Name of the session cookie.
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    /// Key for the state codec; defaults to the client secret.
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Lifetime of the encrypted CSRF state blob.
    #[serde(default = "default_state_ttl_seconds")]
    pub state_ttl_seconds: i64,
    /// Allow the `token`/`token_link` login results and the `token`
    /// endpoint. Off by default: these expose material derived from the
    /// client secret.
    #[serde(default)]
    pub enable_oidc_token: bool,
    /// Allow the raw `introspect` endpoint.
    #[serde(default)]
    pub enable_introspect: bool,
    /// Bearer token cache tuning.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl ProviderSettings {
    /// Creates settings with defaults for every optional field.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            service_url: None,
            authorize_url: authorize_url.into(),
            token_url: token_url.into(),
            introspect_url: None,
            revoke_url: None,
            redirect_url: None,
            scopes: default_scopes(),
            recheck_interval_seconds: default_recheck_interval_seconds(),
            expires_in_seconds: None,
            request_timeout_seconds: default_request_timeout_seconds(),
            proxy: None,
            basepath: default_basepath(),
            session_cookie: default_session_cookie(),
            encryption_key: None,
            state_ttl_seconds: default_state_ttl_seconds(),
            enable_oidc_token: false,
            enable_introspect: false,
            cache: CacheConfig::default(),
        }
    }

    /// Validates the settings into a usable configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a credential is missing, a URL does not
    /// parse or resolve, or no expiry bound exists while introspection is
    /// unconfigured.
    pub fn build(self) -> Result<ProviderConfig, ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if self.client_secret.trim().is_empty() {
            return Err(ConfigError::MissingClientSecret);
        }
        if self.introspect_url.is_none() && self.expires_in_seconds.is_none() {
            return Err(ConfigError::MissingExpiryBound);
        }

        let service_url = match &self.service_url {
            Some(raw) => Some(Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
                field: "service_url",
                reason: e.to_string(),
            })?),
            None => None,
        };

        let resolve = |field: &'static str, raw: &str| -> Result<Url, ConfigError> {
            match Url::parse(raw) {
                Ok(url) => Ok(url),
                Err(url::ParseError::RelativeUrlWithoutBase) => match &service_url {
                    Some(base) => base.join(raw).map_err(|e| ConfigError::InvalidUrl {
                        field,
                        reason: e.to_string(),
                    }),
                    None => Err(ConfigError::InvalidUrl {
                        field,
                        reason: "relative URL requires service_url".to_string(),
                    }),
                },
                Err(e) => Err(ConfigError::InvalidUrl {
                    field,
                    reason: e.to_string(),
                }),
            }
        };

        let authorize_url = resolve("authorize_url", &self.authorize_url)?;
        let token_url = resolve("token_url", &self.token_url)?;
        let introspect_url = self
            .introspect_url
            .as_deref()
            .map(|raw| resolve("introspect_url", raw))
            .transpose()?;
        let revoke_url = self
            .revoke_url
            .as_deref()
            .map(|raw| resolve("revoke_url", raw))
            .transpose()?;

        let scopes: Vec<String> = self
            .scopes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let encryption_key = self
            .encryption_key
            .clone()
            .unwrap_or_else(|| self.client_secret.clone());

        Ok(ProviderConfig {
            client_id: self.client_id,
            client_secret: self.client_secret,
            authorize_url,
            token_url,
            introspect_url,
            revoke_url,
            redirect_url: self.redirect_url,
            scopes,
            recheck_interval: Duration::seconds(self.recheck_interval_seconds),
            expires_in: self.expires_in_seconds.map(Duration::seconds),
            request_timeout: std::time::Duration::from_secs(self.request_timeout_seconds),
            proxy: self.proxy,
            basepath: normalize_basepath(&self.basepath),
            session_cookie: self.session_cookie,
            encryption_key,
            state_ttl: Duration::seconds(self.state_ttl_seconds),
            enable_oidc_token: self.enable_oidc_token,
            enable_introspect: self.enable_introspect,
            cache: self.cache,
            login_allowed: Arc::new(browser_login_allowed),
        })
    }
}

/// Strips a trailing slash and guarantees a leading one.
fn normalize_basepath(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/oauth2".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// What the login-allow predicate gets to see about a login request.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoginAttempt<'a> {
    /// The request's `Accept` header, if any.
    pub accept: Option<&'a str>,
    /// The request's `User-Agent` header, if any.
    pub user_agent: Option<&'a str>,
}

/// Default login-allow predicate: only browser-style requests (those that
/// accept HTML) may start an interactive login.
fn browser_login_allowed(attempt: &LoginAttempt<'_>) -> bool {
    attempt
        .accept
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

type LoginPredicate = Arc<dyn for<'a> Fn(&LoginAttempt<'a>) -> bool + Send + Sync>;

/// Validated, immutable provider configuration.
///
/// Constructed once via [`ProviderSettings::build`]; never re-validated per
/// request.
#[derive(Clone)]
pub struct ProviderConfig {
    client_id: String,
    client_secret: String,
    authorize_url: Url,
    token_url: Url,
    introspect_url: Option<Url>,
    revoke_url: Option<Url>,
    redirect_url: Option<String>,
    scopes: Vec<String>,
    recheck_interval: Duration,
    expires_in: Option<Duration>,
    request_timeout: std::time::Duration,
    proxy: Option<String>,
    basepath: String,
    session_cookie: String,
    encryption_key: String,
    state_ttl: Duration,
    enable_oidc_token: bool,
    enable_introspect: bool,
    cache: CacheConfig,
    login_allowed: LoginPredicate,
}

impl ProviderConfig {
    /// Returns the OAuth2 client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the OAuth2 client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Returns the authorization endpoint.
    #[must_use]
    pub fn authorize_url(&self) -> &Url {
        &self.authorize_url
    }

    /// Returns the token endpoint.
    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// Returns the introspection endpoint, if configured.
    #[must_use]
    pub fn introspect_url(&self) -> Option<&Url> {
        self.introspect_url.as_ref()
    }

    /// Returns the revocation endpoint, if configured.
    #[must_use]
    pub fn revoke_url(&self) -> Option<&Url> {
        self.revoke_url.as_ref()
    }

    /// Returns the configured callback URL, if any.
    #[must_use]
    pub fn redirect_url(&self) -> Option<&str> {
        self.redirect_url.as_deref()
    }

    /// Returns the requested scopes.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Returns the scopes joined for the `scope` request parameter.
    #[must_use]
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }

    /// Returns the revalidation interval.
    #[must_use]
    pub fn recheck_interval(&self) -> Duration {
        self.recheck_interval
    }

    /// Returns the hard session lifetime bound, if configured.
    #[must_use]
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_in
    }

    /// Returns the upstream request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> std::time::Duration {
        self.request_timeout
    }

    /// Returns the upstream HTTP proxy, if configured.
    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Returns the basepath the service endpoints live under.
    #[must_use]
    pub fn basepath(&self) -> &str {
        &self.basepath
    }

    /// Returns the session cookie name.
    #[must_use]
    pub fn session_cookie(&self) -> &str {
        &self.session_cookie
    }

    /// Returns the state codec key.
    #[must_use]
    pub fn encryption_key(&self) -> &str {
        &self.encryption_key
    }

    /// Returns the CSRF state lifetime.
    #[must_use]
    pub fn state_ttl(&self) -> Duration {
        self.state_ttl
    }

    /// Returns true if token-style login results are enabled.
    #[must_use]
    pub fn enable_oidc_token(&self) -> bool {
        self.enable_oidc_token
    }

    /// Returns true if the raw introspection endpoint is enabled.
    #[must_use]
    pub fn enable_introspect(&self) -> bool {
        self.enable_introspect
    }

    /// Returns the bearer token cache configuration.
    #[must_use]
    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    /// Runs the login-allow predicate for a request.
    #[must_use]
    pub fn login_allowed(&self, attempt: &LoginAttempt<'_>) -> bool {
        (self.login_allowed)(attempt)
    }

    /// Replaces the login-allow predicate.
    pub fn set_login_allowed<F>(&mut self, predicate: F)
    where
        F: for<'a> Fn(&LoginAttempt<'a>) -> bool + Send + Sync + 'static,
    {
        self.login_allowed = Arc::new(predicate);
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authorize_url", &self.authorize_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("introspect_url", &self.introspect_url.as_ref().map(Url::as_str))
            .field("revoke_url", &self.revoke_url.as_ref().map(Url::as_str))
            .field("redirect_url", &self.redirect_url)
            .field("scopes", &self.scopes)
            .field("recheck_interval", &self.recheck_interval)
            .field("expires_in", &self.expires_in)
            .field("request_timeout", &self.request_timeout)
            .field("basepath", &self.basepath)
            .field("session_cookie", &self.session_cookie)
            .field("enable_oidc_token", &self.enable_oidc_token)
            .field("enable_introspect", &self.enable_introspect)
            .finish_non_exhaustive()
    }
}
