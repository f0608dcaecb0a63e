//! Session lifecycle and the access decision.
//!
//! A [`Session`] exists for exactly one request. Its authentication state
//! lives in [`SessionParams`], the unit that gets persisted to the cookie
//! blob or the bearer cache between requests. Every derived predicate
//! (`is_authenticated`, `is_active`, `is_elapsed`, `needs_revalidation`)
//! is a pure function over the params and the current wall clock, computed
//! fresh on each call; nothing derived is ever stored.

use crate::client::{TokenExchangeClient, TokenInfo, TokenResponse};
use crate::config::ProviderConfig;
use crate::error::{GatewayError, token_tail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The persisted authentication state of one principal.
///
/// Mutated only through [`Session::authenticate`] and the introspection
/// merge inside [`Session::update`].
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_info: Option<TokenInfo>,
    /// When the current access token was obtained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<DateTime<Utc>>,
    /// When the session last saw a fresh introspection result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl SessionParams {
    /// Skeleton params for a bearer token seen for the first time.
    #[must_use]
    pub fn from_bearer_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            token_type: Some("Bearer".to_string()),
            authenticated: Some(Utc::now()),
            ..Self::default()
        }
    }
}

impl fmt::Debug for SessionParams {
    // Tokens never appear whole in debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field(
                "access_token",
                &self.access_token.as_deref().map(token_tail),
            )
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(token_tail),
            )
            .field("id_token", &self.id_token.as_deref().map(token_tail))
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("token_info", &self.token_info)
            .field("authenticated", &self.authenticated)
            .field("updated", &self.updated)
            .finish()
    }
}

/// Where a session's credentials came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    /// Loaded from the encrypted session cookie.
    Cookie,
    /// Presented as an `Authorization: Bearer` header.
    Bearer,
}

/// One principal's authentication state for the duration of a request.
#[derive(Debug, Clone)]
pub struct Session {
    params: SessionParams,
    source: SessionSource,
    dirty: bool,
}

impl Session {
    /// An empty, unauthenticated session.
    #[must_use]
    pub fn new(source: SessionSource) -> Self {
        Self {
            params: SessionParams::default(),
            source,
            dirty: false,
        }
    }

    /// A session restored from persisted parameters.
    #[must_use]
    pub fn from_params(params: SessionParams, source: SessionSource) -> Self {
        Self {
            params,
            source,
            dirty: false,
        }
    }

    #[must_use]
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    #[must_use]
    pub fn source(&self) -> SessionSource {
        self.source
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.params.access_token.as_deref()
    }

    #[must_use]
    pub fn token_info(&self) -> Option<&TokenInfo> {
        self.params.token_info.as_ref()
    }

    /// The principal's name, when introspection supplied one.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.params.token_info.as_ref().and_then(TokenInfo::username)
    }

    /// An access token is present.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.params.access_token.is_some()
    }

    /// The provider has not declared the token inactive. Absence of an
    /// introspection result counts as active; staleness is what
    /// [`Session::needs_revalidation`] exists for.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.params.token_info.as_ref().is_none_or(|info| info.active)
    }

    /// The hard session lifetime has run out.
    ///
    /// Bearer sessions are exempt: the upstream token's own lifetime
    /// governs them, enforced through introspection.
    #[must_use]
    pub fn is_elapsed(&self, config: &ProviderConfig) -> bool {
        if self.source == SessionSource::Bearer {
            return false;
        }
        match (config.expires_in(), self.params.authenticated) {
            (Some(bound), Some(authenticated)) => Utc::now() - authenticated > bound,
            _ => false,
        }
    }

    /// Whether the next [`Session::update`] should go back to the
    /// provider.
    #[must_use]
    pub fn needs_revalidation(&self, config: &ProviderConfig) -> bool {
        if self.params.access_token.is_none() {
            return false;
        }
        if self.params.token_info.is_none() {
            return true;
        }
        if self.is_elapsed(config) {
            return true;
        }
        match self.params.updated {
            Some(updated) => Utc::now() - updated > config.recheck_interval(),
            None => true,
        }
    }

    /// The single boolean gating every protected request. Computed fresh
    /// on every call; `is_elapsed` depends on the wall clock.
    #[must_use]
    pub fn is_access_granted(&self, config: &ProviderConfig) -> bool {
        self.is_authenticated() && self.is_active() && !self.is_elapsed(config)
    }

    /// Installs a freshly obtained token set.
    ///
    /// The `refresh_token` and `id_token` survive when the response omits
    /// them, so a refresh grant that returns only an access token does not
    /// orphan the session. Any previous introspection result is dropped;
    /// it described the old token.
    pub fn authenticate(&mut self, token: &TokenResponse) {
        let now = Utc::now();
        self.params.access_token = Some(token.access_token.clone());
        self.params.token_type = Some(token.token_type.clone());
        if token.refresh_token.is_some() {
            self.params.refresh_token = token.refresh_token.clone();
        }
        if token.id_token.is_some() {
            self.params.id_token = token.id_token.clone();
        }
        if token.scope.is_some() {
            self.params.scope = token.scope.clone();
        }
        self.params.token_info = None;
        self.params.authenticated = Some(now);
        self.params.updated = Some(now);
        self.dirty = true;
    }

    fn merge_token_info(&mut self, info: TokenInfo) {
        self.params.token_info = Some(info);
        self.params.updated = Some(Utc::now());
        self.dirty = true;
    }

    /// Revalidates the session against the provider when stale.
    ///
    /// Returns `Ok(true)` when the params changed and need persisting.
    /// Steps: skip when unauthenticated, already denied beyond repair, or
    /// still fresh; introspect; if the token is inactive or the session's
    /// hard lifetime has elapsed and a refresh token exists, run the
    /// refresh grant. A successful refresh re-authenticates and returns
    /// immediately: the new token is fresh by construction and gets no
    /// second introspection within this call.
    ///
    /// # Errors
    ///
    /// Introspection transport failures propagate; the caller treats them
    /// as a failed revalidation. Refresh failures do not propagate, the
    /// session just stays denied.
    pub async fn update(
        &mut self,
        client: &TokenExchangeClient,
        config: &ProviderConfig,
    ) -> Result<bool, GatewayError> {
        let Some(access_token) = self.params.access_token.clone() else {
            return Ok(false);
        };

        // Denied with no refresh token: nothing can change, so repeated
        // calls must not retry upstream.
        if let Some(info) = &self.params.token_info
            && !info.active
            && self.params.refresh_token.is_none()
        {
            return Ok(false);
        }

        if !self.needs_revalidation(config) {
            return Ok(false);
        }

        let refresh_token = self.params.refresh_token.clone();
        let info = client.introspect(&access_token, Some("access_token")).await?;

        if (!info.active || self.is_elapsed(config))
            && let Some(refresh) = refresh_token
        {
            match client.get_token_from_refresh_token(&refresh).await {
                Ok(token) => {
                    tracing::debug!(
                        token_tail = token_tail(&token.access_token),
                        "session re-authenticated via refresh grant"
                    );
                    self.authenticate(&token);
                    return Ok(true);
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        token_tail = token_tail(&access_token),
                        "refresh grant failed, session stays denied"
                    );
                    // A failed refresh token is dead weight; dropping it
                    // makes the denial idempotent.
                    self.params.refresh_token = None;
                }
            }
        }

        self.merge_token_info(info);
        Ok(true)
    }

    /// Erases all authentication state.
    pub fn clear(&mut self) {
        self.params = SessionParams::default();
        self.dirty = true;
    }

    /// Consumes the dirty flag; true means the params changed since load
    /// and must be written back to their store.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
