//! Error types for the gateway core.
//!
//! Two families exist:
//! - `ConfigError`: construction-time failures. These are fatal and never
//!   reach request handling.
//! - `GatewayError`: per-request failures. This is a closed sum type; each
//!   variant knows its HTTP status, whether the client should be redirected
//!   back through login instead of shown an error, and whether server-side
//!   error logging should be suppressed because the condition is
//!   caller-driven rather than a system fault.

use crate::codec::StateCodecError;
use std::fmt;

/// Fatal errors raised while building a [`crate::config::ProviderConfig`]
/// or a [`crate::provider::Provider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No OAuth2 client id was supplied.
    MissingClientId,
    /// No OAuth2 client secret was supplied.
    MissingClientSecret,
    /// Neither an introspection URL nor a hard `expires_in` bound was
    /// configured; without either there is no way to ever invalidate a
    /// session.
    MissingExpiryBound,
    /// An endpoint URL failed to parse or resolve.
    InvalidUrl { field: &'static str, reason: String },
    /// The upstream HTTP client could not be constructed.
    HttpClient { reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingClientId => write!(f, "client_id is required"),
            Self::MissingClientSecret => write!(f, "client_secret is required"),
            Self::MissingExpiryBound => write!(
                f,
                "expires_in is required when no introspection URL is configured"
            ),
            Self::InvalidUrl { field, reason } => {
                write!(f, "invalid URL for '{field}': {reason}")
            }
            Self::HttpClient { reason } => {
                write!(f, "failed to build HTTP client: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Per-request errors surfaced by gateway operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Access denied: the session or token is not authorized.
    NotAuthorized { reason: String },
    /// Access denied in a way the client can recover from by re-fetching
    /// (the middleware translates this into a login redirect).
    NotAuthorizedReload { reason: String },
    /// The login-allow predicate rejected this request.
    LoginNotAllowed { reason: String },
    /// A disabled service endpoint was invoked.
    ServiceDisabled { service: &'static str },
    /// A required request parameter is absent.
    MissingParameter { name: &'static str },
    /// A request parameter is present but unusable.
    InvalidParameter { name: &'static str },
    /// An encrypted value failed to decrypt, verify, or was expired.
    State(StateCodecError),
    /// An upstream call exceeded the configured request timeout.
    Timeout { operation: &'static str },
    /// The identity provider answered with a non-2xx status.
    Upstream { status: u16, body: String },
    /// The identity provider could not be reached or answered garbage.
    Transport { reason: String },
}

impl GatewayError {
    /// The HTTP status this error translates to at the service boundary.
    ///
    /// Authorization failures are 403; 401 is reserved for requests that
    /// presented no credentials at all, which is decided by the middleware
    /// and never expressed as an error variant.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotAuthorized { .. } | Self::NotAuthorizedReload { .. } => 403,
            Self::LoginNotAllowed { .. } => 403,
            Self::ServiceDisabled { .. } => 404,
            Self::MissingParameter { .. } => 404,
            Self::InvalidParameter { .. } => 400,
            Self::State(err) => match err {
                StateCodecError::Expired => 403,
                StateCodecError::Tampered => 403,
                StateCodecError::Malformed { .. } => 400,
            },
            Self::Timeout { .. } => 504,
            Self::Upstream { .. } | Self::Transport { .. } => 502,
        }
    }

    /// True if the client should be sent back through login rather than
    /// shown an error page.
    #[must_use]
    pub fn wants_reload(&self) -> bool {
        matches!(self, Self::NotAuthorizedReload { .. })
    }

    /// True if server-side error logging should be skipped: the condition
    /// is caller-driven, not a system fault.
    #[must_use]
    pub fn suppress_logging(&self) -> bool {
        matches!(
            self,
            Self::LoginNotAllowed { .. } | Self::ServiceDisabled { .. }
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthorized { reason } => write!(f, "not authorized: {reason}"),
            Self::NotAuthorizedReload { reason } => {
                write!(f, "not authorized (reload): {reason}")
            }
            Self::LoginNotAllowed { reason } => {
                write!(f, "login not allowed: {reason}")
            }
            Self::ServiceDisabled { service } => {
                write!(f, "service '{service}' is disabled")
            }
            Self::MissingParameter { name } => {
                write!(f, "missing required parameter '{name}'")
            }
            Self::InvalidParameter { name } => {
                write!(f, "invalid value for parameter '{name}'")
            }
            Self::State(err) => write!(f, "{err}"),
            Self::Timeout { operation } => {
                write!(f, "upstream '{operation}' call timed out")
            }
            Self::Upstream { status, body } => {
                write!(f, "identity provider returned {status}: {body}")
            }
            Self::Transport { reason } => {
                write!(f, "identity provider unreachable: {reason}")
            }
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<StateCodecError> for GatewayError {
    fn from(err: StateCodecError) -> Self {
        Self::State(err)
    }
}

/// Returns the last few characters of a token for log correlation.
///
/// Tokens must never appear whole in logs or error bodies.
#[must_use]
pub fn token_tail(token: &str) -> &str {
    const TAIL: usize = 6;
    if token.len() <= TAIL {
        return "...";
    }
    let mut cut = token.len() - TAIL;
    while !token.is_char_boundary(cut) {
        cut += 1;
    }
    &token[cut..]
}
