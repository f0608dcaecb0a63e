//! OAuth2 authentication gateway core.
//!
//! Turns incoming HTTP requests into authenticated principals: runs the
//! authorization-code dance against a remote identity provider, keeps a
//! renewable session alive across requests (encrypted cookie or bearer
//! token), and enforces the revalidation policy that decides, per
//! request, whether access is granted.
//!
//! The HTTP layer itself lives in the server binary; this crate is the
//! framework-independent core it calls into.

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod provider;
pub mod session;
pub mod store;

pub use cache::{BearerTokenCache, CacheConfig};
pub use client::{TokenExchangeClient, TokenInfo, TokenResponse};
pub use codec::{StateCodec, StateCodecError};
pub use config::{LoginAttempt, ProviderConfig, ProviderSettings};
pub use error::{ConfigError, GatewayError, token_tail};
pub use provider::{
    AuthorizeState, CallbackOutcome, CookieUpdate, LoginResult, MergedParams, Provider,
};
pub use session::{Session, SessionParams, SessionSource};
pub use store::{MemorySessionStore, SessionStore};
