//! Authenticated encryption for small state payloads.
//!
//! One primitive covers every opaque value this gateway issues: the CSRF
//! `state` parameter, the session cookie blob, and the encrypted token
//! bundles. The plaintext is a JSON envelope carrying its own creation
//! timestamp and time-to-live, so expiry is tamper-evident along with the
//! payload itself.
//!
//! Wire format: `base64url_no_pad( nonce(12) || ciphertext+tag )` over
//! AES-256-GCM, keyed by SHA-256 of the configured secret.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Errors from encrypting or decrypting state blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateCodecError {
    /// The envelope decrypted fine but its time-to-live has elapsed.
    Expired,
    /// AEAD authentication failed: the blob was modified or encrypted
    /// under a different key.
    Tampered,
    /// The blob is not structurally valid (encoding, length, or JSON).
    Malformed { reason: String },
}

impl fmt::Display for StateCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "encrypted value has expired"),
            Self::Tampered => write!(f, "encrypted value failed authentication"),
            Self::Malformed { reason } => {
                write!(f, "encrypted value is malformed: {reason}")
            }
        }
    }
}

impl std::error::Error for StateCodecError {}

/// The plaintext envelope sealed inside every blob.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// Creation time, seconds since the Unix epoch.
    created: i64,
    /// Time-to-live in seconds; absent or non-positive means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<i64>,
    value: serde_json::Value,
}

/// Encrypts and decrypts small JSON payloads with embedded expiry.
#[derive(Clone)]
pub struct StateCodec {
    cipher: Aes256Gcm,
}

impl StateCodec {
    /// Creates a codec keyed by SHA-256 of the given secret.
    ///
    /// Hashing gives a clean 32-byte key regardless of the secret's length,
    /// so the client secret can double as the default encryption key.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let cipher = Aes256Gcm::new(&key.into());
        Self { cipher }
    }

    /// Encrypts `value` into an opaque URL-safe blob.
    ///
    /// A `ttl` of `None` (or a non-positive duration) produces a blob that
    /// never expires on its own.
    pub fn encrypt<T: Serialize>(
        &self,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<String, StateCodecError> {
        let envelope = Envelope {
            created: Utc::now().timestamp(),
            expires_in: ttl
                .map(|d| d.num_seconds())
                .filter(|secs| *secs > 0),
            value: serde_json::to_value(value).map_err(|e| StateCodecError::Malformed {
                reason: format!("payload not serializable: {e}"),
            })?,
        };

        let plaintext = serde_json::to_vec(&envelope).map_err(|e| StateCodecError::Malformed {
            reason: format!("envelope not serializable: {e}"),
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| StateCodecError::Malformed {
                reason: "encryption failed".to_string(),
            })?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(&blob))
    }

    /// Decrypts a blob back into a typed value, enforcing its embedded
    /// expiry.
    pub fn decrypt<T: DeserializeOwned>(&self, blob: &str) -> Result<T, StateCodecError> {
        let value = self.decrypt_value(blob)?;
        serde_json::from_value(value).map_err(|e| StateCodecError::Malformed {
            reason: format!("unexpected payload shape: {e}"),
        })
    }

    /// Decrypts a blob into raw JSON, enforcing its embedded expiry.
    pub fn decrypt_value(&self, blob: &str) -> Result<serde_json::Value, StateCodecError> {
        let raw = URL_SAFE_NO_PAD
            .decode(blob)
            .map_err(|_| StateCodecError::Malformed {
                reason: "invalid base64url encoding".to_string(),
            })?;

        if raw.len() <= NONCE_LEN {
            return Err(StateCodecError::Malformed {
                reason: "blob too short".to_string(),
            });
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StateCodecError::Tampered)?;

        let envelope: Envelope =
            serde_json::from_slice(&plaintext).map_err(|e| StateCodecError::Malformed {
                reason: format!("invalid envelope: {e}"),
            })?;

        if let Some(expires_in) = envelope.expires_in
            && expires_in > 0
            && Utc::now().timestamp() > envelope.created + expires_in
        {
            return Err(StateCodecError::Expired);
        }

        Ok(envelope.value)
    }

    /// The creation timestamp of a blob, without expiry enforcement.
    ///
    /// Used by diagnostics; callers that care about validity must use
    /// [`StateCodec::decrypt`].
    pub fn issued_at(&self, blob: &str) -> Result<DateTime<Utc>, StateCodecError> {
        let raw = URL_SAFE_NO_PAD
            .decode(blob)
            .map_err(|_| StateCodecError::Malformed {
                reason: "invalid base64url encoding".to_string(),
            })?;
        if raw.len() <= NONCE_LEN {
            return Err(StateCodecError::Malformed {
                reason: "blob too short".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StateCodecError::Tampered)?;
        let envelope: Envelope =
            serde_json::from_slice(&plaintext).map_err(|e| StateCodecError::Malformed {
                reason: format!("invalid envelope: {e}"),
            })?;
        DateTime::from_timestamp(envelope.created, 0).ok_or(StateCodecError::Malformed {
            reason: "timestamp out of range".to_string(),
        })
    }
}

impl fmt::Debug for StateCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCodec").finish_non_exhaustive()
    }
}
