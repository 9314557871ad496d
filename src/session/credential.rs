//! Bearer credential and the shared session cell.
//!
//! SYSTEM CONTEXT
//! ==============
//! The login flow writes a credential, every outbound request reads it at
//! call time, and the session keeper replaces it on renewal. All of them
//! share one [`SessionContext`] rather than reaching into global storage.
//!
//! DESIGN
//! ======
//! The context serializes reads and writes of the token/expiry pair with a
//! single lock, so a reader never observes a new token with the old expiry
//! (or the reverse).

#[cfg(test)]
#[path = "credential_test.rs"]
mod credential_test;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use super::store::{ACCESS_TOKEN_KEY, AUTH_KEYS, KeyValueStore, MemoryStore, StoreError, TOKEN_EXPIRATION_KEY};

// =============================================================================
// CREDENTIAL
// =============================================================================

/// Opaque bearer token plus its absolute expiry in epoch milliseconds.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    value: String,
    expires_at_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct Claims {
    sub: Option<String>,
    exp: Option<i64>,
}

impl Credential {
    #[must_use]
    pub fn new(value: impl Into<String>, expires_at_ms: Option<i64>) -> Self {
        Self { value: value.into(), expires_at_ms }
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn expires_at_ms(&self) -> Option<i64> {
        self.expires_at_ms
    }

    /// Milliseconds until expiry; negative once expired, `None` without an expiry.
    #[must_use]
    pub fn remaining_ms(&self, now_ms: i64) -> Option<i64> {
        self.expires_at_ms.map(|exp| exp - now_ms)
    }

    /// User id carried in the JWT `sub` claim, if the token is a JWT.
    #[must_use]
    pub fn subject(&self) -> Option<String> {
        self.claims().sub.filter(|s| !s.is_empty())
    }

    /// JWT `exp` claim converted to epoch milliseconds.
    #[must_use]
    pub fn jwt_expiry_ms(&self) -> Option<i64> {
        self.claims().exp.map(|secs| secs.saturating_mul(1000))
    }

    fn claims(&self) -> Claims {
        decode_claims(&self.value).unwrap_or_default()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

fn decode_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

// =============================================================================
// SESSION CONTEXT
// =============================================================================

/// Shared handle to the current credential. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    store: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
}

impl SessionContext {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { inner: Arc::new(SessionInner { store, lock: Mutex::new(()) }) }
    }

    /// Context backed by a fresh [`MemoryStore`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Latest stored credential, read at call time.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let value = self.inner.store.get(ACCESS_TOKEN_KEY).filter(|v| !v.is_empty())?;
        let expires_at_ms = self
            .inner
            .store
            .get(TOKEN_EXPIRATION_KEY)
            .and_then(|raw| raw.trim().parse::<i64>().ok());
        Some(Credential { value, expires_at_ms })
    }

    /// Replace the current credential.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backing store rejects the write.
    pub fn set_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match credential.expires_at_ms {
            Some(exp) => {
                let exp = exp.to_string();
                self.inner
                    .store
                    .set_many(&[(ACCESS_TOKEN_KEY, credential.value.as_str()), (TOKEN_EXPIRATION_KEY, exp.as_str())])
            }
            None => {
                self.inner.store.remove_many(&[TOKEN_EXPIRATION_KEY])?;
                self.inner.store.set_many(&[(ACCESS_TOKEN_KEY, credential.value.as_str())])
            }
        }
    }

    /// Drop every auth key (logout).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backing store rejects the write.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.store.remove_many(&AUTH_KEYS)
    }

    /// User id decoded from the current credential.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.credential().and_then(|c| c.subject())
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext").field("credential", &self.credential()).finish()
    }
}
