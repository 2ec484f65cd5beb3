//! Credential supply
//!
//! The realtime client does not log in; it consumes a bearer token from a
//! [`CredentialSupplier`] and asks it whether the token is still valid before
//! every connect attempt.
//!
//! [`TokenStore`] is the supplier used by the application: it holds the JWT
//! returned by the login endpoint, judges validity from the token's `exp`
//! claim, and publishes a rotation signal whenever the token changes (new
//! login, refresh, or logout).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

/// Capability that hands out the bearer credential
pub trait CredentialSupplier: Send + Sync {
    /// Current token, if any
    fn bearer_token(&self) -> Option<String>;

    /// Whether the current token may still be used
    fn is_valid(&self) -> bool;
}

impl<T: CredentialSupplier + ?Sized> CredentialSupplier for Arc<T> {
    fn bearer_token(&self) -> Option<String> {
        (**self).bearer_token()
    }

    fn is_valid(&self) -> bool {
        (**self).is_valid()
    }
}

/// In-memory JWT holder with a rotation signal
#[derive(Debug)]
pub struct TokenStore {
    token: RwLock<Option<String>>,
    rotation: watch::Sender<u64>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    pub fn new() -> Self {
        let (rotation, _) = watch::channel(0);
        Self {
            token: RwLock::new(None),
            rotation,
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        *store.write_guard() = Some(token.into());
        store
    }

    /// Replace the token and notify rotation observers
    pub fn set_token(&self, token: Option<String>) {
        *self.write_guard() = token;
        self.rotation.send_modify(|generation| *generation += 1);
        tracing::debug!("[AUTH] Token rotated (generation {})", *self.rotation.borrow());
    }

    /// Clear the token (logout)
    pub fn clear(&self) {
        self.set_token(None);
    }

    /// Observe token changes; the value is a generation counter
    pub fn rotations(&self) -> watch::Receiver<u64> {
        self.rotation.subscribe()
    }

    /// `exp` claim of the current token
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.bearer_token().as_deref().and_then(jwt_expiry)
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Option<String>> {
        self.token.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialSupplier for TokenStore {
    fn bearer_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn is_valid(&self) -> bool {
        match self.expires_at() {
            Some(expiry) => expiry > Utc::now(),
            None => false,
        }
    }
}

/// Read the `exp` claim of a JWT without verifying its signature.
///
/// Returns `None` for tokens that are not three dot-separated segments,
/// whose payload is not base64url JSON, or that carry no numeric `exp`.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}
