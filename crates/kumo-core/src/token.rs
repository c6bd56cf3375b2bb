//! Cloud credential and its process-wide store.
//!
//! A [`CloudTokenStore`] holds at most one [`CloudCredential`] for an account. Each
//! login or refresh replaces it wholesale behind a write lock, so readers see either
//! the old credential or the new one, never a mix. A generation counter increments
//! on every replace; the authenticator uses it to tell whether another caller already
//! rotated the credential.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    clock::Clock,
    cloud::TokenPair,
    config::{
        ACCESS_TOKEN_LIFETIME_SECS, ACCESS_TOKEN_SAFETY_MARGIN_SECS, REFRESH_TOKEN_LIFETIME_SECS,
    },
    error::Error,
};

/// Token lifetimes and the access token safety margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    /// Access lifetime used when the token has no `exp` claim.
    pub access_lifetime: TimeDelta,
    /// Refresh lifetime used when the token has no `exp` claim.
    pub refresh_lifetime: TimeDelta,
    /// Access tokens are considered expired this long before they really are.
    pub safety_margin: TimeDelta,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            access_lifetime: TimeDelta::seconds(ACCESS_TOKEN_LIFETIME_SECS),
            refresh_lifetime: TimeDelta::seconds(REFRESH_TOKEN_LIFETIME_SECS),
            safety_margin: TimeDelta::seconds(ACCESS_TOKEN_SAFETY_MARGIN_SECS),
        }
    }
}

/// Claims read from a JWT payload. The signature is not verified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JwtClaims {
    /// Expiry, seconds since the epoch.
    pub exp: Option<i64>,
    /// Account id (`id` claim).
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
struct RawClaims {
    exp: Option<i64>,
    id: Option<Value>,
}

/// Decodes the payload segment of a JWT. Returns `None` for opaque tokens.
pub fn decode_claims(token: &str) -> Option<JwtClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let raw: RawClaims = serde_json::from_slice(&bytes).ok()?;
    let user_id = raw.id.and_then(|id| match id {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    Some(JwtClaims {
        exp: raw.exp,
        user_id,
    })
}

/// Access and refresh tokens for one account with their expiry times.
#[derive(Clone)]
pub struct CloudCredential {
    access_token: SecretString,
    refresh_token: SecretString,
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
    user_id: Option<String>,
}

impl CloudCredential {
    /// Builds a credential from a freshly issued token pair.
    ///
    /// Expiry comes from each token's `exp` claim when present, otherwise from the
    /// policy's nominal lifetimes counted from `issued_at`.
    pub fn from_tokens(pair: &TokenPair, issued_at: DateTime<Utc>, policy: &TokenPolicy) -> Self {
        let access_claims = decode_claims(pair.access()).unwrap_or_default();
        let refresh_claims = decode_claims(pair.refresh()).unwrap_or_default();

        let expiry = |claims: &JwtClaims, nominal: TimeDelta| {
            claims
                .exp
                .and_then(|exp| DateTime::from_timestamp(exp, 0))
                .unwrap_or(issued_at + nominal)
        };

        Self {
            access_token: SecretString::from(pair.access().to_string()),
            refresh_token: SecretString::from(pair.refresh().to_string()),
            access_expires_at: expiry(&access_claims, policy.access_lifetime),
            refresh_expires_at: expiry(&refresh_claims, policy.refresh_lifetime),
            user_id: access_claims.user_id.or(refresh_claims.user_id),
        }
    }

    /// Exposes the access token. Never log the returned value.
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    /// Exposes the refresh token. Never log the returned value.
    pub fn refresh_token(&self) -> &str {
        self.refresh_token.expose_secret()
    }

    pub fn access_expires_at(&self) -> DateTime<Utc> {
        self.access_expires_at
    }

    pub fn refresh_expires_at(&self) -> DateTime<Utc> {
        self.refresh_expires_at
    }

    /// Account id from the token claims, if present.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// `true` if the access token is usable at `now` with `margin` to spare.
    pub fn access_valid_at(&self, now: DateTime<Utc>, margin: TimeDelta) -> bool {
        now + margin < self.access_expires_at
    }

    /// `true` if the refresh token has not expired at `now`.
    pub fn refresh_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.refresh_expires_at
    }
}

impl fmt::Debug for CloudCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// A valid access token and the store generation it was read from.
#[derive(Clone)]
pub struct AccessToken {
    value: SecretString,
    generation: u64,
}

impl AccessToken {
    /// Exposes the token for an `Authorization` header.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    /// Store generation the token belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Default)]
struct StoreInner {
    credential: Option<Arc<CloudCredential>>,
    generation: u64,
}

/// Holder of the live credential for one account.
pub struct CloudTokenStore {
    inner: RwLock<StoreInner>,
    clock: Arc<dyn Clock>,
    policy: TokenPolicy,
}

impl CloudTokenStore {
    /// Creates an empty store.
    pub fn new(clock: Arc<dyn Clock>, policy: TokenPolicy) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Returns the access token if it is still valid with the safety margin.
    ///
    /// # Errors
    ///
    /// [`Error::NotLoggedIn`] with no credential, [`Error::AccessTokenExpired`] once
    /// the token is within the safety margin of expiry.
    pub fn current_access_token(&self) -> Result<AccessToken, Error> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let credential = inner.credential.as_ref().ok_or(Error::NotLoggedIn)?;
        if !credential.access_valid_at(self.clock.now(), self.policy.safety_margin) {
            return Err(Error::AccessTokenExpired);
        }
        Ok(AccessToken {
            value: credential.access_token.clone(),
            generation: inner.generation,
        })
    }

    /// Current credential, if any, regardless of expiry.
    pub fn credential(&self) -> Option<Arc<CloudCredential>> {
        self.snapshot().0
    }

    /// Current credential and generation, read together.
    pub fn snapshot(&self) -> (Option<Arc<CloudCredential>>, u64) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (inner.credential.clone(), inner.generation)
    }

    /// Generation of the current credential. Starts at 0 and increments on every
    /// replace or clear.
    pub fn generation(&self) -> u64 {
        self.snapshot().1
    }

    /// Replaces the credential and returns the new generation.
    pub(crate) fn replace(&self, credential: Arc<CloudCredential>) -> u64 {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.credential = Some(credential);
        inner.generation += 1;
        debug!(generation = inner.generation, "Cloud credential replaced");
        inner.generation
    }

    /// Discards the credential.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.credential.take().is_some() {
            inner.generation += 1;
            debug!(generation = inner.generation, "Cloud credential cleared");
        }
    }
}

impl fmt::Debug for CloudTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (credential, generation) = self.snapshot();
        f.debug_struct("CloudTokenStore")
            .field("credential", &credential)
            .field("generation", &generation)
            .finish()
    }
}
