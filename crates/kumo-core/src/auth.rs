//! Login and single-flight token refresh.
//!
//! Refresh tokens are single-use: once the cloud answers a refresh, the token that
//! was sent is dead. Two concurrent refreshes would therefore invalidate each other.
//! [`CloudAuthenticator`] keeps at most one refresh in flight per account; callers
//! arriving while it runs await the same shared result.
//!
//! The network exchange runs in a spawned task that also applies the result to the
//! store. Dropping a waiting caller cannot lose a rotated credential, and the store
//! update is a single replace.
//!
//! Logins are serialized by a gate. A caller that waited at the gate while another
//! login stored a fresh credential takes that credential instead of logging in again.

use std::sync::{Arc, Mutex, PoisonError};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    cloud::CloudApi,
    credentials::Credentials,
    error::Error,
    token::{CloudCredential, CloudTokenStore},
};

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<CloudCredential>, Error>>>;

/// Performs login and refresh exchanges and updates the token store.
pub struct CloudAuthenticator {
    api: Arc<dyn CloudApi>,
    store: Arc<CloudTokenStore>,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<Option<SharedRefresh>>,
    login_gate: tokio::sync::Mutex<()>,
}

impl CloudAuthenticator {
    pub fn new(
        api: Arc<dyn CloudApi>,
        store: Arc<CloudTokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            store,
            clock,
            in_flight: Mutex::new(None),
            login_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<CloudTokenStore> {
        &self.store
    }

    /// Logs in with username and password and stores the new credential.
    ///
    /// Concurrent callers share one login.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCredentials`] if the cloud rejects the pair,
    /// [`Error::CloudUnreachable`] on network failure.
    pub async fn login(&self, credentials: &Credentials) -> Result<Arc<CloudCredential>, Error> {
        self.login_from(credentials, self.store.generation()).await
    }

    /// Logs in unless the credential has moved past `observed_generation` and is
    /// still valid, in which case that credential is returned.
    pub(crate) async fn login_from(
        &self,
        credentials: &Credentials,
        observed_generation: u64,
    ) -> Result<Arc<CloudCredential>, Error> {
        if credentials.is_incomplete() {
            return Err(Error::InvalidCredentials(
                "username and password are required".into(),
            ));
        }

        let _gate = self.login_gate.lock().await;

        let (current, generation) = self.store.snapshot();
        if generation != observed_generation
            && let Some(credential) = current
            && credential.access_valid_at(self.clock.now(), self.store.policy().safety_margin)
        {
            debug!(generation, "Reusing credential from concurrent login");
            return Ok(credential);
        }

        let pair = self.api.login(credentials).await?;
        let credential = Arc::new(CloudCredential::from_tokens(
            &pair,
            self.clock.now(),
            self.store.policy(),
        ));
        let generation = self.store.replace(credential.clone());
        info!(
            username = %credentials.username,
            generation,
            access_expires_at = %credential.access_expires_at(),
            "Logged in to Kumo cloud"
        );
        Ok(credential)
    }

    /// Refreshes the stored credential with its refresh token.
    ///
    /// Joins a refresh already in flight instead of starting a second one.
    ///
    /// # Errors
    ///
    /// [`Error::RefreshTokenExpired`] when the refresh token is expired or rejected
    /// (log in again), [`Error::NotLoggedIn`] with no credential, or
    /// [`Error::CloudUnreachable`].
    pub async fn refresh(&self) -> Result<Arc<CloudCredential>, Error> {
        self.refresh_from(self.store.generation()).await
    }

    /// Refreshes unless the credential has already moved past `observed_generation`
    /// and is still valid, in which case that credential is returned.
    pub(crate) async fn refresh_from(
        &self,
        observed_generation: u64,
    ) -> Result<Arc<CloudCredential>, Error> {
        let flight = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

            // A finished flight nobody cleared (its waiters were dropped) is stale.
            if slot.as_ref().is_some_and(|flight| flight.peek().is_some()) {
                *slot = None;
            }

            match slot.clone() {
                Some(flight) => {
                    debug!("Joining in-flight token refresh");
                    flight
                }
                None => {
                    let (credential, generation) = self.store.snapshot();
                    let credential = credential.ok_or(Error::NotLoggedIn)?;
                    let now = self.clock.now();

                    if generation != observed_generation
                        && credential.access_valid_at(now, self.store.policy().safety_margin)
                    {
                        debug!(generation, "Credential already rotated");
                        return Ok(credential);
                    }
                    if !credential.refresh_valid_at(now) {
                        return Err(Error::RefreshTokenExpired);
                    }

                    let flight = self.spawn_refresh(credential.refresh_token().to_string());
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&flight)) {
            *slot = None;
        }
        result
    }

    fn spawn_refresh(&self, refresh_token: String) -> SharedRefresh {
        let api = self.api.clone();
        let store = self.store.clone();
        let clock = self.clock.clone();

        let task = tokio::spawn(async move {
            debug!("Refreshing cloud token");
            let pair = match api.refresh(&refresh_token).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Token refresh failed");
                    return Err(e);
                }
            };
            let credential = Arc::new(CloudCredential::from_tokens(
                &pair,
                clock.now(),
                store.policy(),
            ));
            let generation = store.replace(credential.clone());
            info!(
                generation,
                access_expires_at = %credential.access_expires_at(),
                "Refreshed cloud token"
            );
            Ok(credential)
        });

        async move {
            task.await
                .map_err(|e| Error::Protocol(format!("token refresh task failed: {e}")))?
        }
        .boxed()
        .shared()
    }
}

impl std::fmt::Debug for CloudAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudAuthenticator")
            .field("store", &self.store)
            .finish()
    }
}
