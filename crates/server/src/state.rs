//! Application state shared across handlers.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::services::auth::AuthService;
use crate::services::cart::CartLedger;
use crate::services::clock::Clock;
use crate::services::email::Mailer;
use crate::services::google::{GoogleClient, GoogleError};
use crate::services::registration::{FlowSettings, RegistrationFlow};
use crate::services::reset::ResetFlow;
use crate::services::sweep::SweepWorker;
use crate::services::tokens::TokenIssuer;

/// Application state shared across all handlers.
///
/// This struct is cheaply cloneable via `Arc`. It is generic over the store
/// and mailer so the same router runs against Postgres in production and
/// the in-memory store in tests.
pub struct AppState<S, M> {
    inner: Arc<AppStateInner<S, M>>,
}

impl<S, M> Clone for AppState<S, M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct AppStateInner<S, M> {
    config: ServerConfig,
    store: S,
    clock: Arc<dyn Clock>,
    issuer: TokenIssuer,
    auth: AuthService<S>,
    registration: RegistrationFlow<S, M>,
    reset: ResetFlow<S, M>,
    carts: CartLedger<S>,
    google: Option<GoogleClient>,
}

impl<S: Store, M: Mailer> AppState<S, M> {
    /// Wire every service from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Google OAuth client cannot be built.
    pub fn new(
        config: ServerConfig,
        store: S,
        mailer: M,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GoogleError> {
        let issuer = TokenIssuer::new(&config.session, clock.clone());
        let carts = CartLedger::new(store.clone(), clock.clone());
        let settings = FlowSettings {
            mode: config.mode,
            base_url: config.base_url.clone(),
            tokens: config.tokens,
            registration: config.registration.clone(),
            email_timeout: config.timeouts.email,
        };

        let auth = AuthService::new(
            store.clone(),
            issuer.clone(),
            config.registration.clone(),
            carts.clone(),
        );
        let registration = RegistrationFlow::new(
            store.clone(),
            mailer.clone(),
            issuer.clone(),
            carts.clone(),
            clock.clone(),
            settings.clone(),
        );
        let reset = ResetFlow::new(
            store.clone(),
            mailer,
            issuer.clone(),
            clock.clone(),
            settings,
        );
        let google = config
            .google
            .as_ref()
            .map(|google| GoogleClient::new(google, config.timeouts.email))
            .transpose()?;

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                clock,
                issuer,
                auth,
                registration,
                reset,
                carts,
                google,
            }),
        })
    }

    /// The sweep worker for this state's store and clock.
    #[must_use]
    pub fn sweep_worker(&self) -> SweepWorker<S> {
        SweepWorker::new(
            self.inner.store.clone(),
            self.inner.clock.clone(),
            self.inner.config.tokens.confirmation_ttl,
            self.inner.config.sweep_interval,
        )
    }

    /// Get a reference to the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Session signing and verification.
    #[must_use]
    pub fn issuer(&self) -> &TokenIssuer {
        &self.inner.issuer
    }

    #[must_use]
    pub fn auth(&self) -> &AuthService<S> {
        &self.inner.auth
    }

    #[must_use]
    pub fn registration(&self) -> &RegistrationFlow<S, M> {
        &self.inner.registration
    }

    #[must_use]
    pub fn reset(&self) -> &ResetFlow<S, M> {
        &self.inner.reset
    }

    #[must_use]
    pub fn carts(&self) -> &CartLedger<S> {
        &self.inner.carts
    }

    /// Google OAuth client, when federated login is configured.
    #[must_use]
    pub fn google(&self) -> Option<&GoogleClient> {
        self.inner.google.as_ref()
    }
}
