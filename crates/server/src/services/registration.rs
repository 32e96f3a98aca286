//! Registration and email confirmation.
//!
//! ```text
//! submitted -> (duplicate email: rejected)
//!           -> pending -> (token valid, unexpired: confirmed)
//!                      -> (token expired, superseded or reused: rejected)
//! ```
//!
//! The pending subject and its confirmation token are written in one store
//! call. If the confirmation email then fails, both are deleted again before
//! the error is returned; a failed clean-up is left to the sweep.

use std::sync::Arc;
use std::time::Duration;

use vdiamond_core::{Email, SubjectStatus, TokenPurpose, TokenStatus, TokenValue};

use crate::config::{DeploymentMode, RegistrationPolicy, TokenPolicy};
use crate::db::{RepositoryError, Store};
use crate::models::{EphemeralToken, NewSubject, NewToken, Subject};
use crate::services::auth::{AuthError, hash_password, validate_password};
use crate::services::cart::CartLedger;
use crate::services::clock::Clock;
use crate::services::email::{self, Mailer, OutboundEmail};
use crate::services::tokens::TokenIssuer;

/// Input to [`RegistrationFlow::register`].
#[derive(Clone)]
pub struct RegisterInput {
    pub email: String,
    pub password: String,
    pub name: String,
}

impl std::fmt::Debug for RegisterInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterInput")
            .field("email", &self.email)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub subject: Subject,
    /// Whether the caller still has to follow the emailed link.
    pub needs_confirmation: bool,
}

/// Everything the flow needs besides the store and mailer.
#[derive(Clone)]
pub struct FlowSettings {
    pub mode: DeploymentMode,
    pub base_url: String,
    pub tokens: TokenPolicy,
    pub registration: RegistrationPolicy,
    pub email_timeout: Duration,
}

/// Account creation and confirmation.
#[derive(Clone)]
pub struct RegistrationFlow<S, M> {
    store: S,
    mailer: M,
    issuer: TokenIssuer,
    carts: CartLedger<S>,
    clock: Arc<dyn Clock>,
    settings: FlowSettings,
}

impl<S: Store, M: Mailer> RegistrationFlow<S, M> {
    #[must_use]
    pub fn new(
        store: S,
        mailer: M,
        issuer: TokenIssuer,
        carts: CartLedger<S>,
        clock: Arc<dyn Clock>,
        settings: FlowSettings,
    ) -> Self {
        Self {
            store,
            mailer,
            issuer,
            carts,
            clock,
            settings,
        }
    }

    /// Register a password account.
    ///
    /// In development mode the account is confirmed immediately; otherwise a
    /// confirmation link is emailed and the subject stays `pending`.
    ///
    /// # Errors
    ///
    /// Validation errors for bad input, `AuthError::EmailAlreadyExists` for a
    /// taken email, and a transient error if the email cannot be sent (in
    /// which case nothing is left behind).
    pub async fn register(&self, input: RegisterInput) -> Result<Registration, AuthError> {
        let email = Email::parse(&input.email)?;
        let policy = &self.settings.registration;
        if !policy.allowed_domains.is_empty() && !email.is_in_domains(&policy.allowed_domains) {
            return Err(AuthError::EmailDomainNotAllowed);
        }

        let name = input.name.trim();
        if name.is_empty() {
            return Err(AuthError::MissingField("name"));
        }
        validate_password(&input.password, policy)?;

        if self.store.subject_by_email(&email).await?.is_some() {
            return Err(AuthError::EmailAlreadyExists);
        }

        let password_hash = hash_password(&input.password)?;
        let value = self.issuer.new_ephemeral_token()?;

        let (mut subject, token) = self
            .store
            .register_pending(
                NewSubject {
                    email,
                    name: name.to_string(),
                    picture: None,
                    password_hash: Some(password_hash),
                    external_id: None,
                    status: SubjectStatus::Pending,
                },
                value.clone(),
                self.clock.now(),
            )
            .await
            .map_err(|e| match e {
                // Lost a race with a concurrent registration for the same email
                RepositoryError::Conflict(_) => AuthError::EmailAlreadyExists,
                other => AuthError::Repository(other),
            })?;

        tracing::info!(user_id = %subject.id, mode = ?self.settings.mode, "Registered subject");

        let needs_confirmation = if self.settings.mode.auto_confirms() {
            if self.store.confirm_registration(token.id, subject.id).await? {
                subject.status = SubjectStatus::Active;
            }
            false
        } else {
            if let Err(e) = self.send_confirmation(&subject, &value).await {
                self.compensate(&subject, &token).await;
                return Err(e);
            }
            true
        };

        self.carts.provision(subject.id).await;

        Ok(Registration {
            subject,
            needs_confirmation,
        })
    }

    /// Undo a registration whose email could not be sent.
    async fn compensate(&self, subject: &Subject, token: &EphemeralToken) {
        match self.store.reap_registration(token.id, subject.id).await {
            Ok(true) => {
                tracing::info!(user_id = %subject.id, "Rolled back registration after email failure");
            }
            Ok(false) => {
                tracing::warn!(user_id = %subject.id, "Registration already resolved, nothing rolled back");
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %subject.id,
                    error = %e,
                    "Rollback failed, leaving registration to the sweep"
                );
            }
        }
    }

    async fn send_confirmation(&self, subject: &Subject, value: &TokenValue) -> Result<(), AuthError> {
        let message = OutboundEmail::confirm_registration(
            &subject.email,
            &subject.name,
            email::confirmation_link(&self.settings.base_url, value),
            self.settings.tokens.confirmation_ttl,
        )?;

        email::deliver(&self.mailer, message, self.settings.email_timeout)
            .await
            .map_err(|e| {
                tracing::warn!(user_id = %subject.id, error = %e, "Confirmation email failed");
                AuthError::Mail(e)
            })
    }

    /// Redeem a confirmation token.
    ///
    /// Checks run in order: the token must exist (for this purpose), must be
    /// within the confirmation TTL, and must still be unconfirmed. The final
    /// flip is a guarded update, so of N concurrent calls exactly one
    /// succeeds and the rest see `AlreadyConfirmed`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::TokenNotFound`, `AuthError::TokenExpired` or
    /// `AuthError::AlreadyConfirmed`.
    pub async fn confirm(&self, raw: &str) -> Result<Subject, AuthError> {
        let value = TokenValue::parse(raw).map_err(|_| AuthError::TokenNotFound)?;
        let token = self
            .store
            .token_by_value(&value)
            .await?
            .filter(|t| t.purpose == TokenPurpose::ConfirmRegistration)
            .ok_or(AuthError::TokenNotFound)?;

        // Left unconfirmed on purpose: the sweep only reclaims unconfirmed tokens
        if token.is_expired(self.clock.now(), self.settings.tokens.confirmation_ttl) {
            return Err(AuthError::TokenExpired);
        }
        check_unresolved(token.status)?;

        if !self
            .store
            .confirm_registration(token.id, token.user_id)
            .await?
        {
            // Lost the race; report what the winner did
            let status = self
                .store
                .token_by_value(&value)
                .await?
                .ok_or(AuthError::TokenNotFound)?
                .status;
            check_unresolved(status)?;
            return Err(AuthError::AlreadyConfirmed);
        }

        let subject = self
            .store
            .subject_by_id(token.user_id)
            .await?
            .ok_or(AuthError::SubjectNotFound)?;
        tracing::info!(user_id = %subject.id, "Email confirmed");
        Ok(subject)
    }

    /// Send a fresh confirmation link to a pending subject.
    ///
    /// Always succeeds for a well-formed email so the response does not
    /// reveal whether an account exists. Issuing the new token expires the
    /// previous one.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidEmail` for malformed input and a transient
    /// error if the subject lookup fails.
    pub async fn resend(&self, email: &str) -> Result<(), AuthError> {
        let email = Email::parse(email)?;
        let Some(subject) = self.store.subject_by_email(&email).await? else {
            tracing::debug!("Resend requested for unknown email");
            return Ok(());
        };
        if subject.is_active() {
            tracing::debug!(user_id = %subject.id, "Resend requested for active subject");
            return Ok(());
        }

        if let Err(e) = self.reissue(&subject).await {
            tracing::warn!(user_id = %subject.id, error = %e, "Resend confirmation failed");
        }
        Ok(())
    }

    async fn reissue(&self, subject: &Subject) -> Result<(), AuthError> {
        let value = self.issuer.new_ephemeral_token()?;
        self.store
            .issue_token(NewToken {
                user_id: subject.id,
                purpose: TokenPurpose::ConfirmRegistration,
                value: value.clone(),
                created_at: self.clock.now(),
            })
            .await?;
        self.send_confirmation(subject, &value).await
    }
}

/// Map a resolved status to its rejection.
const fn check_unresolved(status: TokenStatus) -> Result<(), AuthError> {
    match status {
        TokenStatus::Unconfirmed => Ok(()),
        TokenStatus::Confirmed => Err(AuthError::AlreadyConfirmed),
        TokenStatus::Used => Err(AuthError::TokenUsed),
        TokenStatus::Expired => Err(AuthError::TokenExpired),
    }
}
