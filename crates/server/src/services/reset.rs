//! Forgot-password and password reset.
//!
//! `forgot` never reveals whether an account exists: unknown emails, pending
//! subjects and delivery failures all produce the same acknowledgement.
//! Reset tokens live for 30 minutes and are redeemed by a guarded
//! `unconfirmed -> used` flip that also stores the new hash.

use std::sync::Arc;

use vdiamond_core::{Email, TokenPurpose, TokenValue};

use crate::db::Store;
use crate::models::{EphemeralToken, NewToken, Subject};
use crate::services::auth::{AuthError, hash_password, validate_password};
use crate::services::clock::Clock;
use crate::services::email::{self, Mailer, OutboundEmail};
use crate::services::registration::FlowSettings;
use crate::services::tokens::TokenIssuer;

/// Password reset orchestration.
#[derive(Clone)]
pub struct ResetFlow<S, M> {
    store: S,
    mailer: M,
    issuer: TokenIssuer,
    clock: Arc<dyn Clock>,
    settings: FlowSettings,
}

impl<S: Store, M: Mailer> ResetFlow<S, M> {
    #[must_use]
    pub fn new(
        store: S,
        mailer: M,
        issuer: TokenIssuer,
        clock: Arc<dyn Clock>,
        settings: FlowSettings,
    ) -> Self {
        Self {
            store,
            mailer,
            issuer,
            clock,
            settings,
        }
    }

    /// Start a reset for `email` if it belongs to an active subject.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidEmail` for malformed input and a transient
    /// error if the subject lookup itself fails.
    pub async fn forgot(&self, email: &str) -> Result<(), AuthError> {
        let email = Email::parse(email)?;

        let Some(subject) = self.store.subject_by_email(&email).await? else {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(());
        };
        if !subject.is_active() {
            tracing::debug!(user_id = %subject.id, "Password reset requested for pending subject");
            return Ok(());
        }

        if let Err(e) = self.issue_and_send(&subject).await {
            tracing::warn!(user_id = %subject.id, error = %e, "Password reset email not sent");
        }
        Ok(())
    }

    async fn issue_and_send(&self, subject: &Subject) -> Result<(), AuthError> {
        let value = self.issuer.new_ephemeral_token()?;
        self.store
            .issue_token(NewToken {
                user_id: subject.id,
                purpose: TokenPurpose::ResetPassword,
                value: value.clone(),
                created_at: self.clock.now(),
            })
            .await?;

        let message = OutboundEmail::password_reset(
            &subject.email,
            email::reset_link(&self.settings.base_url, &value),
            self.settings.tokens.reset_ttl,
        )?;
        email::deliver(&self.mailer, message, self.settings.email_timeout).await?;

        tracing::info!(user_id = %subject.id, "Password reset email sent");
        Ok(())
    }

    /// Look a reset token up and check it is still redeemable.
    async fn redeemable(&self, value: &TokenValue) -> Result<EphemeralToken, AuthError> {
        let token = self
            .store
            .token_by_value(value)
            .await?
            .filter(|t| t.purpose == TokenPurpose::ResetPassword)
            .ok_or(AuthError::TokenNotFound)?;

        reject_resolved(&token)?;
        if token.is_expired(self.clock.now(), self.settings.tokens.reset_ttl) {
            return Err(AuthError::TokenExpired);
        }
        Ok(token)
    }

    /// Check a reset token without consuming it.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::TokenNotFound`, `AuthError::TokenExpired` or
    /// `AuthError::TokenUsed`.
    pub async fn validate(&self, raw: &str) -> Result<(), AuthError> {
        let value = TokenValue::parse(raw).map_err(|_| AuthError::TokenNotFound)?;
        self.redeemable(&value).await.map(|_| ())
    }

    /// Redeem a reset token and set a new password.
    ///
    /// # Errors
    ///
    /// Validation errors for a weak password; otherwise the same rejections
    /// as [`Self::validate`]. A second call with the same token always
    /// fails with `AuthError::TokenUsed`.
    pub async fn reset(&self, raw: &str, new_password: &str) -> Result<(), AuthError> {
        let value = TokenValue::parse(raw).map_err(|_| AuthError::TokenNotFound)?;
        validate_password(new_password, &self.settings.registration)?;

        let token = self.redeemable(&value).await?;
        let hash = hash_password(new_password)?;

        if !self
            .store
            .consume_reset(token.id, token.user_id, &hash)
            .await?
        {
            let current = self
                .store
                .token_by_value(&value)
                .await?
                .ok_or(AuthError::TokenNotFound)?;
            reject_resolved(&current)?;
            return Err(AuthError::TokenUsed);
        }

        tracing::info!(user_id = %token.user_id, "Password reset");
        Ok(())
    }
}

fn reject_resolved(token: &EphemeralToken) -> Result<(), AuthError> {
    use vdiamond_core::TokenStatus;

    match token.status {
        TokenStatus::Unconfirmed => Ok(()),
        TokenStatus::Used | TokenStatus::Confirmed => Err(AuthError::TokenUsed),
        TokenStatus::Expired => Err(AuthError::TokenExpired),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeDelta, TimeZone, Utc};
    use vdiamond_core::SubjectStatus;

    use super::*;
    use crate::config::{DeploymentMode, ServerConfig};
    use crate::db::SubjectStore;
    use crate::db::memory::MemoryStore;
    use crate::models::NewSubject;
    use crate::services::auth::verify_password;
    use crate::services::clock::ManualClock;
    use crate::services::email::{EmailKind, RecordingMailer};

    struct Harness {
        flow: ResetFlow<MemoryStore, RecordingMailer>,
        store: MemoryStore,
        mailer: RecordingMailer,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let config = ServerConfig::for_testing(DeploymentMode::Production);
        let store = MemoryStore::new();
        let mailer = RecordingMailer::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let flow = ResetFlow::new(
            store.clone(),
            mailer.clone(),
            TokenIssuer::new(&config.session, dyn_clock.clone()),
            dyn_clock,
            FlowSettings {
                mode: config.mode,
                base_url: config.base_url.clone(),
                tokens: config.tokens,
                registration: config.registration.clone(),
                email_timeout: config.timeouts.email,
            },
        );
        Harness {
            flow,
            store,
            mailer,
            clock,
        }
    }

    async fn seed(store: &MemoryStore, status: SubjectStatus) -> Subject {
        store
            .create_subject(NewSubject {
                email: Email::parse("ada@example.com").unwrap(),
                name: "Ada".to_string(),
                picture: None,
                password_hash: Some(hash_password("secret1").unwrap()),
                external_id: None,
                status,
            })
            .await
            .unwrap()
    }

    fn ada() -> Email {
        Email::parse("ada@example.com").unwrap()
    }

    #[tokio::test]
    async fn test_forgot_is_generic() {
        let h = harness();
        seed(&h.store, SubjectStatus::Active).await;

        h.flow.forgot("ada@example.com").await.unwrap();
        h.flow.forgot("nobody@example.com").await.unwrap();

        assert_eq!(h.mailer.sent().len(), 1);
        assert!(h.mailer.last_token(&ada(), EmailKind::PasswordReset).is_some());
    }

    #[tokio::test]
    async fn test_forgot_tolerates_mail_failure() {
        let h = harness();
        seed(&h.store, SubjectStatus::Active).await;
        h.mailer.set_failing(true);

        h.flow.forgot("ada@example.com").await.unwrap();
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_forgot_skips_pending_subjects() {
        let h = harness();
        seed(&h.store, SubjectStatus::Pending).await;

        h.flow.forgot("ada@example.com").await.unwrap();
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_validate_is_read_only() {
        let h = harness();
        seed(&h.store, SubjectStatus::Active).await;
        h.flow.forgot("ada@example.com").await.unwrap();
        let token = h.mailer.last_token(&ada(), EmailKind::PasswordReset).unwrap();

        h.flow.validate(token.expose()).await.unwrap();
        h.flow.validate(token.expose()).await.unwrap();
        h.flow.reset(token.expose(), "newpass1").await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_is_single_use() {
        let h = harness();
        let subject = seed(&h.store, SubjectStatus::Active).await;
        h.flow.forgot("ada@example.com").await.unwrap();
        let token = h.mailer.last_token(&ada(), EmailKind::PasswordReset).unwrap();

        h.flow.reset(token.expose(), "newpass1").await.unwrap();
        assert!(matches!(
            h.flow.reset(token.expose(), "newpass2").await,
            Err(AuthError::TokenUsed)
        ));
        assert!(matches!(
            h.flow.validate(token.expose()).await,
            Err(AuthError::TokenUsed)
        ));

        let stored = h.store.subject_by_id(subject.id).await.unwrap().unwrap();
        assert!(verify_password("newpass1", stored.password_hash.as_deref().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_reset_token_expires_after_thirty_minutes() {
        let h = harness();
        seed(&h.store, SubjectStatus::Active).await;
        h.flow.forgot("ada@example.com").await.unwrap();
        let token = h.mailer.last_token(&ada(), EmailKind::PasswordReset).unwrap();

        h.clock.advance(TimeDelta::minutes(29));
        h.flow.validate(token.expose()).await.unwrap();

        h.clock.advance(TimeDelta::minutes(2));
        assert!(matches!(
            h.flow.reset(token.expose(), "newpass1").await,
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_new_request_supersedes_old_token() {
        let h = harness();
        seed(&h.store, SubjectStatus::Active).await;
        h.flow.forgot("ada@example.com").await.unwrap();
        let first = h.mailer.last_token(&ada(), EmailKind::PasswordReset).unwrap();
        h.flow.forgot("ada@example.com").await.unwrap();
        let second = h.mailer.last_token(&ada(), EmailKind::PasswordReset).unwrap();

        assert!(matches!(
            h.flow.validate(first.expose()).await,
            Err(AuthError::TokenExpired)
        ));
        h.flow.validate(second.expose()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_rejects_weak_password_without_consuming() {
        let h = harness();
        seed(&h.store, SubjectStatus::Active).await;
        h.flow.forgot("ada@example.com").await.unwrap();
        let token = h.mailer.last_token(&ada(), EmailKind::PasswordReset).unwrap();

        assert!(matches!(
            h.flow.reset(token.expose(), "123").await,
            Err(AuthError::PasswordTooShort { .. })
        ));
        h.flow.validate(token.expose()).await.unwrap();
    }

    #[tokio::test]
    async fn test_confirmation_token_is_not_a_reset_token() {
        let h = harness();
        let subject = seed(&h.store, SubjectStatus::Pending).await;
        let value = TokenValue::parse(&"a".repeat(64)).unwrap();
        crate::db::CredentialStore::issue_token(
            &h.store,
            NewToken {
                user_id: subject.id,
                purpose: TokenPurpose::ConfirmRegistration,
                value: value.clone(),
                created_at: h.clock.now(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            h.flow.validate(value.expose()).await,
            Err(AuthError::TokenNotFound)
        ));
    }
}
