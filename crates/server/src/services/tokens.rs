//! Token issuance.
//!
//! Two kinds of tokens leave this module:
//!
//! - **Ephemeral tokens**: 256 random bits from the OS RNG, hex encoded. They
//!   carry no meaning of their own; the store row they are attached to does.
//! - **Session tokens**: HS256 JWTs naming the subject, valid for the
//!   configured TTL (24 hours by default).
//!
//! Session expiry is checked against the injected [`Clock`] rather than by
//! `jsonwebtoken`'s own wall-clock validation, so it can be tested.

use std::sync::Arc;

use chrono::TimeDelta;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::TryRngCore;
use rand::rngs::OsRng;
use secrecy::ExposeSecret;
use thiserror::Error;

use vdiamond_core::TokenValue;

use super::clock::Clock;
use crate::config::SessionConfig;
use crate::models::{SessionClaims, Subject};

/// Errors from token issuance and verification.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The OS random source failed.
    #[error("random source unavailable: {0}")]
    Entropy(String),

    /// Signing failed.
    #[error("failed to sign session: {0}")]
    Signing(jsonwebtoken::errors::Error),

    /// Signature, algorithm or shape is wrong.
    #[error("invalid session token")]
    Invalid,

    /// The session's expiry has passed.
    #[error("session expired")]
    Expired,
}

/// Issues ephemeral tokens and signs/verifies session tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Build an issuer from session configuration.
    #[must_use]
    pub fn new(config: &SessionConfig, clock: Arc<dyn Clock>) -> Self {
        let secret = config.secret.expose_secret().as_bytes();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl: config.ttl,
            clock,
        }
    }

    /// Session lifetime.
    #[must_use]
    pub const fn session_ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Generate a fresh ephemeral token.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Entropy` if the OS RNG cannot be read.
    pub fn new_ephemeral_token(&self) -> Result<TokenValue, TokenError> {
        let mut bytes = [0u8; TokenValue::BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| TokenError::Entropy(e.to_string()))?;

        TokenValue::parse(&hex::encode(bytes)).map_err(|e| TokenError::Entropy(e.to_string()))
    }

    /// Sign a session for `subject`, expiring `session_ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Signing` if encoding fails.
    pub fn issue_session(&self, subject: &Subject) -> Result<String, TokenError> {
        let now = self.clock.now();
        let claims = SessionClaims {
            sub: subject.id,
            email: subject.email.as_str().to_owned(),
            role: subject.role,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Signing)
    }

    /// Verify a session token's signature and expiry.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Invalid` for a bad signature or malformed token,
    /// `TokenError::Expired` once `exp` is reached.
    pub fn verify_session(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Session token rejected");
                TokenError::Invalid
            })?;

        if data.claims.exp <= self.clock.now().timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use vdiamond_core::{Email, Role, SubjectStatus, UserId};

    use super::*;
    use crate::config::{DeploymentMode, ServerConfig};
    use crate::services::clock::ManualClock;

    fn subject() -> Subject {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Subject {
            id: UserId::new(42),
            email: Email::parse("ada@example.com").unwrap(),
            name: "Ada".to_owned(),
            picture: None,
            password_hash: None,
            external_id: None,
            status: SubjectStatus::Active,
            role: Role::User,
            created_at: now,
            updated_at: now,
        }
    }

    fn issuer() -> (TokenIssuer, Arc<ManualClock>) {
        let config = ServerConfig::for_testing(DeploymentMode::Production);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        (TokenIssuer::new(&config.session, clock.clone()), clock)
    }

    #[test]
    fn test_ephemeral_tokens_are_long_and_distinct() {
        let (issuer, _) = issuer();
        let a = issuer.new_ephemeral_token().unwrap();
        let b = issuer.new_ephemeral_token().unwrap();

        assert_eq!(a.expose().len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_round_trip() {
        let (issuer, _) = issuer();
        let token = issuer.issue_session(&subject()).unwrap();

        let claims = issuer.verify_session(&token).unwrap();
        assert_eq!(claims.sub, UserId::new(42));
        assert_eq!(claims.email, "ada@example.com");
        assert_eq!(claims.exp - claims.iat, 24 * 60 * 60);
    }

    #[test]
    fn test_session_expires_after_ttl() {
        let (issuer, clock) = issuer();
        let token = issuer.issue_session(&subject()).unwrap();

        clock.advance(TimeDelta::hours(23) + TimeDelta::minutes(59));
        assert!(issuer.verify_session(&token).is_ok());

        clock.advance(TimeDelta::minutes(1));
        assert!(matches!(
            issuer.verify_session(&token),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn test_tampered_session_is_invalid() {
        let (issuer, _) = issuer();
        let token = issuer.issue_session(&subject()).unwrap();

        let mut tampered = token.clone();
        tampered.push('x');
        assert!(matches!(
            issuer.verify_session(&tampered),
            Err(TokenError::Invalid)
        ));
        assert!(matches!(
            issuer.verify_session("not-a-jwt"),
            Err(TokenError::Invalid)
        ));
    }

    #[test]
    fn test_session_signed_with_other_key_is_invalid() {
        let (issuer, _) = issuer();
        let token = issuer.issue_session(&subject()).unwrap();

        let mut config = ServerConfig::for_testing(DeploymentMode::Production);
        config.session.secret = secrecy::SecretString::from("Zk4!nQ8@wL2#pR6$vT9%xB3^mJ7&cH1*");
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let other = TokenIssuer::new(&config.session, clock);

        assert!(matches!(
            other.verify_session(&token),
            Err(TokenError::Invalid)
        ));
    }
}
