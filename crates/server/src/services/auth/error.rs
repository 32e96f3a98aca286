//! Authentication error types.

use thiserror::Error;

use crate::db::RepositoryError;
use crate::error::{ErrorKind, repository_code, repository_kind};
use crate::services::email::MailError;
use crate::services::tokens::TokenError;

/// Errors from registration, confirmation, reset, login and account changes.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Invalid email format.
    #[error("invalid email: {0}")]
    InvalidEmail(#[from] vdiamond_core::EmailError),

    /// Email domain outside the configured allow-list.
    #[error("email domain not allowed")]
    EmailDomainNotAllowed,

    /// Password shorter than the policy minimum.
    #[error("password must be at least {min} characters")]
    PasswordTooShort { min: usize },

    /// Password longer than the policy maximum.
    #[error("password must be at most {max} characters")]
    PasswordTooLong { max: usize },

    /// A required field was empty.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// An account with this email already exists.
    #[error("an account with this email already exists")]
    EmailAlreadyExists,

    /// The email is linked to a different federated identity.
    #[error("this email is linked to a different sign-in account")]
    IdentityMismatch,

    /// Token unknown, malformed, or for another purpose.
    #[error("token not found")]
    TokenNotFound,

    /// Token outlived its TTL or was superseded.
    #[error("token expired")]
    TokenExpired,

    /// Confirmation token already redeemed.
    #[error("email already confirmed")]
    AlreadyConfirmed,

    /// Reset token already redeemed.
    #[error("token already used")]
    TokenUsed,

    /// Invalid credentials (wrong password or unknown email).
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Password is right but the email was never confirmed.
    #[error("email not confirmed")]
    EmailNotConfirmed,

    /// Subject vanished.
    #[error("subject not found")]
    SubjectNotFound,

    /// Session or ephemeral token issuance failed.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Outbound email failed.
    #[error("email delivery failed: {0}")]
    Mail(#[from] MailError),

    /// Repository/database error.
    #[error("database error: {0}")]
    Repository(#[from] RepositoryError),

    /// Password hashing error.
    #[error("password hashing error")]
    PasswordHash,
}

impl AuthError {
    /// Error class.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidEmail(_)
            | Self::EmailDomainNotAllowed
            | Self::PasswordTooShort { .. }
            | Self::PasswordTooLong { .. }
            | Self::MissingField(_) => ErrorKind::Validation,
            Self::EmailAlreadyExists
            | Self::IdentityMismatch
            | Self::AlreadyConfirmed
            | Self::TokenUsed => ErrorKind::Conflict,
            Self::TokenNotFound | Self::SubjectNotFound => ErrorKind::NotFound,
            Self::TokenExpired => ErrorKind::Expired,
            Self::InvalidCredentials => ErrorKind::Unauthorized,
            Self::EmailNotConfirmed => ErrorKind::Forbidden,
            Self::Token(TokenError::Entropy(_)) | Self::Mail(_) => ErrorKind::Transient,
            Self::Token(TokenError::Invalid | TokenError::Expired) => ErrorKind::Unauthorized,
            Self::Token(TokenError::Signing(_)) | Self::PasswordHash => ErrorKind::Internal,
            Self::Repository(err) => repository_kind(err),
        }
    }

    /// Machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidEmail(_) => "INVALID_EMAIL",
            Self::EmailDomainNotAllowed => "EMAIL_DOMAIN_NOT_ALLOWED",
            Self::PasswordTooShort { .. } => "PASSWORD_TOO_SHORT",
            Self::PasswordTooLong { .. } => "PASSWORD_TOO_LONG",
            Self::MissingField(_) => "MISSING_FIELD",
            Self::EmailAlreadyExists => "EMAIL_ALREADY_EXISTS",
            Self::IdentityMismatch => "IDENTITY_MISMATCH",
            Self::TokenNotFound => "TOKEN_NOT_FOUND",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::AlreadyConfirmed => "ALREADY_CONFIRMED",
            Self::TokenUsed => "TOKEN_USED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::EmailNotConfirmed => "EMAIL_NOT_CONFIRMED",
            Self::SubjectNotFound => "SUBJECT_NOT_FOUND",
            Self::Token(TokenError::Entropy(_)) => "ENTROPY_UNAVAILABLE",
            Self::Token(TokenError::Invalid | TokenError::Expired) => "AUTH_REQUIRED",
            Self::Token(TokenError::Signing(_)) | Self::PasswordHash => "INTERNAL_ERROR",
            Self::Mail(_) => "EMAIL_DELIVERY_FAILED",
            Self::Repository(err) => repository_code(err),
        }
    }

    /// Client-facing message for non-server errors.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidEmail(_) => "Invalid email address".to_string(),
            Self::InvalidCredentials => "Invalid email or password".to_string(),
            Self::EmailNotConfirmed => {
                "Please confirm your email address before signing in".to_string()
            }
            Self::TokenExpired => "This link has expired, please request a new one".to_string(),
            Self::EmailAlreadyExists => "An account with this email already exists".to_string(),
            other => {
                let mut message = other.to_string();
                if let Some(first) = message.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                message
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(
            AuthError::PasswordTooShort { min: 6 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(AuthError::AlreadyConfirmed.kind(), ErrorKind::Conflict);
        assert_eq!(AuthError::TokenExpired.kind(), ErrorKind::Expired);
        assert_eq!(AuthError::TokenNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            AuthError::Mail(MailError::Refused("down".into())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            AuthError::Repository(RepositoryError::Unavailable("slow".into())).kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_public_message_capitalises() {
        assert_eq!(
            AuthError::PasswordTooShort { min: 6 }.public_message(),
            "Password must be at least 6 characters"
        );
        assert_eq!(
            AuthError::InvalidCredentials.public_message(),
            "Invalid email or password"
        );
    }
}
