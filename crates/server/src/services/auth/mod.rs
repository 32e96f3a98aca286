//! Authentication service.
//!
//! Password login, federated (Google) login, password change and profile
//! updates. Registration and reset have their own flows in
//! [`crate::services::registration`] and [`crate::services::reset`]; they
//! share the password helpers defined here.

mod error;

pub use error::AuthError;

use std::sync::LazyLock;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use vdiamond_core::{Email, Role, SubjectStatus, UserId};

use crate::config::RegistrationPolicy;
use crate::db::{RepositoryError, Store};
use crate::models::{NewSubject, Subject};
use crate::services::cart::CartLedger;
use crate::services::google::ExternalProfile;
use crate::services::tokens::TokenIssuer;

/// Stand-in hash verified when there is no stored hash, so a miss costs
/// the same argon2 work as a wrong password.
static DUMMY_HASH: LazyLock<Option<String>> =
    LazyLock::new(|| hash_password("vdiamond-dummy-password").ok());

/// A signed-in subject and its session token.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub token: String,
    pub subject: Subject,
}

/// Authentication service.
#[derive(Clone)]
pub struct AuthService<S> {
    store: S,
    issuer: TokenIssuer,
    policy: RegistrationPolicy,
    carts: CartLedger<S>,
}

impl<S: Store> AuthService<S> {
    /// Create a new authentication service.
    #[must_use]
    pub const fn new(
        store: S,
        issuer: TokenIssuer,
        policy: RegistrationPolicy,
        carts: CartLedger<S>,
    ) -> Self {
        Self {
            store,
            issuer,
            policy,
            carts,
        }
    }

    // =========================================================================
    // Password Authentication
    // =========================================================================

    /// Login with email and password.
    ///
    /// Unknown email and wrong password are indistinguishable. The
    /// unconfirmed-email rejection is only reported once the password has
    /// been verified.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidCredentials` if the email/password is wrong,
    /// `AuthError::EmailNotConfirmed` for a pending subject.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        let email = Email::parse(email)?;

        let Some(subject) = self.store.subject_by_email(&email).await? else {
            return Err(reject_without_hash(password));
        };

        // Federated-only subjects have no password to check
        let Some(hash) = subject.password_hash.as_deref() else {
            return Err(reject_without_hash(password));
        };
        verify_password(password, hash)?;

        if !subject.is_active() {
            return Err(AuthError::EmailNotConfirmed);
        }

        self.start_session(subject).await
    }

    /// Replace the password after checking the current one.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidCredentials` if `current` is wrong and a
    /// validation error if `new` breaks the password policy.
    pub async fn change_password(
        &self,
        id: UserId,
        current: &str,
        new: &str,
    ) -> Result<(), AuthError> {
        validate_password(new, &self.policy)?;

        let subject = self
            .store
            .subject_by_id(id)
            .await?
            .ok_or(AuthError::SubjectNotFound)?;
        let hash = subject
            .password_hash
            .as_deref()
            .ok_or(AuthError::InvalidCredentials)?;
        verify_password(current, hash)?;

        let new_hash = hash_password(new)?;
        self.store
            .update_password(id, &new_hash)
            .await
            .map_err(not_found_as_subject)?;

        tracing::info!(user_id = %id, "Password changed");
        Ok(())
    }

    // =========================================================================
    // Federated Authentication
    // =========================================================================

    /// Sign in with a verified identity from an external provider.
    ///
    /// Resolution order: the external id, then the email. An email that
    /// already belongs to a password account, or to a different external
    /// identity, is a conflict; otherwise a new active subject is created.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::EmailAlreadyExists` or `AuthError::IdentityMismatch`
    /// when the email is taken.
    pub async fn federated_login(
        &self,
        profile: ExternalProfile,
    ) -> Result<LoginOutcome, AuthError> {
        let email = Email::parse(&profile.email)?;

        let subject = if let Some(mut subject) = self
            .store
            .subject_by_external_id(&profile.external_id)
            .await?
        {
            if subject.name != profile.name || subject.picture != profile.picture {
                subject.name.clone_from(&profile.name);
                subject.picture.clone_from(&profile.picture);
                self.store
                    .update_subject(&subject)
                    .await
                    .map_err(not_found_as_subject)?;
            }
            subject
        } else if let Some(existing) = self.store.subject_by_email(&email).await? {
            return Err(match existing.external_id {
                None => AuthError::EmailAlreadyExists,
                Some(_) => AuthError::IdentityMismatch,
            });
        } else {
            let created = self
                .store
                .create_subject(NewSubject {
                    email,
                    name: profile.name,
                    picture: profile.picture,
                    password_hash: None,
                    external_id: Some(profile.external_id),
                    status: SubjectStatus::Active,
                })
                .await
                .map_err(|e| match e {
                    RepositoryError::Conflict(_) => AuthError::EmailAlreadyExists,
                    other => AuthError::Repository(other),
                })?;
            tracing::info!(user_id = %created.id, "Created federated subject");
            created
        };

        self.start_session(subject).await
    }

    async fn start_session(&self, subject: Subject) -> Result<LoginOutcome, AuthError> {
        let token = self.issuer.issue_session(&subject)?;
        self.carts.provision(subject.id).await;

        tracing::info!(user_id = %subject.id, "Signed in");
        Ok(LoginOutcome { token, subject })
    }

    // =========================================================================
    // Account
    // =========================================================================

    /// Update display fields. The email is immutable.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::MissingField` for a blank name.
    pub async fn update_profile(
        &self,
        id: UserId,
        name: &str,
        picture: Option<String>,
    ) -> Result<Subject, AuthError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::MissingField("name"));
        }

        let mut subject = self
            .store
            .subject_by_id(id)
            .await?
            .ok_or(AuthError::SubjectNotFound)?;
        name.clone_into(&mut subject.name);
        subject.picture = picture.filter(|p| !p.trim().is_empty());

        self.store
            .update_subject(&subject)
            .await
            .map_err(not_found_as_subject)?;
        Ok(subject)
    }

    /// Change a subject's role. Callers must have checked the admin role.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::SubjectNotFound` for an unknown id.
    pub async fn set_role(&self, id: UserId, role: Role) -> Result<Subject, AuthError> {
        let mut subject = self
            .store
            .subject_by_id(id)
            .await?
            .ok_or(AuthError::SubjectNotFound)?;

        if subject.role != role {
            subject.role = role;
            self.store
                .update_subject(&subject)
                .await
                .map_err(not_found_as_subject)?;
            tracing::info!(user_id = %id, role = %role, "Role changed");
        }
        Ok(subject)
    }
}

fn not_found_as_subject(err: RepositoryError) -> AuthError {
    match err {
        RepositoryError::NotFound => AuthError::SubjectNotFound,
        other => AuthError::Repository(other),
    }
}

// =============================================================================
// Password Helpers
// =============================================================================

/// Check a password against the length policy.
///
/// # Errors
///
/// Returns `AuthError::PasswordTooShort` or `AuthError::PasswordTooLong`.
pub fn validate_password(password: &str, policy: &RegistrationPolicy) -> Result<(), AuthError> {
    let len = password.chars().count();
    if len < policy.min_password_len {
        return Err(AuthError::PasswordTooShort {
            min: policy.min_password_len,
        });
    }
    if len > policy.max_password_len {
        return Err(AuthError::PasswordTooLong {
            max: policy.max_password_len,
        });
    }
    Ok(())
}

/// Hash a password using Argon2id.
///
/// Uses the crate's default parameters (19 MiB memory, 2 iterations), which
/// put a single hash in the tens of milliseconds.
///
/// # Errors
///
/// Returns `AuthError::PasswordHash` if hashing fails.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| AuthError::PasswordHash)
}

/// Verify a password against a hash.
///
/// # Errors
///
/// Returns `AuthError::InvalidCredentials` if the password doesn't match,
/// `AuthError::PasswordHash` if the stored hash is unreadable.
pub fn verify_password(password: &str, hash: &str) -> Result<(), AuthError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| AuthError::PasswordHash)?;

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| AuthError::InvalidCredentials)
}

/// Burn one verification against the stand-in hash and reject.
fn reject_without_hash(password: &str) -> AuthError {
    if let Some(hash) = DUMMY_HASH.as_deref() {
        let _ = verify_password(password, hash);
    }
    AuthError::InvalidCredentials
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{DeploymentMode, ServerConfig};
    use crate::db::SubjectStore;
    use crate::db::memory::MemoryStore;
    use crate::services::clock::SystemClock;

    fn service() -> (AuthService<MemoryStore>, MemoryStore) {
        let config = ServerConfig::for_testing(DeploymentMode::Production);
        let store = MemoryStore::new();
        let clock: Arc<dyn crate::services::clock::Clock> = Arc::new(SystemClock);
        let issuer = TokenIssuer::new(&config.session, clock.clone());
        let carts = CartLedger::new(store.clone(), clock);
        (
            AuthService::new(store.clone(), issuer, config.registration, carts),
            store,
        )
    }

    async fn seed(store: &MemoryStore, email: &str, password: &str, status: SubjectStatus) -> Subject {
        store
            .create_subject(NewSubject {
                email: Email::parse(email).unwrap(),
                name: "Ada".to_string(),
                picture: None,
                password_hash: Some(hash_password(password).unwrap()),
                external_id: None,
                status,
            })
            .await
            .unwrap()
    }

    fn profile(external_id: &str, email: &str) -> ExternalProfile {
        ExternalProfile {
            external_id: external_id.to_string(),
            email: email.to_string(),
            name: "Grace".to_string(),
            picture: Some("https://img.test/g.png".to_string()),
        }
    }

    #[test]
    fn test_hash_and_verify_password() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash).is_ok());
        assert!(matches!(
            verify_password("wrong", &hash),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_validate_password_bounds() {
        let policy = ServerConfig::for_testing(DeploymentMode::Production).registration;
        assert!(matches!(
            validate_password("12345", &policy),
            Err(AuthError::PasswordTooShort { min: 6 })
        ));
        assert!(validate_password("123456", &policy).is_ok());
        assert!(matches!(
            validate_password(&"x".repeat(129), &policy),
            Err(AuthError::PasswordTooLong { max: 128 })
        ));
    }

    #[tokio::test]
    async fn test_login_does_not_reveal_unknown_email() {
        let (auth, store) = service();
        seed(&store, "ada@example.com", "secret1", SubjectStatus::Active).await;

        let unknown = auth.login("nobody@example.com", "secret1").await.unwrap_err();
        let wrong = auth.login("ada@example.com", "secret2").await.unwrap_err();

        assert_eq!(unknown.code(), "INVALID_CREDENTIALS");
        assert_eq!(wrong.code(), "INVALID_CREDENTIALS");
        assert_eq!(unknown.public_message(), wrong.public_message());
    }

    #[test]
    fn test_dummy_hash_is_verifiable() {
        let hash = DUMMY_HASH.as_deref().unwrap();
        assert!(PasswordHash::new(hash).is_ok());
        assert!(matches!(
            verify_password("secret1", hash),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            reject_without_hash("secret1"),
            AuthError::InvalidCredentials
        ));
    }

    #[tokio::test]
    async fn test_login_without_stored_hash_is_invalid_credentials() {
        let (auth, store) = service();
        store
            .create_subject(NewSubject {
                email: Email::parse("fed@example.com").unwrap(),
                name: "Fed".to_string(),
                picture: None,
                password_hash: None,
                external_id: Some("google-123".to_string()),
                status: SubjectStatus::Active,
            })
            .await
            .unwrap();

        let federated = auth.login("fed@example.com", "secret1").await.unwrap_err();
        let unknown = auth.login("nobody@example.com", "secret1").await.unwrap_err();
        assert!(matches!(federated, AuthError::InvalidCredentials));
        assert!(matches!(unknown, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_login_requires_confirmed_email() {
        let (auth, store) = service();
        seed(&store, "ada@example.com", "secret1", SubjectStatus::Pending).await;

        assert!(matches!(
            auth.login("ada@example.com", "secret1").await,
            Err(AuthError::EmailNotConfirmed)
        ));
        // Wrong password on a pending subject still looks like bad credentials
        assert!(matches!(
            auth.login("ada@example.com", "nope-nope").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_login_provisions_cart() {
        let (auth, store) = service();
        let subject = seed(&store, "ada@example.com", "secret1", SubjectStatus::Active).await;

        let outcome = auth.login("ADA@example.com", "secret1").await.unwrap();
        assert_eq!(outcome.subject.id, subject.id);
        assert!(!outcome.token.is_empty());
        assert_eq!(store.open_cart_count(subject.id), 1);
    }

    #[tokio::test]
    async fn test_change_password() {
        let (auth, store) = service();
        let subject = seed(&store, "ada@example.com", "secret1", SubjectStatus::Active).await;

        assert!(matches!(
            auth.change_password(subject.id, "wrong-one", "secret2").await,
            Err(AuthError::InvalidCredentials)
        ));
        auth.change_password(subject.id, "secret1", "secret2")
            .await
            .unwrap();

        assert!(auth.login("ada@example.com", "secret1").await.is_err());
        assert!(auth.login("ada@example.com", "secret2").await.is_ok());
    }

    #[tokio::test]
    async fn test_federated_login_creates_then_reuses() {
        let (auth, store) = service();

        let first = auth
            .federated_login(profile("google-1", "grace@example.com"))
            .await
            .unwrap();
        assert!(first.subject.is_active());
        assert!(first.subject.password_hash.is_none());

        let mut renamed = profile("google-1", "grace@example.com");
        renamed.name = "Grace H".to_string();
        let second = auth.federated_login(renamed).await.unwrap();

        assert_eq!(first.subject.id, second.subject.id);
        let stored = store.subject_by_id(first.subject.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Grace H");
    }

    #[tokio::test]
    async fn test_federated_login_conflicts() {
        let (auth, store) = service();
        seed(&store, "ada@example.com", "secret1", SubjectStatus::Active).await;
        auth.federated_login(profile("google-1", "grace@example.com"))
            .await
            .unwrap();

        assert!(matches!(
            auth.federated_login(profile("google-2", "ada@example.com")).await,
            Err(AuthError::EmailAlreadyExists)
        ));
        assert!(matches!(
            auth.federated_login(profile("google-3", "grace@example.com")).await,
            Err(AuthError::IdentityMismatch)
        ));
    }

    #[tokio::test]
    async fn test_profile_and_role_updates() {
        let (auth, store) = service();
        let subject = seed(&store, "ada@example.com", "secret1", SubjectStatus::Active).await;

        assert!(matches!(
            auth.update_profile(subject.id, "  ", None).await,
            Err(AuthError::MissingField("name"))
        ));
        let updated = auth
            .update_profile(subject.id, " Ada L ", Some("https://img.test/a.png".into()))
            .await
            .unwrap();
        assert_eq!(updated.name, "Ada L");
        assert_eq!(updated.email.as_str(), "ada@example.com");

        let promoted = auth.set_role(subject.id, Role::Admin).await.unwrap();
        assert!(promoted.role.is_admin());
        assert!(matches!(
            auth.set_role(UserId::new(999), Role::Admin).await,
            Err(AuthError::SubjectNotFound)
        ));
    }
}
