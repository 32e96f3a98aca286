//! Subject (account) domain types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use vdiamond_core::{Email, Role, SubjectStatus, UserId};

/// An account.
///
/// One canonical shape for password and federated accounts alike. A
/// federated-only subject has no `password_hash`; a password-only subject
/// has no `external_id`.
#[derive(Clone)]
pub struct Subject {
    /// Unique subject ID.
    pub id: UserId,
    /// Login email, unique across subjects.
    pub email: Email,
    /// Display name.
    pub name: String,
    /// Avatar URL from the identity provider, if any.
    pub picture: Option<String>,
    /// PHC-format password hash.
    pub password_hash: Option<String>,
    /// Federated identity (Google `sub`), unique when present.
    pub external_id: Option<String>,
    /// Lifecycle status.
    pub status: SubjectStatus,
    /// Authorization role.
    pub role: Role,
    /// When the subject was created.
    pub created_at: DateTime<Utc>,
    /// When the subject was last updated.
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subject")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("name", &self.name)
            .field("picture", &self.picture)
            .field("password_hash", &self.password_hash.as_ref().map(|_| "[REDACTED]"))
            .field("external_id", &self.external_id)
            .field("status", &self.status)
            .field("role", &self.role)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl Subject {
    /// Whether the subject finished registration.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SubjectStatus::Active
    }

    /// Public view without credentials.
    #[must_use]
    pub fn summary(&self) -> SubjectSummary {
        SubjectSummary {
            id: self.id,
            email: self.email.clone(),
            name: self.name.clone(),
            picture: self.picture.clone(),
            status: self.status,
            role: self.role,
        }
    }
}

/// Fields for inserting a subject.
#[derive(Clone)]
pub struct NewSubject {
    pub email: Email,
    pub name: String,
    pub picture: Option<String>,
    pub password_hash: Option<String>,
    pub external_id: Option<String>,
    pub status: SubjectStatus,
}

impl std::fmt::Debug for NewSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewSubject")
            .field("email", &self.email)
            .field("name", &self.name)
            .field("external_id", &self.external_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// What callers get to see about a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectSummary {
    pub id: UserId,
    pub email: Email,
    pub name: String,
    pub picture: Option<String>,
    pub status: SubjectStatus,
    pub role: Role,
}
