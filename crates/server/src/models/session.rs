//! Session-related types.

use serde::{Deserialize, Serialize};

use vdiamond_core::{Email, Role, UserId};

use super::Subject;

/// The authenticated caller, as resolved by the session guard.
///
/// This is the only identity representation handlers ever see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentSubject {
    /// Subject's database ID.
    pub id: UserId,
    /// Subject's email address.
    pub email: Email,
    /// Display name.
    pub name: String,
    /// Role at the time of the request (read from the store, not the token).
    pub role: Role,
}

impl CurrentSubject {
    /// Whether the caller may use administrative operations.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

impl From<&Subject> for CurrentSubject {
    fn from(subject: &Subject) -> Self {
        Self {
            id: subject.id,
            email: subject.email.clone(),
            name: subject.name.clone(),
            role: subject.role,
        }
    }
}

/// Claims carried by a signed session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject ID.
    pub sub: UserId,
    /// Subject email at issuance.
    pub email: String,
    /// Role at issuance. Informational; the guard re-reads the live role.
    pub role: Role,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Absolute expiry, seconds since the epoch.
    pub exp: i64,
}
