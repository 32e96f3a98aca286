//! Ephemeral token domain types.

use chrono::{DateTime, TimeDelta, Utc};

use vdiamond_core::{TokenId, TokenPurpose, TokenStatus, TokenValue, UserId};

/// A single-use, time-bounded grant.
#[derive(Debug, Clone)]
pub struct EphemeralToken {
    pub id: TokenId,
    /// Subject the grant acts on.
    pub user_id: UserId,
    pub purpose: TokenPurpose,
    /// Bearer secret. Looked up by exact match, never compared in code.
    pub value: TokenValue,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
}

impl EphemeralToken {
    /// Whether the token is past its TTL at `now`.
    ///
    /// A token is still honored at exactly `created_at + ttl`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now - self.created_at > ttl
    }
}

/// Fields for inserting a token.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub user_id: UserId,
    pub purpose: TokenPurpose,
    pub value: TokenValue,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn token_created_at(created_at: DateTime<Utc>) -> EphemeralToken {
        EphemeralToken {
            id: TokenId::new(1),
            user_id: UserId::new(1),
            purpose: TokenPurpose::ConfirmRegistration,
            value: TokenValue::parse(&"ab".repeat(32)).unwrap(),
            status: TokenStatus::Unconfirmed,
            created_at,
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let created = Utc::now();
        let token = token_created_at(created);
        let ttl = TimeDelta::minutes(5);

        assert!(!token.is_expired(created + TimeDelta::seconds(299), ttl));
        assert!(!token.is_expired(created + ttl, ttl));
        assert!(token.is_expired(created + TimeDelta::seconds(301), ttl));
    }
}
