//! Lifecycle enums for subjects, tokens, carts and orders.
//!
//! Each enum maps to a Postgres enum type of the same snake_case name
//! (with the `postgres` feature) and to lowercase snake_case strings in JSON.

use serde::{Deserialize, Serialize};

/// Error returned when a string does not name a variant.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {input:?}")]
pub struct ParseStatusError {
    /// Name of the enum that failed to parse.
    pub kind: &'static str,
    /// The rejected input.
    pub input: String,
}

macro_rules! labelled_enum {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            /// The database and wire label for this variant.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::core::str::FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($label => Ok(Self::$variant),)+
                    other => Err(ParseStatusError {
                        kind: stringify!($name),
                        input: other.to_owned(),
                    }),
                }
            }
        }
    };
}

/// Account lifecycle.
///
/// Subjects created by password registration start `Pending` and become
/// `Active` once their email is confirmed. Federated sign-ups start `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "subject_status", rename_all = "snake_case")
)]
pub enum SubjectStatus {
    #[default]
    Pending,
    Active,
}

labelled_enum!(SubjectStatus {
    Pending => "pending",
    Active => "active",
});

/// Authorization role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "subject_role", rename_all = "snake_case")
)]
pub enum Role {
    #[default]
    User,
    Admin,
}

labelled_enum!(Role {
    User => "user",
    Admin => "admin",
});

impl Role {
    /// Whether this role may call administrative operations.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// What an ephemeral token grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "token_purpose", rename_all = "snake_case")
)]
pub enum TokenPurpose {
    ConfirmRegistration,
    ResetPassword,
}

labelled_enum!(TokenPurpose {
    ConfirmRegistration => "confirm_registration",
    ResetPassword => "reset_password",
});

/// Ephemeral token state.
///
/// Only `Unconfirmed` tokens are actionable. Every other state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "token_status", rename_all = "snake_case")
)]
pub enum TokenStatus {
    #[default]
    Unconfirmed,
    Confirmed,
    Used,
    Expired,
}

labelled_enum!(TokenStatus {
    Unconfirmed => "unconfirmed",
    Confirmed => "confirmed",
    Used => "used",
    Expired => "expired",
});

impl TokenStatus {
    /// Whether the token has already been acted on or revoked.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        !matches!(self, Self::Unconfirmed)
    }
}

/// Cart lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "cart_status", rename_all = "snake_case")
)]
pub enum CartStatus {
    #[default]
    Open,
    Closed,
}

labelled_enum!(CartStatus {
    Open => "open",
    Closed => "closed",
});

/// Fulfilment label carried by a closed cart.
///
/// Labels are free to move in any direction; they have no inventory effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "order_status", rename_all = "snake_case")
)]
pub enum OrderStatus {
    #[default]
    Placed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

labelled_enum!(OrderStatus {
    Placed => "placed",
    Processing => "processing",
    Shipped => "shipped",
    Delivered => "delivered",
    Cancelled => "cancelled",
});

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_match_serde() {
        let json = serde_json::to_string(&TokenPurpose::ConfirmRegistration).unwrap();
        assert_eq!(json, format!("\"{}\"", TokenPurpose::ConfirmRegistration));

        let json = serde_json::to_string(&OrderStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn test_from_str() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(" shipped ".parse::<OrderStatus>().unwrap(), OrderStatus::Shipped);

        let err = "root".parse::<Role>().unwrap_err();
        assert_eq!(err.kind, "Role");
    }

    #[test]
    fn test_token_status_resolution() {
        assert!(!TokenStatus::Unconfirmed.is_resolved());
        assert!(TokenStatus::Confirmed.is_resolved());
        assert!(TokenStatus::Used.is_resolved());
        assert!(TokenStatus::Expired.is_resolved());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(SubjectStatus::default(), SubjectStatus::Pending);
        assert_eq!(Role::default(), Role::User);
        assert_eq!(CartStatus::default(), CartStatus::Open);
        assert!(!Role::User.is_admin());
    }
}
