//! Opaque bearer secret used by confirmation and reset links.

use core::fmt;

use serde::Deserialize;

/// Errors that can occur when parsing a [`TokenValue`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenValueError {
    /// Input length differs from [`TokenValue::HEX_LENGTH`].
    #[error("token must be {expected} hex characters")]
    Length {
        /// Required length.
        expected: usize,
    },
    /// Input contains characters outside `[0-9a-f]`.
    #[error("token must be lowercase hex")]
    NotHex,
}

/// A 256-bit random token, hex encoded.
///
/// The value is a bearer secret: `Debug` redacts it and there is no `Display`
/// or `Serialize`. Use [`TokenValue::expose`] when building a link.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct TokenValue(String);

impl TokenValue {
    /// Number of random bytes behind every token.
    pub const BYTES: usize = 32;

    /// Length of the hex encoding.
    pub const HEX_LENGTH: usize = Self::BYTES * 2;

    /// Parse a token received from a client.
    ///
    /// # Errors
    ///
    /// Returns an error unless the input is exactly 64 lowercase hex characters.
    pub fn parse(s: &str) -> Result<Self, TokenValueError> {
        let s = s.trim();
        if s.len() != Self::HEX_LENGTH {
            return Err(TokenValueError::Length {
                expected: Self::HEX_LENGTH,
            });
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(TokenValueError::NotHex);
        }
        Ok(Self(s.to_owned()))
    }

    /// The raw secret.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenValue([REDACTED])")
    }
}

impl TryFrom<String> for TokenValue {
    type Error = TokenValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

#[cfg(feature = "postgres")]
impl sqlx::Type<sqlx::Postgres> for TokenValue {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

#[cfg(feature = "postgres")]
impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TokenValue {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(Self::parse(&s)?)
    }
}

#[cfg(feature = "postgres")]
impl sqlx::Encode<'_, sqlx::Postgres> for TokenValue {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <String as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.0, buf)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_parse_accepts_hex() {
        let token = TokenValue::parse(SAMPLE).unwrap();
        assert_eq!(token.expose(), SAMPLE);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            TokenValue::parse("abc"),
            Err(TokenValueError::Length { expected: 64 })
        );
        assert_eq!(
            TokenValue::parse(&SAMPLE.to_uppercase()),
            Err(TokenValueError::NotHex)
        );
    }

    #[test]
    fn test_debug_redacts() {
        let token = TokenValue::parse(SAMPLE).unwrap();
        assert!(!format!("{token:?}").contains("0123"));
    }
}
