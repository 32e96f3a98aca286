//! Ephemeral token repository.
//!
//! Confirmation, reset and reclamation are conditional updates guarded by the
//! token's expected prior status, each inside one transaction with the
//! matching subject write. Whichever caller's guarded update matches a row
//! wins; every other caller sees zero rows affected.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use vdiamond_core::{TokenId, TokenPurpose, TokenStatus, TokenValue, UserId};

use super::{RepositoryError, conflict_on_unique, subjects};
use crate::models::{EphemeralToken, NewSubject, NewToken, Subject};

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: TokenId,
    user_id: UserId,
    purpose: TokenPurpose,
    value: TokenValue,
    status: TokenStatus,
    created_at: DateTime<Utc>,
}

impl From<TokenRow> for EphemeralToken {
    fn from(row: TokenRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            purpose: row.purpose,
            value: row.value,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

/// Expire outstanding tokens, then insert the new one.
async fn supersede_and_insert(
    conn: &mut PgConnection,
    new: &NewToken,
) -> Result<EphemeralToken, RepositoryError> {
    sqlx::query(
        r"
        UPDATE ephemeral_tokens
        SET status = 'expired'
        WHERE user_id = $1 AND purpose = $2 AND status = 'unconfirmed'
        ",
    )
    .bind(new.user_id)
    .bind(new.purpose)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query_as::<_, TokenRow>(
        r"
        INSERT INTO ephemeral_tokens (user_id, purpose, value, status, created_at)
        VALUES ($1, $2, $3, 'unconfirmed', $4)
        RETURNING id, user_id, purpose, value, status, created_at
        ",
    )
    .bind(new.user_id)
    .bind(new.purpose)
    .bind(&new.value)
    .bind(new.created_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| conflict_on_unique(e, "token already outstanding"))?;

    Ok(row.into())
}

/// Guarded status flip on an existing connection.
async fn flip(
    conn: &mut PgConnection,
    id: TokenId,
    from: TokenStatus,
    to: TokenStatus,
) -> Result<bool, RepositoryError> {
    let result =
        sqlx::query("UPDATE ephemeral_tokens SET status = $3 WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(from)
            .bind(to)
            .execute(conn)
            .await?;
    Ok(result.rows_affected() == 1)
}

/// Repository for ephemeral token database operations.
pub struct TokenRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> TokenRepository<'a> {
    /// Create a new token repository.
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Issue a token, expiring any unconfirmed token of the same purpose.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Conflict` if a concurrent issue won the race.
    pub async fn issue(&self, new: &NewToken) -> Result<EphemeralToken, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let token = supersede_and_insert(&mut tx, new).await?;
        tx.commit().await?;
        Ok(token)
    }

    /// Look a token up by its secret value.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get_by_value(
        &self,
        value: &TokenValue,
    ) -> Result<Option<EphemeralToken>, RepositoryError> {
        let row = sqlx::query_as::<_, TokenRow>(
            r"
            SELECT id, user_id, purpose, value, status, created_at
            FROM ephemeral_tokens
            WHERE value = $1
            ",
        )
        .bind(value)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Most recently created token of a purpose for a subject.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn latest(
        &self,
        user_id: UserId,
        purpose: TokenPurpose,
    ) -> Result<Option<EphemeralToken>, RepositoryError> {
        let row = sqlx::query_as::<_, TokenRow>(
            r"
            SELECT id, user_id, purpose, value, status, created_at
            FROM ephemeral_tokens
            WHERE user_id = $1 AND purpose = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            ",
        )
        .bind(user_id)
        .bind(purpose)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Guarded status transition.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the update fails.
    pub async fn transition(
        &self,
        id: TokenId,
        from: TokenStatus,
        to: TokenStatus,
    ) -> Result<bool, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        flip(&mut conn, id, from, to).await
    }

    /// Unconfirmed tokens of a purpose created before `cutoff`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn unconfirmed_before(
        &self,
        purpose: TokenPurpose,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EphemeralToken>, RepositoryError> {
        let rows = sqlx::query_as::<_, TokenRow>(
            r"
            SELECT id, user_id, purpose, value, status, created_at
            FROM ephemeral_tokens
            WHERE purpose = $1 AND status = 'unconfirmed' AND created_at < $2
            ORDER BY created_at
            ",
        )
        .bind(purpose)
        .bind(cutoff)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Create a pending subject and its confirmation token atomically.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Conflict` if the email is already registered.
    pub async fn register_pending(
        &self,
        subject: &NewSubject,
        value: &TokenValue,
        now: DateTime<Utc>,
    ) -> Result<(Subject, EphemeralToken), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let subject = subjects::insert(&mut tx, subject).await?;
        let token = supersede_and_insert(
            &mut tx,
            &NewToken {
                user_id: subject.id,
                purpose: TokenPurpose::ConfirmRegistration,
                value: value.clone(),
                created_at: now,
            },
        )
        .await?;

        tx.commit().await?;
        Ok((subject, token))
    }

    /// Confirm a registration: token `unconfirmed -> confirmed`, subject
    /// `pending -> active`.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if either update fails.
    pub async fn confirm_registration(
        &self,
        token: TokenId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        if !flip(&mut tx, token, TokenStatus::Unconfirmed, TokenStatus::Confirmed).await? {
            // Dropping the transaction rolls back
            return Ok(false);
        }

        sqlx::query(
            r"
            UPDATE subjects
            SET status = 'active', updated_at = now()
            WHERE id = $1 AND status = 'pending'
            ",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Redeem a reset token and store the new password hash.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NotFound` if the subject vanished.
    pub async fn consume_reset(
        &self,
        token: TokenId,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        if !flip(&mut tx, token, TokenStatus::Unconfirmed, TokenStatus::Used).await? {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE subjects SET password_hash = $2, updated_at = now() WHERE id = $1",
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Delete a never-confirmed subject together with its tokens and cart.
    ///
    /// The token row is locked first so a confirmation racing the sweep
    /// either commits before us (and we delete nothing) or waits and then
    /// finds no token.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if a statement fails.
    pub async fn reap_registration(
        &self,
        token: TokenId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<TokenId> = sqlx::query_scalar(
            r"
            SELECT id FROM ephemeral_tokens
            WHERE id = $1 AND user_id = $2 AND status = 'unconfirmed'
            FOR UPDATE
            ",
        )
        .bind(token)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if locked.is_none() {
            return Ok(false);
        }

        // Tokens and carts go with the subject via ON DELETE CASCADE
        let deleted = sqlx::query("DELETE FROM subjects WHERE id = $1 AND status = 'pending'")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }
}
