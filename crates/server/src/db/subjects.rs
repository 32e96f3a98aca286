//! Subject repository for database operations.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use vdiamond_core::{Email, Role, SubjectStatus, UserId};

use super::{RepositoryError, conflict_on_unique};
use crate::models::{NewSubject, Subject};

/// Row shape of `subjects`.
#[derive(sqlx::FromRow)]
pub(super) struct SubjectRow {
    id: UserId,
    email: String,
    name: String,
    picture: Option<String>,
    password_hash: Option<String>,
    external_id: Option<String>,
    status: SubjectStatus,
    role: Role,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubjectRow> for Subject {
    type Error = RepositoryError;

    fn try_from(row: SubjectRow) -> Result<Self, Self::Error> {
        let email = Email::parse(&row.email).map_err(|e| {
            RepositoryError::DataCorruption(format!("invalid email in database: {e}"))
        })?;

        Ok(Self {
            id: row.id,
            email,
            name: row.name,
            picture: row.picture,
            password_hash: row.password_hash,
            external_id: row.external_id,
            status: row.status,
            role: row.role,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Insert a subject on an existing connection (plain or transactional).
pub(super) async fn insert(
    conn: &mut PgConnection,
    new: &NewSubject,
) -> Result<Subject, RepositoryError> {
    let row = sqlx::query_as::<_, SubjectRow>(
        r"
        INSERT INTO subjects (email, name, picture, password_hash, external_id, status)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, email, name, picture, password_hash, external_id,
                  status, role, created_at, updated_at
        ",
    )
    .bind(&new.email)
    .bind(&new.name)
    .bind(new.picture.as_deref())
    .bind(new.password_hash.as_deref())
    .bind(new.external_id.as_deref())
    .bind(new.status)
    .fetch_one(conn)
    .await
    .map_err(|e| conflict_on_unique(e, "email or external identity already exists"))?;

    Subject::try_from(row)
}

/// Repository for subject database operations.
pub struct SubjectRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> SubjectRepository<'a> {
    /// Create a new subject repository.
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Create a subject.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Conflict` if the email or external id exists.
    pub async fn create(&self, new: &NewSubject) -> Result<Subject, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, new).await
    }

    /// Get a subject by ID.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get_by_id(&self, id: UserId) -> Result<Option<Subject>, RepositoryError> {
        sqlx::query_as::<_, SubjectRow>(
            r"
            SELECT id, email, name, picture, password_hash, external_id,
                   status, role, created_at, updated_at
            FROM subjects
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?
        .map(Subject::try_from)
        .transpose()
    }

    /// Get a subject by (normalized) email.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get_by_email(&self, email: &Email) -> Result<Option<Subject>, RepositoryError> {
        sqlx::query_as::<_, SubjectRow>(
            r"
            SELECT id, email, name, picture, password_hash, external_id,
                   status, role, created_at, updated_at
            FROM subjects
            WHERE email = $1
            ",
        )
        .bind(email)
        .fetch_optional(self.pool)
        .await?
        .map(Subject::try_from)
        .transpose()
    }

    /// Get a subject by federated identity.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Subject>, RepositoryError> {
        sqlx::query_as::<_, SubjectRow>(
            r"
            SELECT id, email, name, picture, password_hash, external_id,
                   status, role, created_at, updated_at
            FROM subjects
            WHERE external_id = $1
            ",
        )
        .bind(external_id)
        .fetch_optional(self.pool)
        .await?
        .map(Subject::try_from)
        .transpose()
    }

    /// Write back name, picture, external id, status and role.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NotFound` if the subject does not exist.
    /// Returns `RepositoryError::Conflict` if the external id is taken.
    pub async fn update(&self, subject: &Subject) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE subjects
            SET name = $2, picture = $3, external_id = $4, status = $5, role = $6,
                updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(subject.id)
        .bind(&subject.name)
        .bind(subject.picture.as_deref())
        .bind(subject.external_id.as_deref())
        .bind(subject.status)
        .bind(subject.role)
        .execute(self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "external identity already linked"))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    /// Replace the password hash.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NotFound` if the subject does not exist.
    pub async fn update_password(
        &self,
        id: UserId,
        password_hash: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE subjects SET password_hash = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(password_hash)
        .execute(self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    /// Set a subject's role by email. Used by the CLI.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NotFound` if no subject has that email.
    pub async fn set_role_by_email(&self, email: &Email, role: Role) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE subjects SET role = $2, updated_at = now() WHERE email = $1")
                .bind(email)
                .bind(role)
                .execute(self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    /// List all subjects, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn list(&self) -> Result<Vec<Subject>, RepositoryError> {
        sqlx::query_as::<_, SubjectRow>(
            r"
            SELECT id, email, name, picture, password_hash, external_id,
                   status, role, created_at, updated_at
            FROM subjects
            ORDER BY id
            ",
        )
        .fetch_all(self.pool)
        .await?
        .into_iter()
        .map(Subject::try_from)
        .collect()
    }

    /// Count subjects.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn count(&self) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subjects")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }
}
