//! Persistence for subjects, tokens, carts and the product catalog.
//!
//! # Database: `vdiamond`
//!
//! ## Tables
//!
//! - `subjects` - Accounts (password and federated)
//! - `ephemeral_tokens` - Confirmation and reset grants
//! - `products` - Catalog (read-only from this service)
//! - `carts` - Open baskets and closed orders
//! - `cart_items` - Lines, unique per (cart, product)
//!
//! # Store traits
//!
//! Services depend on the traits below rather than on `PgPool`, so the same
//! flows run against [`PgStore`] in production and [`memory::MemoryStore`]
//! in tests. Every state transition that must happen exactly once is a
//! single trait method, and each implementation makes that method atomic.
//!
//! # Migrations
//!
//! Migrations are stored in `crates/server/migrations/` and run via:
//! ```bash
//! cargo run -p vdiamond-cli -- migrate
//! ```

pub mod carts;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod products;
pub mod subjects;
pub mod tokens;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use vdiamond_core::{
    CartId, CartItemId, Email, OrderStatus, ProductId, TokenId, TokenPurpose, TokenStatus,
    TokenValue, UserId,
};

use crate::models::{
    Cart, CartItem, CartLine, EphemeralToken, NewSubject, NewToken, Product, Subject,
};

pub use carts::CartRepository;
pub use products::ProductRepository;
pub use subjects::SubjectRepository;
pub use tokens::TokenRepository;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., unique email).
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// The store could not be reached in time. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Whether the caller may retry the same operation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            }
            other => Self::Database(other),
        }
    }
}

/// Map a unique violation to `Conflict`, everything else through `From`.
pub(crate) fn conflict_on_unique(err: sqlx::Error, what: &str) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.is_unique_violation()
    {
        return RepositoryError::Conflict(what.to_owned());
    }
    RepositoryError::from(err)
}

/// Run a store call under a deadline.
///
/// An elapsed deadline surfaces as [`RepositoryError::Unavailable`] so callers
/// can tell it apart from a business-rule rejection.
///
/// # Errors
///
/// Returns the inner error, or `Unavailable` when `limit` elapses first.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, RepositoryError>
where
    F: Future<Output = Result<T, RepositoryError>>,
{
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        RepositoryError::Unavailable(format!("store call exceeded {}ms", limit.as_millis()))
    })?
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

// =============================================================================
// Store traits
// =============================================================================

/// Subject persistence.
pub trait SubjectStore: Send + Sync {
    /// Insert a subject. `Conflict` when the email or external id is taken.
    fn create_subject(
        &self,
        new: NewSubject,
    ) -> impl Future<Output = Result<Subject, RepositoryError>> + Send;

    fn subject_by_id(
        &self,
        id: UserId,
    ) -> impl Future<Output = Result<Option<Subject>, RepositoryError>> + Send;

    fn subject_by_email(
        &self,
        email: &Email,
    ) -> impl Future<Output = Result<Option<Subject>, RepositoryError>> + Send;

    fn subject_by_external_id(
        &self,
        external_id: &str,
    ) -> impl Future<Output = Result<Option<Subject>, RepositoryError>> + Send;

    /// Write back every mutable column except the password. `NotFound` if gone.
    fn update_subject(
        &self,
        subject: &Subject,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the password hash. `NotFound` if gone.
    fn update_password(
        &self,
        id: UserId,
        password_hash: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// All subjects, oldest first.
    fn list_subjects(&self) -> impl Future<Output = Result<Vec<Subject>, RepositoryError>> + Send;

    fn count_subjects(&self) -> impl Future<Output = Result<i64, RepositoryError>> + Send;
}

/// Ephemeral token persistence, including the transitions that also touch
/// the owning subject.
pub trait CredentialStore: Send + Sync {
    /// Insert a token, first expiring any unconfirmed token the subject
    /// already holds for the same purpose.
    fn issue_token(
        &self,
        new: NewToken,
    ) -> impl Future<Output = Result<EphemeralToken, RepositoryError>> + Send;

    fn token_by_value(
        &self,
        value: &TokenValue,
    ) -> impl Future<Output = Result<Option<EphemeralToken>, RepositoryError>> + Send;

    fn latest_token(
        &self,
        user_id: UserId,
        purpose: TokenPurpose,
    ) -> impl Future<Output = Result<Option<EphemeralToken>, RepositoryError>> + Send;

    /// Move a token from `from` to `to`. Returns `false` if it was not in `from`.
    fn transition_token(
        &self,
        id: TokenId,
        from: TokenStatus,
        to: TokenStatus,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Unconfirmed tokens of `purpose` created strictly before `cutoff`.
    fn unconfirmed_before(
        &self,
        purpose: TokenPurpose,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<EphemeralToken>, RepositoryError>> + Send;

    /// Create a pending subject and its confirmation token in one unit.
    fn register_pending(
        &self,
        subject: NewSubject,
        value: TokenValue,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(Subject, EphemeralToken), RepositoryError>> + Send;

    /// Flip the token `unconfirmed -> confirmed` and the subject
    /// `pending -> active` together. Returns `false` if the token had
    /// already left `unconfirmed`.
    fn confirm_registration(
        &self,
        token: TokenId,
        user_id: UserId,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Flip the token `unconfirmed -> used` and store the new password hash
    /// together. Returns `false` if the token had already left `unconfirmed`.
    fn consume_reset(
        &self,
        token: TokenId,
        user_id: UserId,
        password_hash: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Hard-delete a never-confirmed registration: the subject, its tokens
    /// and its cart. Only acts while the subject is `pending` and the token
    /// is still `unconfirmed`; returns whether anything was removed.
    fn reap_registration(
        &self,
        token: TokenId,
        user_id: UserId,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;
}

/// Cart and order persistence.
pub trait CartStore: Send + Sync {
    fn open_cart(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<Cart>, RepositoryError>> + Send;

    /// Insert an open cart. `Conflict` if the subject already has one.
    fn create_open_cart(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Cart, RepositoryError>> + Send;

    fn cart_by_id(
        &self,
        id: CartId,
    ) -> impl Future<Output = Result<Option<Cart>, RepositoryError>> + Send;

    /// `open -> closed`, stamping `placed`. Returns `false` if not open.
    fn close_cart(
        &self,
        id: CartId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Relabel a closed cart. Returns `false` if the cart is missing or open.
    fn set_order_status(
        &self,
        id: CartId,
        status: OrderStatus,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Lines joined with their products, in insertion order.
    fn cart_lines(
        &self,
        id: CartId,
    ) -> impl Future<Output = Result<Vec<CartLine>, RepositoryError>> + Send;

    fn cart_item(
        &self,
        id: CartItemId,
    ) -> impl Future<Output = Result<Option<CartItem>, RepositoryError>> + Send;

    /// Add `quantity` of a product, merging into an existing line.
    /// Returns `None` if the cart is missing or no longer open.
    fn add_item(
        &self,
        cart: CartId,
        product: ProductId,
        quantity: i32,
    ) -> impl Future<Output = Result<Option<CartItem>, RepositoryError>> + Send;

    /// Returns `false` if the item does not exist or its cart is closed.
    fn set_item_quantity(
        &self,
        id: CartItemId,
        quantity: i32,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Returns `false` if the item did not exist or its cart is closed.
    fn remove_item(
        &self,
        id: CartItemId,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Remove every line of an open cart. Returns the number removed.
    fn clear_cart(&self, id: CartId) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Closed carts, newest first, optionally for one subject.
    fn closed_carts(
        &self,
        user_id: Option<UserId>,
    ) -> impl Future<Output = Result<Vec<Cart>, RepositoryError>> + Send;

    fn count_closed(&self) -> impl Future<Output = Result<i64, RepositoryError>> + Send;
}

/// Read-only product lookups.
pub trait ProductCatalog: Send + Sync {
    fn product_by_id(
        &self,
        id: ProductId,
    ) -> impl Future<Output = Result<Option<Product>, RepositoryError>> + Send;

    fn count_products(&self) -> impl Future<Output = Result<i64, RepositoryError>> + Send;
}

/// Everything the services need from persistence.
pub trait Store:
    SubjectStore + CredentialStore + CartStore + ProductCatalog + Clone + 'static
{
    /// Cheap round trip used by the readiness probe.
    fn ping(&self) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

// =============================================================================
// PostgreSQL store
// =============================================================================

/// [`Store`] backed by `PostgreSQL`.
///
/// Every call runs under the configured per-call deadline.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    /// Wrap a pool.
    #[must_use]
    pub const fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, RepositoryError>
    where
        F: Future<Output = Result<T, RepositoryError>>,
    {
        bounded(self.timeout, fut).await
    }
}

impl SubjectStore for PgStore {
    async fn create_subject(&self, new: NewSubject) -> Result<Subject, RepositoryError> {
        self.bounded(SubjectRepository::new(&self.pool).create(&new))
            .await
    }

    async fn subject_by_id(&self, id: UserId) -> Result<Option<Subject>, RepositoryError> {
        self.bounded(SubjectRepository::new(&self.pool).get_by_id(id))
            .await
    }

    async fn subject_by_email(&self, email: &Email) -> Result<Option<Subject>, RepositoryError> {
        self.bounded(SubjectRepository::new(&self.pool).get_by_email(email))
            .await
    }

    async fn subject_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Subject>, RepositoryError> {
        self.bounded(SubjectRepository::new(&self.pool).get_by_external_id(external_id))
            .await
    }

    async fn update_subject(&self, subject: &Subject) -> Result<(), RepositoryError> {
        self.bounded(SubjectRepository::new(&self.pool).update(subject))
            .await
    }

    async fn update_password(
        &self,
        id: UserId,
        password_hash: &str,
    ) -> Result<(), RepositoryError> {
        self.bounded(SubjectRepository::new(&self.pool).update_password(id, password_hash))
            .await
    }

    async fn list_subjects(&self) -> Result<Vec<Subject>, RepositoryError> {
        self.bounded(SubjectRepository::new(&self.pool).list())
            .await
    }

    async fn count_subjects(&self) -> Result<i64, RepositoryError> {
        self.bounded(SubjectRepository::new(&self.pool).count())
            .await
    }
}

impl CredentialStore for PgStore {
    async fn issue_token(&self, new: NewToken) -> Result<EphemeralToken, RepositoryError> {
        self.bounded(TokenRepository::new(&self.pool).issue(&new))
            .await
    }

    async fn token_by_value(
        &self,
        value: &TokenValue,
    ) -> Result<Option<EphemeralToken>, RepositoryError> {
        self.bounded(TokenRepository::new(&self.pool).get_by_value(value))
            .await
    }

    async fn latest_token(
        &self,
        user_id: UserId,
        purpose: TokenPurpose,
    ) -> Result<Option<EphemeralToken>, RepositoryError> {
        self.bounded(TokenRepository::new(&self.pool).latest(user_id, purpose))
            .await
    }

    async fn transition_token(
        &self,
        id: TokenId,
        from: TokenStatus,
        to: TokenStatus,
    ) -> Result<bool, RepositoryError> {
        self.bounded(TokenRepository::new(&self.pool).transition(id, from, to))
            .await
    }

    async fn unconfirmed_before(
        &self,
        purpose: TokenPurpose,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EphemeralToken>, RepositoryError> {
        self.bounded(TokenRepository::new(&self.pool).unconfirmed_before(purpose, cutoff))
            .await
    }

    async fn register_pending(
        &self,
        subject: NewSubject,
        value: TokenValue,
        now: DateTime<Utc>,
    ) -> Result<(Subject, EphemeralToken), RepositoryError> {
        self.bounded(TokenRepository::new(&self.pool).register_pending(&subject, &value, now))
            .await
    }

    async fn confirm_registration(
        &self,
        token: TokenId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        self.bounded(TokenRepository::new(&self.pool).confirm_registration(token, user_id))
            .await
    }

    async fn consume_reset(
        &self,
        token: TokenId,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<bool, RepositoryError> {
        self.bounded(TokenRepository::new(&self.pool).consume_reset(token, user_id, password_hash))
            .await
    }

    async fn reap_registration(
        &self,
        token: TokenId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        self.bounded(TokenRepository::new(&self.pool).reap_registration(token, user_id))
            .await
    }
}

impl CartStore for PgStore {
    async fn open_cart(&self, user_id: UserId) -> Result<Option<Cart>, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).get_open(user_id))
            .await
    }

    async fn create_open_cart(&self, user_id: UserId) -> Result<Cart, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).create_open(user_id))
            .await
    }

    async fn cart_by_id(&self, id: CartId) -> Result<Option<Cart>, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).get_by_id(id))
            .await
    }

    async fn close_cart(&self, id: CartId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).close(id, now))
            .await
    }

    async fn set_order_status(
        &self,
        id: CartId,
        status: OrderStatus,
    ) -> Result<bool, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).set_order_status(id, status))
            .await
    }

    async fn cart_lines(&self, id: CartId) -> Result<Vec<CartLine>, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).lines(id))
            .await
    }

    async fn cart_item(&self, id: CartItemId) -> Result<Option<CartItem>, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).get_item(id))
            .await
    }

    async fn add_item(
        &self,
        cart: CartId,
        product: ProductId,
        quantity: i32,
    ) -> Result<Option<CartItem>, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).add_item(cart, product, quantity))
            .await
    }

    async fn set_item_quantity(
        &self,
        id: CartItemId,
        quantity: i32,
    ) -> Result<bool, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).set_item_quantity(id, quantity))
            .await
    }

    async fn remove_item(&self, id: CartItemId) -> Result<bool, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).remove_item(id))
            .await
    }

    async fn clear_cart(&self, id: CartId) -> Result<u64, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).clear(id))
            .await
    }

    async fn closed_carts(&self, user_id: Option<UserId>) -> Result<Vec<Cart>, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).list_closed(user_id))
            .await
    }

    async fn count_closed(&self) -> Result<i64, RepositoryError> {
        self.bounded(CartRepository::new(&self.pool).count_closed())
            .await
    }
}

impl ProductCatalog for PgStore {
    async fn product_by_id(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        self.bounded(ProductRepository::new(&self.pool).get_by_id(id))
            .await
    }

    async fn count_products(&self) -> Result<i64, RepositoryError> {
        self.bounded(ProductRepository::new(&self.pool).count())
            .await
    }
}

impl Store for PgStore {
    async fn ping(&self) -> Result<(), RepositoryError> {
        self.bounded(async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out_as_unavailable() {
        let result: Result<(), _> = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("50ms"));
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let value = bounded(Duration::from_secs(1), async { Ok::<_, RepositoryError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = bounded(Duration::from_secs(1), async {
            Err::<(), _>(RepositoryError::NotFound)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(RepositoryError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!RepositoryError::from(sqlx::Error::RowNotFound).is_transient());
    }
}
