//! Cart repository.
//!
//! The partial unique index `carts_one_open_per_subject` guarantees at most
//! one open cart per subject; `create_open` surfaces a violation as
//! `Conflict` so the ledger can fetch the winner instead.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use vdiamond_core::{
    CartId, CartItemId, CartStatus, OrderStatus, Price, ProductId, UserId,
};

use super::{RepositoryError, conflict_on_unique};
use crate::models::{Cart, CartItem, CartLine};

#[derive(sqlx::FromRow)]
struct CartRow {
    id: CartId,
    user_id: UserId,
    status: CartStatus,
    order_status: Option<OrderStatus>,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl From<CartRow> for Cart {
    fn from(row: CartRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            status: row.status,
            order_status: row.order_status,
            created_at: row.created_at,
            closed_at: row.closed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: CartItemId,
    cart_id: CartId,
    product_id: ProductId,
    quantity: i32,
}

impl From<ItemRow> for CartItem {
    fn from(row: ItemRow) -> Self {
        Self {
            id: row.id,
            cart_id: row.cart_id,
            product_id: row.product_id,
            quantity: row.quantity,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LineRow {
    item_id: CartItemId,
    product_id: ProductId,
    name: String,
    price: Price,
    quantity: i32,
}

impl From<LineRow> for CartLine {
    fn from(row: LineRow) -> Self {
        Self {
            item_id: row.item_id,
            product_id: row.product_id,
            name: row.name,
            unit_price: row.price,
            quantity: row.quantity,
            subtotal: row.price.times(row.quantity),
        }
    }
}

/// Repository for cart database operations.
pub struct CartRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> CartRepository<'a> {
    /// Create a new cart repository.
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// The subject's open cart, if any.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get_open(&self, user_id: UserId) -> Result<Option<Cart>, RepositoryError> {
        let row = sqlx::query_as::<_, CartRow>(
            r"
            SELECT id, user_id, status, order_status, created_at, closed_at
            FROM carts
            WHERE user_id = $1 AND status = 'open'
            ",
        )
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Insert an open cart.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Conflict` if the subject already has one.
    pub async fn create_open(&self, user_id: UserId) -> Result<Cart, RepositoryError> {
        let row = sqlx::query_as::<_, CartRow>(
            r"
            INSERT INTO carts (user_id, status)
            VALUES ($1, 'open')
            RETURNING id, user_id, status, order_status, created_at, closed_at
            ",
        )
        .bind(user_id)
        .fetch_one(self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "open cart already exists"))?;
        Ok(row.into())
    }

    /// Get a cart by ID, open or closed.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get_by_id(&self, id: CartId) -> Result<Option<Cart>, RepositoryError> {
        let row = sqlx::query_as::<_, CartRow>(
            r"
            SELECT id, user_id, status, order_status, created_at, closed_at
            FROM carts
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Close an open cart. Returns `false` if it was not open.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the update fails.
    pub async fn close(&self, id: CartId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE carts
            SET status = 'closed', order_status = 'placed', closed_at = $2
            WHERE id = $1 AND status = 'open'
            ",
        )
        .bind(id)
        .bind(now)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Relabel a closed cart. Returns `false` if missing or still open.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the update fails.
    pub async fn set_order_status(
        &self,
        id: CartId,
        status: OrderStatus,
    ) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE carts SET order_status = $2 WHERE id = $1 AND status = 'closed'")
                .bind(id)
                .bind(status)
                .execute(self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Lines of a cart with product name and price.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn lines(&self, id: CartId) -> Result<Vec<CartLine>, RepositoryError> {
        let rows = sqlx::query_as::<_, LineRow>(
            r"
            SELECT ci.id AS item_id, ci.product_id, p.name, p.price, ci.quantity
            FROM cart_items ci
            JOIN products p ON p.id = ci.product_id
            WHERE ci.cart_id = $1
            ORDER BY ci.id
            ",
        )
        .bind(id)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Get one line.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get_item(&self, id: CartItemId) -> Result<Option<CartItem>, RepositoryError> {
        let row = sqlx::query_as::<_, ItemRow>(
            "SELECT id, cart_id, product_id, quantity FROM cart_items WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Add to an open cart, merging with an existing line for the same
    /// product. Returns `None` if the cart is missing or already closed.
    ///
    /// The cart row is share-locked so a concurrent close waits for the
    /// write, or the write sees the closed status.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the upsert fails.
    pub async fn add_item(
        &self,
        cart: CartId,
        product: ProductId,
        quantity: i32,
    ) -> Result<Option<CartItem>, RepositoryError> {
        let row = sqlx::query_as::<_, ItemRow>(
            r"
            INSERT INTO cart_items (cart_id, product_id, quantity)
            SELECT $1, $2, $3
            WHERE EXISTS (
                SELECT 1 FROM carts WHERE id = $1 AND status = 'open' FOR SHARE
            )
            ON CONFLICT (cart_id, product_id)
            DO UPDATE SET quantity = cart_items.quantity + EXCLUDED.quantity,
                          updated_at = now()
            RETURNING id, cart_id, product_id, quantity
            ",
        )
        .bind(cart)
        .bind(product)
        .bind(quantity)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Overwrite a line's quantity. Returns `false` if the line is missing
    /// or its cart is closed.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the update fails.
    pub async fn set_item_quantity(
        &self,
        id: CartItemId,
        quantity: i32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE cart_items ci
            SET quantity = $2, updated_at = now()
            WHERE ci.id = $1
              AND EXISTS (
                  SELECT 1 FROM carts c
                  WHERE c.id = ci.cart_id AND c.status = 'open'
                  FOR SHARE
              )
            ",
        )
        .bind(id)
        .bind(quantity)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete a line of an open cart.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the delete fails.
    pub async fn remove_item(&self, id: CartItemId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            DELETE FROM cart_items ci
            WHERE ci.id = $1
              AND EXISTS (
                  SELECT 1 FROM carts c
                  WHERE c.id = ci.cart_id AND c.status = 'open'
                  FOR SHARE
              )
            ",
        )
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete every line of an open cart. A closed cart is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the delete fails.
    pub async fn clear(&self, id: CartId) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r"
            DELETE FROM cart_items
            WHERE cart_id = $1
              AND EXISTS (
                  SELECT 1 FROM carts WHERE id = $1 AND status = 'open' FOR SHARE
              )
            ",
        )
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Closed carts, newest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn list_closed(&self, user_id: Option<UserId>) -> Result<Vec<Cart>, RepositoryError> {
        let rows = sqlx::query_as::<_, CartRow>(
            r"
            SELECT id, user_id, status, order_status, created_at, closed_at
            FROM carts
            WHERE status = 'closed' AND ($1::BIGINT IS NULL OR user_id = $1)
            ORDER BY closed_at DESC, id DESC
            ",
        )
        .bind(user_id)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Count closed carts (orders).
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn count_closed(&self) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM carts WHERE status = 'closed'")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }
}
