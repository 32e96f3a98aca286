//! Cart ledger: the open-cart and checkout state machine.
//!
//! Each subject has at most one open cart. Checkout moves it to `closed`
//! exactly once; after that the next cart access creates a fresh one. A
//! closed cart is an order and carries an [`OrderStatus`] label that only
//! admins change.
//!
//! Both races the ledger cares about are settled by the store:
//!
//! - Concurrent first access: `create_open_cart` fails with `Conflict` for
//!   every caller but one, and the losers fetch the winner's cart.
//! - Concurrent checkout: `close_cart` is a guarded `open -> closed` update,
//!   so only one caller sees `true`.

use std::sync::Arc;

use thiserror::Error;

use vdiamond_core::{CartId, CartItemId, OrderStatus, ProductId, UserId};

use crate::db::{RepositoryError, Store};
use crate::error::{ErrorKind, repository_code, repository_kind};
use crate::models::{Cart, CartItem, CartView};
use crate::services::clock::Clock;

/// How many times get-or-create re-reads after losing a creation race.
const CREATE_ATTEMPTS: usize = 3;

/// Errors from cart and order operations.
#[derive(Debug, Error)]
pub enum CartError {
    /// Quantity must be positive when adding.
    #[error("quantity must be at least 1")]
    InvalidQuantity,

    #[error("product not found")]
    ProductNotFound,

    /// Requested more than the product has in stock.
    #[error("not enough stock available (requested {requested}, in stock {available})")]
    OutOfStock { requested: i32, available: i32 },

    /// Item is not in the caller's open cart.
    #[error("item not found in cart")]
    ItemNotFound,

    /// Nothing to check out.
    #[error("no active cart")]
    NoActiveCart,

    #[error("order not found")]
    OrderNotFound,

    /// Order status only applies to closed carts.
    #[error("order is not closed")]
    OrderNotClosed,

    /// Repository/database error.
    #[error("database error: {0}")]
    Repository(#[from] RepositoryError),
}

impl CartError {
    /// Error class.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQuantity => ErrorKind::Validation,
            Self::OutOfStock { .. } | Self::NoActiveCart | Self::OrderNotClosed => {
                ErrorKind::Conflict
            }
            Self::ProductNotFound | Self::ItemNotFound | Self::OrderNotFound => {
                ErrorKind::NotFound
            }
            Self::Repository(err) => repository_kind(err),
        }
    }

    /// Machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuantity => "INVALID_QUANTITY",
            Self::ProductNotFound => "PRODUCT_NOT_FOUND",
            Self::OutOfStock { .. } => "OUT_OF_STOCK",
            Self::ItemNotFound => "ITEM_NOT_FOUND",
            Self::NoActiveCart => "NO_ACTIVE_CART",
            Self::OrderNotFound => "ORDER_NOT_FOUND",
            Self::OrderNotClosed => "ORDER_NOT_CLOSED",
            Self::Repository(err) => repository_code(err),
        }
    }
}

/// Result of a checkout call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// This call closed the cart.
    Closed(CartView),
    /// The cart was already closed; nothing changed.
    AlreadyClosed(CartView),
}

impl CheckoutOutcome {
    /// The order either way.
    #[must_use]
    pub const fn order(&self) -> &CartView {
        match self {
            Self::Closed(view) | Self::AlreadyClosed(view) => view,
        }
    }
}

/// Cart and order operations for one store.
#[derive(Clone)]
pub struct CartLedger<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: Store> CartLedger<S> {
    #[must_use]
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The subject's open cart, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Repository` if the store fails.
    pub async fn get_or_create(&self, user_id: UserId) -> Result<Cart, CartError> {
        for _ in 0..CREATE_ATTEMPTS {
            if let Some(cart) = self.store.open_cart(user_id).await? {
                return Ok(cart);
            }

            match self.store.create_open_cart(user_id).await {
                Ok(cart) => {
                    tracing::debug!(user_id = %user_id, cart_id = %cart.id, "Opened cart");
                    return Ok(cart);
                }
                // Someone else created it; read theirs on the next pass
                Err(RepositoryError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        // The winner's cart was checked out between our reads every time
        Err(CartError::Repository(RepositoryError::Unavailable(
            "open cart kept changing under concurrent access".to_string(),
        )))
    }

    /// Make sure the subject has an open cart, logging instead of failing.
    pub async fn provision(&self, user_id: UserId) {
        if let Err(e) = self.get_or_create(user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to provision cart");
        }
    }

    /// The open cart with priced lines.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Repository` if the store fails.
    pub async fn view(&self, user_id: UserId) -> Result<CartView, CartError> {
        let cart = self.get_or_create(user_id).await?;
        self.view_of(cart).await
    }

    async fn view_of(&self, cart: Cart) -> Result<CartView, CartError> {
        let lines = self.store.cart_lines(cart.id).await?;
        Ok(CartView::new(cart, lines))
    }

    /// Add a product, merging with an existing line.
    ///
    /// # Errors
    ///
    /// Returns `CartError::OutOfStock` if `quantity` exceeds stock,
    /// `CartError::ProductNotFound` for an unknown product.
    pub async fn add_item(
        &self,
        user_id: UserId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartItem, CartError> {
        if quantity <= 0 {
            return Err(CartError::InvalidQuantity);
        }

        let product = self
            .store
            .product_by_id(product_id)
            .await?
            .ok_or(CartError::ProductNotFound)?;

        if quantity > product.stock {
            return Err(CartError::OutOfStock {
                requested: quantity,
                available: product.stock,
            });
        }

        for _ in 0..CREATE_ATTEMPTS {
            let cart = self.get_or_create(user_id).await?;
            // None means the cart was checked out after we resolved it
            if let Some(item) = self.store.add_item(cart.id, product_id, quantity).await? {
                tracing::debug!(
                    cart_id = %cart.id,
                    product_id = %product_id,
                    quantity = item.quantity,
                    "Added to cart"
                );
                return Ok(item);
            }
        }

        Err(CartError::Repository(RepositoryError::Unavailable(
            "open cart kept closing under concurrent access".to_string(),
        )))
    }

    /// Item in the caller's open cart, if it is there.
    async fn own_item(
        &self,
        user_id: UserId,
        item_id: CartItemId,
    ) -> Result<Option<(Cart, CartItem)>, CartError> {
        let Some(cart) = self.store.open_cart(user_id).await? else {
            return Ok(None);
        };
        let item = self
            .store
            .cart_item(item_id)
            .await?
            .filter(|item| item.cart_id == cart.id);
        Ok(item.map(|item| (cart, item)))
    }

    /// Set a line's quantity. Zero or less removes it.
    ///
    /// # Errors
    ///
    /// Returns `CartError::ItemNotFound` if the item is not in the caller's
    /// open cart.
    pub async fn update_item(
        &self,
        user_id: UserId,
        item_id: CartItemId,
        quantity: i32,
    ) -> Result<CartView, CartError> {
        let (cart, item) = self
            .own_item(user_id, item_id)
            .await?
            .ok_or(CartError::ItemNotFound)?;

        let changed = if quantity <= 0 {
            self.store.remove_item(item.id).await?
        } else {
            self.store.set_item_quantity(item.id, quantity).await?
        };
        if !changed {
            return Err(CartError::ItemNotFound);
        }

        self.view_of(cart).await
    }

    /// Remove a line. Removing something that is not there is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Repository` if the store fails.
    pub async fn remove_item(
        &self,
        user_id: UserId,
        item_id: CartItemId,
    ) -> Result<CartView, CartError> {
        if let Some((_, item)) = self.own_item(user_id, item_id).await? {
            self.store.remove_item(item.id).await?;
        }
        self.view(user_id).await
    }

    /// Remove every line from the open cart.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Repository` if the store fails.
    pub async fn clear(&self, user_id: UserId) -> Result<CartView, CartError> {
        let cart = self.get_or_create(user_id).await?;
        let removed = self.store.clear_cart(cart.id).await?;
        tracing::debug!(cart_id = %cart.id, removed, "Cleared cart");
        self.view(user_id).await
    }

    /// Close a cart.
    ///
    /// With `cart_id`, closes that cart if it belongs to the subject, and
    /// reports `AlreadyClosed` when a retry finds it closed. Without one,
    /// closes the subject's open cart. An empty open cart that follows an
    /// earlier order is the fresh cart opened after that checkout, so a
    /// repeated call reports `AlreadyClosed` with the most recent order.
    ///
    /// # Errors
    ///
    /// Returns `CartError::NoActiveCart` if there is nothing to close.
    pub async fn checkout(
        &self,
        user_id: UserId,
        cart_id: Option<CartId>,
    ) -> Result<CheckoutOutcome, CartError> {
        let cart = match cart_id {
            Some(id) => self
                .store
                .cart_by_id(id)
                .await?
                .filter(|cart| cart.user_id == user_id),
            None => self.store.open_cart(user_id).await?,
        }
        .ok_or(CartError::NoActiveCart)?;

        if !cart.is_open() {
            return Ok(CheckoutOutcome::AlreadyClosed(self.view_of(cart).await?));
        }

        if cart_id.is_none() && self.store.cart_lines(cart.id).await?.is_empty() {
            let latest = self.store.closed_carts(Some(user_id)).await?.into_iter().next();
            if let Some(order) = latest {
                return Ok(CheckoutOutcome::AlreadyClosed(self.view_of(order).await?));
            }
        }

        let won = self.store.close_cart(cart.id, self.clock.now()).await?;
        let closed = self
            .store
            .cart_by_id(cart.id)
            .await?
            .ok_or(CartError::NoActiveCart)?;
        let view = self.view_of(closed).await?;

        if won {
            tracing::info!(
                user_id = %user_id,
                cart_id = %cart.id,
                total = %view.total,
                "Checked out"
            );
            Ok(CheckoutOutcome::Closed(view))
        } else {
            Ok(CheckoutOutcome::AlreadyClosed(view))
        }
    }

    /// A subject's orders, newest first.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Repository` if the store fails.
    pub async fn orders_for(&self, user_id: UserId) -> Result<Vec<CartView>, CartError> {
        self.views(self.store.closed_carts(Some(user_id)).await?)
            .await
    }

    /// Every order, newest first.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Repository` if the store fails.
    pub async fn all_orders(&self) -> Result<Vec<CartView>, CartError> {
        self.views(self.store.closed_carts(None).await?).await
    }

    async fn views(&self, carts: Vec<Cart>) -> Result<Vec<CartView>, CartError> {
        let mut views = Vec::with_capacity(carts.len());
        for cart in carts {
            views.push(self.view_of(cart).await?);
        }
        Ok(views)
    }

    /// One order.
    ///
    /// # Errors
    ///
    /// Returns `CartError::OrderNotFound` unless `id` is a closed cart.
    pub async fn order(&self, id: CartId) -> Result<CartView, CartError> {
        let cart = self
            .store
            .cart_by_id(id)
            .await?
            .filter(|cart| !cart.is_open())
            .ok_or(CartError::OrderNotFound)?;
        self.view_of(cart).await
    }

    /// Relabel an order. Callers must have checked the admin role.
    ///
    /// # Errors
    ///
    /// Returns `CartError::OrderNotFound` for an unknown id and
    /// `CartError::OrderNotClosed` for a cart that is still open.
    pub async fn update_order_status(
        &self,
        id: CartId,
        status: OrderStatus,
    ) -> Result<CartView, CartError> {
        let cart = self
            .store
            .cart_by_id(id)
            .await?
            .ok_or(CartError::OrderNotFound)?;
        if cart.is_open() {
            return Err(CartError::OrderNotClosed);
        }

        if !self.store.set_order_status(id, status).await? {
            return Err(CartError::OrderNotFound);
        }
        tracing::info!(cart_id = %id, status = %status, "Order status updated");

        self.order(id).await
    }
}
