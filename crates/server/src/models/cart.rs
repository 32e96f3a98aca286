//! Cart, order and product domain types.
//!
//! A closed cart is an order. There is no separate order table: checkout
//! flips the cart to `Closed` and stamps it with an [`OrderStatus`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use vdiamond_core::{CartId, CartItemId, CartStatus, OrderStatus, Price, ProductId, UserId};

/// A subject's basket, or a finalized order once closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cart {
    pub id: CartId,
    pub user_id: UserId,
    pub status: CartStatus,
    /// Fulfilment label; `None` while the cart is open.
    pub order_status: Option<OrderStatus>,
    pub created_at: DateTime<Utc>,
    /// When checkout closed the cart.
    pub closed_at: Option<DateTime<Utc>>,
}

impl Cart {
    /// Whether the cart still accepts items.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == CartStatus::Open
    }
}

/// A raw cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartItem {
    pub id: CartItemId,
    pub cart_id: CartId,
    pub product_id: ProductId,
    pub quantity: i32,
}

/// A cart line joined with its product, priced at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartLine {
    pub item_id: CartItemId,
    pub product_id: ProductId,
    pub name: String,
    pub unit_price: Price,
    pub quantity: i32,
    pub subtotal: Price,
}

impl CartLine {
    /// Build a line, computing the subtotal.
    #[must_use]
    pub fn new(item: &CartItem, product: &Product) -> Self {
        Self {
            item_id: item.id,
            product_id: item.product_id,
            name: product.name.clone(),
            unit_price: product.price,
            quantity: item.quantity,
            subtotal: product.price.times(item.quantity),
        }
    }
}

/// A cart with its priced lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartView {
    pub cart: Cart,
    #[serde(rename = "items")]
    pub lines: Vec<CartLine>,
    pub total: Price,
}

impl CartView {
    /// Assemble a view, summing line subtotals.
    #[must_use]
    pub fn new(cart: Cart, lines: Vec<CartLine>) -> Self {
        let total = lines.iter().map(|l| l.subtotal).sum();
        Self { cart, lines, total }
    }
}

/// Catalog entry, read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Price,
    pub stock: i32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_view_totals_lines() {
        let product = Product {
            id: ProductId::new(10),
            name: "Ring".to_string(),
            price: Price::from_cents(2500).unwrap(),
            stock: 5,
        };
        let item = CartItem {
            id: CartItemId::new(1),
            cart_id: CartId::new(1),
            product_id: product.id,
            quantity: 4,
        };
        let cart = Cart {
            id: CartId::new(1),
            user_id: UserId::new(1),
            status: CartStatus::Open,
            order_status: None,
            created_at: Utc::now(),
            closed_at: None,
        };

        let view = CartView::new(cart, vec![CartLine::new(&item, &product)]);
        assert_eq!(view.total, Price::from_cents(10_000).unwrap());
        assert_eq!(view.lines[0].subtotal, view.total);
    }
}
