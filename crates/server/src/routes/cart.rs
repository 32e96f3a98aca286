//! Cart route handlers.
//!
//! Every operation acts on the caller's own open cart, which is created on
//! first use. Item ids outside that cart behave as if they did not exist.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use vdiamond_core::{CartId, CartItemId, ProductId};

use crate::db::Store;
use crate::error::{Result, add_breadcrumb};
use crate::middleware::RequireAuth;
use crate::models::{CartItem, CartView};
use crate::services::cart::CheckoutOutcome;
use crate::services::email::Mailer;
use crate::state::AppState;

/// Build the `/api/cart` router.
pub fn router<S: Store, M: Mailer>() -> Router<AppState<S, M>> {
    Router::new()
        .route("/", get(show::<S, M>).delete(clear::<S, M>))
        .route("/items", post(add::<S, M>))
        .route(
            "/items/{item_id}",
            put(update::<S, M>).delete(remove::<S, M>),
        )
        .route("/checkout", post(checkout::<S, M>))
}

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub product_id: ProductId,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: i32,
}

/// Optional body for checkout. Retrying with the id returned by the first
/// call reports the existing order instead of failing.
#[derive(Debug, Default, Deserialize)]
pub struct CheckoutRequest {
    pub cart_id: Option<CartId>,
}

#[derive(Debug, Serialize)]
pub struct AddItemResponse {
    pub message: &'static str,
    pub item: CartItem,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub message: &'static str,
    /// True when this call found the cart already closed.
    pub already_closed: bool,
    pub order: CartView,
}

/// `GET /api/cart`
pub async fn show<S: Store, M: Mailer>(
    RequireAuth(subject): RequireAuth,
    State(state): State<AppState<S, M>>,
) -> Result<Json<CartView>> {
    Ok(Json(state.carts().view(subject.id).await?))
}

/// `POST /api/cart/items`
#[instrument(skip_all)]
pub async fn add<S: Store, M: Mailer>(
    RequireAuth(subject): RequireAuth,
    State(state): State<AppState<S, M>>,
    Json(body): Json<AddItemRequest>,
) -> Result<(StatusCode, Json<AddItemResponse>)> {
    let item = state
        .carts()
        .add_item(subject.id, body.product_id, body.quantity)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AddItemResponse {
            message: "Item added to cart",
            item,
        }),
    ))
}

/// `PUT /api/cart/items/{item_id}`
///
/// A quantity of zero or less removes the line.
pub async fn update<S: Store, M: Mailer>(
    RequireAuth(subject): RequireAuth,
    State(state): State<AppState<S, M>>,
    Path(item_id): Path<i64>,
    Json(body): Json<UpdateItemRequest>,
) -> Result<Json<CartView>> {
    let view = state
        .carts()
        .update_item(subject.id, CartItemId::new(item_id), body.quantity)
        .await?;
    Ok(Json(view))
}

/// `DELETE /api/cart/items/{item_id}`
pub async fn remove<S: Store, M: Mailer>(
    RequireAuth(subject): RequireAuth,
    State(state): State<AppState<S, M>>,
    Path(item_id): Path<i64>,
) -> Result<Json<CartView>> {
    let view = state
        .carts()
        .remove_item(subject.id, CartItemId::new(item_id))
        .await?;
    Ok(Json(view))
}

/// `DELETE /api/cart`
pub async fn clear<S: Store, M: Mailer>(
    RequireAuth(subject): RequireAuth,
    State(state): State<AppState<S, M>>,
) -> Result<Json<CartView>> {
    Ok(Json(state.carts().clear(subject.id).await?))
}

/// `POST /api/cart/checkout`
#[instrument(skip_all)]
pub async fn checkout<S: Store, M: Mailer>(
    RequireAuth(subject): RequireAuth,
    State(state): State<AppState<S, M>>,
    body: Option<Json<CheckoutRequest>>,
) -> Result<Json<CheckoutResponse>> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let outcome = state.carts().checkout(subject.id, body.cart_id).await?;

    let response = match outcome {
        CheckoutOutcome::Closed(order) => {
            let cart_id = order.cart.id.to_string();
            add_breadcrumb("cart", "Checked out", Some(&[("cart_id", cart_id.as_str())]));
            CheckoutResponse {
                message: "Order placed",
                already_closed: false,
                order,
            }
        }
        CheckoutOutcome::AlreadyClosed(order) => CheckoutResponse {
            message: "Order was already placed",
            already_closed: true,
            order,
        },
    };
    Ok(Json(response))
}
