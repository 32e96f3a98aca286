//! Administration route handlers.
//!
//! Every handler takes [`RequireAdmin`], so a non-admin session gets 403
//! before any work happens.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, put},
};
use serde::{Deserialize, Serialize};
use vdiamond_core::{CartId, OrderStatus, Role, UserId};

use crate::db::{CartStore, ProductCatalog, Store, SubjectStore};
use crate::error::Result;
use crate::middleware::RequireAdmin;
use crate::models::{CartView, Subject, SubjectSummary};
use crate::services::email::Mailer;
use crate::state::AppState;

/// Build the `/api/admin` router.
pub fn router<S: Store, M: Mailer>() -> Router<AppState<S, M>> {
    Router::new()
        .route("/stats", get(stats::<S, M>))
        .route("/users", get(users::<S, M>))
        .route("/users/{id}/role", put(set_role::<S, M>))
        .route("/orders", get(orders::<S, M>))
        .route("/orders/{id}", get(order::<S, M>))
        .route("/orders/{id}/status", put(set_order_status::<S, M>))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub users: i64,
    pub products: i64,
    pub orders: i64,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct OrderStatusRequest {
    pub status: OrderStatus,
}

/// `GET /api/admin/stats`
pub async fn stats<S: Store, M: Mailer>(
    RequireAdmin(_admin): RequireAdmin,
    State(state): State<AppState<S, M>>,
) -> Result<Json<StatsResponse>> {
    let store = state.store();
    Ok(Json(StatsResponse {
        users: store.count_subjects().await?,
        products: store.count_products().await?,
        orders: store.count_closed().await?,
    }))
}

/// `GET /api/admin/users`
pub async fn users<S: Store, M: Mailer>(
    RequireAdmin(_admin): RequireAdmin,
    State(state): State<AppState<S, M>>,
) -> Result<Json<Vec<SubjectSummary>>> {
    let subjects = state.store().list_subjects().await?;
    Ok(Json(subjects.iter().map(Subject::summary).collect()))
}

/// `PUT /api/admin/users/{id}/role`
pub async fn set_role<S: Store, M: Mailer>(
    RequireAdmin(admin): RequireAdmin,
    State(state): State<AppState<S, M>>,
    Path(id): Path<i64>,
    Json(body): Json<RoleRequest>,
) -> Result<Json<SubjectSummary>> {
    let subject = state.auth().set_role(UserId::new(id), body.role).await?;
    tracing::info!(admin_id = %admin.id, user_id = id, role = %body.role, "Admin changed role");
    Ok(Json(subject.summary()))
}

/// `GET /api/admin/orders`
pub async fn orders<S: Store, M: Mailer>(
    RequireAdmin(_admin): RequireAdmin,
    State(state): State<AppState<S, M>>,
) -> Result<Json<Vec<CartView>>> {
    Ok(Json(state.carts().all_orders().await?))
}

/// `GET /api/admin/orders/{id}`
pub async fn order<S: Store, M: Mailer>(
    RequireAdmin(_admin): RequireAdmin,
    State(state): State<AppState<S, M>>,
    Path(id): Path<i64>,
) -> Result<Json<CartView>> {
    Ok(Json(state.carts().order(CartId::new(id)).await?))
}

/// `PUT /api/admin/orders/{id}/status`
pub async fn set_order_status<S: Store, M: Mailer>(
    RequireAdmin(admin): RequireAdmin,
    State(state): State<AppState<S, M>>,
    Path(id): Path<i64>,
    Json(body): Json<OrderStatusRequest>,
) -> Result<Json<CartView>> {
    let order = state
        .carts()
        .update_order_status(CartId::new(id), body.status)
        .await?;
    tracing::info!(admin_id = %admin.id, cart_id = id, status = %body.status, "Admin updated order");
    Ok(Json(order))
}
