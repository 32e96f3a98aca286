//! HTTP route handlers.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                             - Liveness
//! GET  /health/ready                       - Readiness (store probe)
//!
//! # Browser links
//! GET  /auth/confirm?token=                - Confirm registration (emailed link)
//! GET  /auth/google/login                  - Redirect to Google consent
//! GET  /auth/google/callback               - Finish Google sign-in
//!
//! # Auth (strict rate limit)
//! POST /api/auth/register
//! POST /api/auth/confirm
//! POST /api/auth/resend-confirmation
//! POST /api/auth/login
//! POST /api/auth/logout
//! GET  /api/auth/me                        - requires session
//! POST /api/auth/forgot-password
//! GET  /api/auth/reset-password/validate?token=
//! POST /api/auth/reset-password
//! POST /api/auth/change-password           - requires session
//!
//! # Cart (requires session)
//! GET    /api/cart
//! DELETE /api/cart
//! POST   /api/cart/items
//! PUT    /api/cart/items/{item_id}
//! DELETE /api/cart/items/{item_id}
//! POST   /api/cart/checkout
//!
//! # Account (requires session)
//! PUT  /api/account/profile
//! GET  /api/account/orders
//!
//! # Admin (requires admin role)
//! GET  /api/admin/stats
//! GET  /api/admin/users
//! PUT  /api/admin/users/{id}/role
//! GET  /api/admin/orders
//! GET  /api/admin/orders/{id}
//! PUT  /api/admin/orders/{id}/status
//! ```

pub mod account;
pub mod admin;
pub mod auth;
pub mod cart;
pub mod google;
pub mod health;

use axum::{Router, routing::get};

use crate::db::Store;
use crate::middleware::{api_rate_limiter, auth_rate_limiter};
use crate::services::email::Mailer;
use crate::state::AppState;

/// Browser-facing links outside `/api`.
pub fn link_routes<S: Store, M: Mailer>() -> Router<AppState<S, M>> {
    Router::new()
        .route("/auth/confirm", get(auth::confirm_link::<S, M>))
        .route("/auth/google/login", get(google::login::<S, M>))
        .route("/auth/google/callback", get(google::callback::<S, M>))
}

/// Everything under `/api`.
///
/// With `rate_limit` set, `/api/auth` gets the strict limiter and the rest
/// the relaxed one.
pub fn api_routes<S: Store, M: Mailer>(rate_limit: bool) -> Router<AppState<S, M>> {
    let mut auth = auth::router();
    let mut rest = Router::new()
        .nest("/cart", cart::router())
        .nest("/account", account::router())
        .nest("/admin", admin::router());

    if rate_limit {
        auth = auth.layer(auth_rate_limiter());
        rest = rest.layer(api_rate_limiter());
    }

    Router::new().nest("/auth", auth).merge(rest)
}

/// Create all routes.
pub fn routes<S: Store, M: Mailer>(rate_limit: bool) -> Router<AppState<S, M>> {
    Router::new()
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness::<S, M>))
        .merge(link_routes())
        .nest("/api", api_routes(rate_limit))
}
