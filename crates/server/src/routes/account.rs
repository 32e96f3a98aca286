//! Account route handlers.
//!
//! These routes require authentication.

use axum::{
    Json, Router,
    extract::State,
    routing::{get, put},
};
use serde::Deserialize;

use crate::db::Store;
use crate::error::Result;
use crate::middleware::RequireAuth;
use crate::models::{CartView, SubjectSummary};
use crate::services::email::Mailer;
use crate::state::AppState;

/// Build the `/api/account` router.
pub fn router<S: Store, M: Mailer>() -> Router<AppState<S, M>> {
    Router::new()
        .route("/profile", put(update_profile::<S, M>))
        .route("/orders", get(orders::<S, M>))
}

#[derive(Debug, Deserialize)]
pub struct ProfileRequest {
    #[serde(default)]
    pub name: String,
    pub picture: Option<String>,
}

/// `PUT /api/account/profile`
pub async fn update_profile<S: Store, M: Mailer>(
    RequireAuth(current): RequireAuth,
    State(state): State<AppState<S, M>>,
    Json(body): Json<ProfileRequest>,
) -> Result<Json<SubjectSummary>> {
    let subject = state
        .auth()
        .update_profile(current.id, &body.name, body.picture)
        .await?;
    Ok(Json(subject.summary()))
}

/// `GET /api/account/orders`
pub async fn orders<S: Store, M: Mailer>(
    RequireAuth(current): RequireAuth,
    State(state): State<AppState<S, M>>,
) -> Result<Json<Vec<CartView>>> {
    Ok(Json(state.carts().orders_for(current.id).await?))
}
