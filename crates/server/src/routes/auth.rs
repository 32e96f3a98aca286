//! Password account route handlers.
//!
//! Registration, confirmation, login, logout and the password reset
//! endpoints. Every body is JSON; errors use the shared `{error, code}`
//! shape from [`AppError`].

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::db::{Store, SubjectStore};
use crate::error::{AppError, Result, add_breadcrumb};
use crate::middleware::{RequireAuth, clear_session_cookie, session_cookie};
use crate::models::SubjectSummary;
use crate::services::auth::AuthError;
use crate::services::email::Mailer;
use crate::services::registration::RegisterInput;
use crate::state::AppState;

/// Same text whatever the outcome, so it cannot be used to probe accounts.
const FORGOT_PASSWORD_ACK: &str =
    "If an account exists for that email, a password reset link has been sent";
const RESEND_ACK: &str =
    "If a pending registration exists for that email, a new confirmation link has been sent";

/// Build the `/api/auth` router.
pub fn router<S: Store, M: Mailer>() -> Router<AppState<S, M>> {
    Router::new()
        .route("/register", post(register::<S, M>))
        .route("/confirm", post(confirm::<S, M>))
        .route("/resend-confirmation", post(resend_confirmation::<S, M>))
        .route("/login", post(login::<S, M>))
        .route("/logout", post(logout::<S, M>))
        .route("/me", get(me::<S, M>))
        .route("/forgot-password", post(forgot_password::<S, M>))
        .route("/reset-password", post(reset_password::<S, M>))
        .route(
            "/reset-password/validate",
            get(validate_reset_token::<S, M>),
        )
        .route("/change-password", post(change_password::<S, M>))
}

// =============================================================================
// Request and response types
// =============================================================================

#[derive(Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Deserialize)]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub token: String,
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub current_password: String,
    #[serde(default)]
    pub new_password: String,
}

/// Outcome of a registration or confirmation.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// `pending_confirmation`, `active` or `confirmed`.
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub subject: SubjectSummary,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

/// Reject an empty required field before any service runs.
fn required<'a>(field: &'static str, value: &'a str) -> std::result::Result<&'a str, AuthError> {
    if value.trim().is_empty() {
        Err(AuthError::MissingField(field))
    } else {
        Ok(value)
    }
}

// =============================================================================
// Registration
// =============================================================================

/// `POST /api/auth/register`
#[instrument(skip_all)]
pub async fn register<S: Store, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<StatusResponse>)> {
    required("email", &body.email)?;
    required("password", &body.password)?;
    required("name", &body.name)?;

    let registration = state
        .registration()
        .register(RegisterInput {
            email: body.email,
            password: body.password,
            name: body.name,
        })
        .await?;

    let response = if registration.needs_confirmation {
        StatusResponse {
            status: "pending_confirmation",
            message: "Registration received, check your email to confirm your account",
        }
    } else {
        StatusResponse {
            status: "active",
            message: "Registration complete",
        }
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// `POST /api/auth/confirm`
#[instrument(skip_all)]
pub async fn confirm<S: Store, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Json(body): Json<TokenRequest>,
) -> Result<Json<StatusResponse>> {
    confirm_token(&state, &body.token).await
}

/// `GET /auth/confirm?token=...`, the link sent by email.
#[instrument(skip_all)]
pub async fn confirm_link<S: Store, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Query(query): Query<TokenRequest>,
) -> Result<Json<StatusResponse>> {
    confirm_token(&state, &query.token).await
}

async fn confirm_token<S: Store, M: Mailer>(
    state: &AppState<S, M>,
    token: &str,
) -> Result<Json<StatusResponse>> {
    required("token", token)?;
    let subject = state.registration().confirm(token).await?;
    let user_id = subject.id.to_string();
    add_breadcrumb("auth", "Email confirmed", Some(&[("user_id", user_id.as_str())]));
    Ok(Json(StatusResponse {
        status: "confirmed",
        message: "Email confirmed, you can now log in",
    }))
}

/// `POST /api/auth/resend-confirmation`
#[instrument(skip_all)]
pub async fn resend_confirmation<S: Store, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Json(body): Json<EmailRequest>,
) -> Result<Json<MessageResponse>> {
    required("email", &body.email)?;
    state.registration().resend(&body.email).await?;
    Ok(Json(MessageResponse {
        message: RESEND_ACK,
    }))
}

// =============================================================================
// Session
// =============================================================================

/// `POST /api/auth/login`
///
/// Returns the token in the body and also sets it as a cookie.
#[instrument(skip_all)]
pub async fn login<S: Store, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    required("email", &body.email)?;
    required("password", &body.password)?;

    let outcome = state.auth().login(&body.email, &body.password).await?;
    let cookie = session_cookie(&state.config().session, outcome.token.clone());

    Ok((
        [(header::SET_COOKIE, cookie.to_string())],
        Json(LoginResponse {
            token: outcome.token,
            subject: outcome.subject.summary(),
        }),
    ))
}

/// `POST /api/auth/logout`
///
/// Sessions are stateless; this only clears the cookie.
pub async fn logout<S: Store, M: Mailer>(State(state): State<AppState<S, M>>) -> impl IntoResponse {
    let cookie = clear_session_cookie(&state.config().session);
    (
        [(header::SET_COOKIE, cookie.to_string())],
        Json(MessageResponse {
            message: "Logged out",
        }),
    )
}

/// `GET /api/auth/me`
pub async fn me<S: Store, M: Mailer>(
    RequireAuth(current): RequireAuth,
    State(state): State<AppState<S, M>>,
) -> Result<Json<SubjectSummary>> {
    let subject = state
        .store()
        .subject_by_id(current.id)
        .await?
        .ok_or(AppError::AuthRequired)?;
    Ok(Json(subject.summary()))
}

// =============================================================================
// Passwords
// =============================================================================

/// `POST /api/auth/forgot-password`
#[instrument(skip_all)]
pub async fn forgot_password<S: Store, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Json(body): Json<EmailRequest>,
) -> Result<Json<MessageResponse>> {
    required("email", &body.email)?;
    state.reset().forgot(&body.email).await?;
    Ok(Json(MessageResponse {
        message: FORGOT_PASSWORD_ACK,
    }))
}

/// `GET /api/auth/reset-password/validate?token=...`
///
/// Business rejections are reported as `{valid: false, code}` with 200.
#[instrument(skip_all)]
pub async fn validate_reset_token<S: Store, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Query(query): Query<TokenRequest>,
) -> Result<Json<ValidateResponse>> {
    match state.reset().validate(&query.token).await {
        Ok(()) => Ok(Json(ValidateResponse {
            valid: true,
            code: None,
        })),
        Err(e) if e.kind().is_server_side() => Err(e.into()),
        Err(e) => Ok(Json(ValidateResponse {
            valid: false,
            code: Some(e.code()),
        })),
    }
}

/// `POST /api/auth/reset-password`
#[instrument(skip_all)]
pub async fn reset_password<S: Store, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Json(body): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>> {
    required("token", &body.token)?;
    required("new_password", &body.new_password)?;
    state.reset().reset(&body.token, &body.new_password).await?;
    Ok(Json(MessageResponse {
        message: "Password has been reset, you can now log in",
    }))
}

/// `POST /api/auth/change-password`
#[instrument(skip_all)]
pub async fn change_password<S: Store, M: Mailer>(
    RequireAuth(current): RequireAuth,
    State(state): State<AppState<S, M>>,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>> {
    required("current_password", &body.current_password)?;
    required("new_password", &body.new_password)?;
    state
        .auth()
        .change_password(current.id, &body.current_password, &body.new_password)
        .await?;
    Ok(Json(MessageResponse {
        message: "Password changed",
    }))
}
