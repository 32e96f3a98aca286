//! Google OAuth route handlers.
//!
//! - Login: stores a random `state` in a short-lived cookie and redirects to
//!   Google's consent page
//! - Callback: checks the state, exchanges the code, resolves the subject and
//!   sets the session cookie
//!
//! Both are browser navigations, so failures redirect to the frontend login
//! page with an `error` code instead of returning JSON.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, header},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
};
use cookie::{Cookie, SameSite};
use serde::Deserialize;

use crate::db::Store;
use crate::error::AppError;
use crate::middleware::auth::{cookie_value, session_cookie};
use crate::services::email::Mailer;
use crate::services::google::generate_state;
use crate::state::AppState;

/// Cookie holding the CSRF state between login and callback.
const OAUTH_STATE_COOKIE: &str = "oauth_state";
const OAUTH_STATE_MAX_AGE_SECS: i64 = 600;

/// Query parameters from Google's redirect.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    /// Authorization code to exchange for tokens.
    pub code: Option<String>,
    /// State parameter for CSRF protection.
    pub state: Option<String>,
    /// Error code if the user denied access.
    pub error: Option<String>,
}

fn state_cookie(value: String, max_age: i64, secure: bool) -> Cookie<'static> {
    Cookie::build((OAUTH_STATE_COOKIE, value))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/auth/google")
        .secure(secure)
        .max_age(cookie::time::Duration::seconds(max_age))
        .build()
}

fn login_error<S: Store, M: Mailer>(state: &AppState<S, M>, code: &str) -> Response {
    Redirect::to(&format!(
        "{}/login?error={}",
        state.config().base_url,
        urlencoding::encode(code)
    ))
    .into_response()
}

/// Start Google sign-in.
///
/// # Route
///
/// `GET /auth/google/login`
pub async fn login<S: Store, M: Mailer>(State(state): State<AppState<S, M>>) -> Response {
    let Some(google) = state.google() else {
        return AppError::NotFound("Google sign-in".to_string()).into_response();
    };

    let oauth_state = generate_state();
    let cookie = state_cookie(
        oauth_state.clone(),
        OAUTH_STATE_MAX_AGE_SECS,
        state.config().session.secure_cookie,
    );

    (
        [(header::SET_COOKIE, cookie.to_string())],
        Redirect::to(&google.authorization_url(&oauth_state)),
    )
        .into_response()
}

/// Finish Google sign-in.
///
/// # Route
///
/// `GET /auth/google/callback`
pub async fn callback<S: Store, M: Mailer>(
    State(state): State<AppState<S, M>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(google) = state.google() else {
        return AppError::NotFound("Google sign-in".to_string()).into_response();
    };

    if let Some(error) = query.error {
        tracing::warn!(error = %error, "Google OAuth denied");
        return login_error(&state, "oauth_denied");
    }
    let Some(code) = query.code else {
        tracing::warn!("Google OAuth callback missing code");
        return login_error(&state, "missing_code");
    };

    // CSRF check
    let stored = cookie_value(&headers, OAUTH_STATE_COOKIE);
    if stored.is_none() || stored != query.state {
        tracing::warn!("Google OAuth state mismatch");
        return login_error(&state, "invalid_state");
    }

    let profile = match google.exchange_code(&code).await {
        Ok(access_token) => google.profile(&access_token).await,
        Err(e) => Err(e),
    };
    let profile = match profile {
        Ok(profile) => profile,
        Err(e) => {
            let err = AppError::from(e);
            tracing::warn!(error = %err, "Google OAuth exchange failed");
            return login_error(&state, err.code());
        }
    };

    let outcome = match state.auth().federated_login(profile).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let err = AppError::from(e);
            if err.kind().is_server_side() {
                tracing::error!(error = %err, "Federated login failed");
            } else {
                tracing::info!(error = %err, "Federated login rejected");
            }
            return login_error(&state, err.code());
        }
    };

    let secure = state.config().session.secure_cookie;
    let session = session_cookie(&state.config().session, outcome.token);
    let cleared = state_cookie(String::new(), 0, secure);

    (
        AppendHeaders([
            (header::SET_COOKIE, session.to_string()),
            (header::SET_COOKIE, cleared.to_string()),
        ]),
        Redirect::to(&format!("{}/", state.config().base_url)),
    )
        .into_response()
}
