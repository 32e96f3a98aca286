//! Unified error handling with Sentry integration.
//!
//! Service errors classify themselves with an [`ErrorKind`] and a stable
//! machine-readable code. `AppError` turns that into a JSON body
//! `{"error": ..., "code": ...}` and captures server-side failures to Sentry
//! before responding. All route handlers return `Result<T, AppError>`.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::db::RepositoryError;
use crate::services::auth::AuthError;
use crate::services::cart::CartError;
use crate::services::google::GoogleError;

/// Error classes shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input. No side effects happened.
    Validation,
    /// No or bad credentials.
    Unauthorized,
    /// Authenticated but not allowed.
    Forbidden,
    NotFound,
    /// Rejected because of current state. Not retryable.
    Conflict,
    /// A time-bounded grant ran out. The remedy is to request a new one.
    Expired,
    /// Infrastructure failure. Retry with backoff.
    Transient,
    Internal,
}

impl ErrorKind {
    /// HTTP status for this class.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Expired => StatusCode::GONE,
            Self::Transient => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure is ours rather than the caller's.
    #[must_use]
    pub const fn is_server_side(self) -> bool {
        matches!(self, Self::Transient | Self::Internal)
    }
}

/// Classify a store error.
#[must_use]
pub const fn repository_kind(err: &RepositoryError) -> ErrorKind {
    match err {
        RepositoryError::Unavailable(_) => ErrorKind::Transient,
        RepositoryError::NotFound => ErrorKind::NotFound,
        RepositoryError::Conflict(_) => ErrorKind::Conflict,
        RepositoryError::Database(_) | RepositoryError::DataCorruption(_) => ErrorKind::Internal,
    }
}

/// Stable code for a store error.
#[must_use]
pub const fn repository_code(err: &RepositoryError) -> &'static str {
    match err {
        RepositoryError::Unavailable(_) => "SERVICE_UNAVAILABLE",
        RepositoryError::NotFound => "NOT_FOUND",
        RepositoryError::Conflict(_) => "CONFLICT",
        RepositoryError::Database(_) | RepositoryError::DataCorruption(_) => "INTERNAL_ERROR",
    }
}

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    /// Registration, reset, login or account operation failed.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Cart or order operation failed.
    #[error("Cart error: {0}")]
    Cart(#[from] CartError),

    /// Federated login failed at the provider.
    #[error("OAuth error: {0}")]
    Google(#[from] GoogleError),

    /// No usable session on a protected route.
    #[error("Authentication required")]
    AuthRequired,

    /// Session is valid but the subject is not an admin.
    #[error("Admin role required")]
    AdminRequired,

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Error class.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(err) => repository_kind(err),
            Self::Auth(err) => err.kind(),
            Self::Cart(err) => err.kind(),
            Self::Google(err) => err.kind(),
            Self::AuthRequired => ErrorKind::Unauthorized,
            Self::AdminRequired => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::BadRequest(_) => ErrorKind::Validation,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(err) => repository_code(err),
            Self::Auth(err) => err.code(),
            Self::Cart(err) => err.code(),
            Self::Google(err) => err.code(),
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AdminRequired => "ADMIN_REQUIRED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// What the client is told.
    fn public_message(&self) -> String {
        match self.kind() {
            // Don't expose internal error details to clients
            ErrorKind::Internal => "Internal server error".to_string(),
            ErrorKind::Transient => "Service temporarily unavailable, please retry".to_string(),
            _ => match self {
                Self::Auth(err) => err.public_message(),
                Self::Cart(err) => err.to_string(),
                Self::Google(GoogleError::UnverifiedEmail) => {
                    "Your Google account email is not verified".to_string()
                }
                Self::Google(_) => "Google sign-in failed, please try again".to_string(),
                Self::NotFound(what) => format!("{what} not found"),
                Self::BadRequest(msg) => msg.clone(),
                other => other.to_string(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();

        // Capture server errors to Sentry
        if kind.is_server_side() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                code = self.code(),
                sentry_event_id = %event_id,
                "Request error"
            );
        } else {
            tracing::debug!(error = %self, code = self.code(), "Request rejected");
        }

        let body = Json(json!({
            "error": self.public_message(),
            "code": self.code(),
        }));

        let mut response = (kind.status(), body).into_response();
        if kind == ErrorKind::Transient {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;

/// Set the Sentry user context from a user ID.
///
/// Call this after successful authentication to associate errors with users.
pub fn set_sentry_user(user_id: &impl ToString, email: Option<&str>) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            email: email.map(String::from),
            ..Default::default()
        }));
    });
}

/// Add a breadcrumb for user actions.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of actions
/// leading up to an error.
///
/// # Example
///
/// ```rust,ignore
/// add_breadcrumb("cart", "Checked out", Some(&[("cart_id", "123")]));
/// ```
pub fn add_breadcrumb(category: &str, message: &str, data: Option<&[(&str, &str)]>) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    if let Some(pairs) = data {
        for (key, value) in pairs {
            breadcrumb.data.insert(
                (*key).to_string(),
                serde_json::Value::String((*value).to_string()),
            );
        }
    }

    sentry::add_breadcrumb(breadcrumb);
}
