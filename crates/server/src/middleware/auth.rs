//! Session guard and authentication extractors.
//!
//! A session is a signed bearer token. It is read from the
//! `Authorization: Bearer` header when present, otherwise from the session
//! cookie. The guard verifies it, resolves the subject from the store and
//! hands handlers a [`CurrentSubject`]. It never writes.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use cookie::{Cookie, SameSite};

use crate::config::SessionConfig;
use crate::db::{Store, SubjectStore};
use crate::error::{AppError, set_sentry_user};
use crate::models::CurrentSubject;
use crate::services::email::Mailer;
use crate::state::AppState;

/// Extractor that requires a valid session.
///
/// # Example
///
/// ```rust,ignore
/// async fn me(RequireAuth(subject): RequireAuth) -> impl IntoResponse {
///     Json(subject)
/// }
/// ```
pub struct RequireAuth(pub CurrentSubject);

/// Extractor that requires a valid session for an admin.
pub struct RequireAdmin(pub CurrentSubject);

impl<S: Store, M: Mailer> FromRequestParts<AppState<S, M>> for RequireAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<S, M>,
    ) -> Result<Self, Self::Rejection> {
        authenticate(&parts.headers, state).await.map(Self)
    }
}

impl<S: Store, M: Mailer> FromRequestParts<AppState<S, M>> for RequireAdmin {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<S, M>,
    ) -> Result<Self, Self::Rejection> {
        let subject = authenticate(&parts.headers, state).await?;
        if !subject.is_admin() {
            tracing::warn!(user_id = %subject.id, "Non-admin attempted admin operation");
            return Err(AppError::AdminRequired);
        }
        Ok(Self(subject))
    }
}

/// Resolve the caller from request headers.
///
/// # Errors
///
/// Returns `AppError::AuthRequired` when no token is sent, the token does not
/// verify, or its subject no longer exists. Store failures surface as
/// transient errors.
pub async fn authenticate<S: Store, M: Mailer>(
    headers: &HeaderMap,
    state: &AppState<S, M>,
) -> Result<CurrentSubject, AppError> {
    let token = session_token(headers, &state.config().session.cookie_name)
        .ok_or(AppError::AuthRequired)?;

    let claims = state.issuer().verify_session(&token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected session token");
        AppError::AuthRequired
    })?;

    let Some(subject) = state.store().subject_by_id(claims.sub).await? else {
        tracing::debug!(user_id = %claims.sub, "Session for deleted subject");
        return Err(AppError::AuthRequired);
    };

    let current = CurrentSubject::from(&subject);
    set_sentry_user(&current.id, Some(current.email.as_str()));
    Ok(current)
}

/// Pull the session token out of the request.
///
/// The `Authorization` header wins over the cookie.
#[must_use]
pub fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    cookie_value(headers, cookie_name)
}

/// Value of a named cookie from the `Cookie` headers.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|c| c.name() == name && !c.value().is_empty())
        .map(|c| c.value().to_string())
}

/// HTTP-only session cookie carrying `token`.
#[must_use]
pub fn session_cookie(config: &SessionConfig, token: String) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), token))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .secure(config.secure_cookie)
        .max_age(cookie::time::Duration::seconds(config.ttl.num_seconds()))
        .build()
}

/// Cookie that removes the session cookie.
#[must_use]
pub fn clear_session_cookie(config: &SessionConfig) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), ""))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .secure(config.secure_cookie)
        .max_age(cookie::time::Duration::ZERO)
        .build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::HeaderValue;
    use chrono::TimeDelta;
    use secrecy::SecretString;

    use super::*;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn config(secure: bool) -> SessionConfig {
        SessionConfig {
            secret: SecretString::from("k"),
            ttl: TimeDelta::hours(24),
            cookie_name: "auth_token".to_string(),
            secure_cookie: secure,
        }
    }

    #[test]
    fn test_header_wins_over_cookie() {
        let h = headers(&[
            (header::AUTHORIZATION, "Bearer from-header"),
            (header::COOKIE, "auth_token=from-cookie"),
        ]);
        assert_eq!(session_token(&h, "auth_token").as_deref(), Some("from-header"));
    }

    #[test]
    fn test_cookie_fallback() {
        let h = headers(&[(header::COOKIE, "theme=dark; auth_token=abc.def.ghi")]);
        assert_eq!(session_token(&h, "auth_token").as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_non_bearer_scheme_falls_back_to_cookie() {
        let h = headers(&[
            (header::AUTHORIZATION, "Basic dXNlcjpwYXNz"),
            (header::COOKIE, "auth_token=tok"),
        ]);
        assert_eq!(session_token(&h, "auth_token").as_deref(), Some("tok"));
    }

    #[test]
    fn test_missing_token() {
        let h = headers(&[
            (header::AUTHORIZATION, "Bearer "),
            (header::COOKIE, "auth_token="),
        ]);
        assert!(session_token(&h, "auth_token").is_none());
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie(&config(true), "tok".to_string());
        let rendered = cookie.to_string();
        assert!(rendered.starts_with("auth_token=tok"));
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("SameSite=Lax"));
        assert!(rendered.contains("Path=/"));
        assert!(rendered.contains("Secure"));
        assert!(rendered.contains("Max-Age=86400"));

        let insecure = session_cookie(&config(false), "tok".to_string()).to_string();
        assert!(!insecure.contains("Secure"));
    }

    #[test]
    fn test_clear_cookie_expires_immediately() {
        let rendered = clear_session_cookie(&config(false)).to_string();
        assert!(rendered.starts_with("auth_token=;"));
        assert!(rendered.contains("Max-Age=0"));
    }
}
