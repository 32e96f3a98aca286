//! Google OAuth 2.0 client for federated login.
//!
//! # OAuth Flow
//!
//! 1. Generate authorization URL with `authorization_url()`
//! 2. Redirect the browser to Google's consent page
//! 3. Google redirects back with an authorization code
//! 4. Exchange code for an access token with `exchange_code()`
//! 5. Fetch the verified profile with `profile()`

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use secrecy::ExposeSecret;
use serde::Deserialize;
use thiserror::Error;

use crate::config::GoogleOAuthConfig;
use crate::error::ErrorKind;

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Errors talking to Google.
#[derive(Debug, Error)]
pub enum GoogleError {
    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Google rejected the exchange or returned something unusable.
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// The account's email address is not verified by Google.
    #[error("email not verified by provider")]
    UnverifiedEmail,
}

impl GoogleError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(_) => ErrorKind::Transient,
            Self::OAuth(_) => ErrorKind::Unauthorized,
            Self::UnverifiedEmail => ErrorKind::Forbidden,
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "OAUTH_UNAVAILABLE",
            Self::OAuth(_) => "OAUTH_FAILED",
            Self::UnverifiedEmail => "EMAIL_NOT_VERIFIED",
        }
    }
}

/// Identity asserted by an external provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalProfile {
    /// Provider subject id (`sub`).
    pub external_id: String,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    id: String,
    email: String,
    #[serde(default)]
    verified_email: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

impl UserInfo {
    fn into_profile(self) -> Result<ExternalProfile, GoogleError> {
        if !self.verified_email {
            return Err(GoogleError::UnverifiedEmail);
        }
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.email.split('@').next().unwrap_or_default().to_string());
        Ok(ExternalProfile {
            external_id: self.id,
            email: self.email,
            name,
            picture: self.picture,
        })
    }
}

/// Client for Google's OAuth endpoints.
#[derive(Clone)]
pub struct GoogleClient {
    inner: Arc<GoogleClientInner>,
}

struct GoogleClientInner {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_url: String,
}

impl GoogleClient {
    /// Create a client whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `GoogleError::Http` if the HTTP client cannot be built.
    pub fn new(config: &GoogleOAuthConfig, timeout: Duration) -> Result<Self, GoogleError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            inner: Arc::new(GoogleClientInner {
                client,
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.expose_secret().to_string(),
                redirect_url: config.redirect_url.clone(),
            }),
        })
    }

    /// URL of Google's consent page.
    #[must_use]
    pub fn authorization_url(&self, state: &str) -> String {
        format!(
            "{AUTHORIZE_URL}?\
            client_id={}&\
            response_type=code&\
            redirect_uri={}&\
            scope=openid%20email%20profile&\
            state={}",
            urlencoding::encode(&self.inner.client_id),
            urlencoding::encode(&self.inner.redirect_url),
            urlencoding::encode(state)
        )
    }

    /// Exchange an authorization code for an access token.
    ///
    /// # Errors
    ///
    /// Returns `GoogleError::OAuth` if Google rejects the code.
    pub async fn exchange_code(&self, code: &str) -> Result<String, GoogleError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", self.inner.client_id.as_str()),
            ("client_secret", self.inner.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.inner.redirect_url.as_str()),
        ];

        let response = self.inner.client.post(TOKEN_URL).form(&params).send().await?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GoogleError::OAuth(format!("Token exchange failed: {text}")));
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    /// Fetch the signed-in user's verified profile.
    ///
    /// # Errors
    ///
    /// Returns `GoogleError::UnverifiedEmail` for an unverified address.
    pub async fn profile(&self, access_token: &str) -> Result<ExternalProfile, GoogleError> {
        let response = self
            .inner
            .client
            .get(USERINFO_URL)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GoogleError::OAuth(format!(
                "Userinfo request failed with {}",
                response.status()
            )));
        }

        let info: UserInfo = response.json().await?;
        info.into_profile()
    }
}

/// Random CSRF state for the authorization request.
#[must_use]
pub fn generate_state() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
