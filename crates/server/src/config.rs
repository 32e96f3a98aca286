//! Server configuration loaded from environment variables.
//!
//! Everything the credential flows need (signing key, TTLs, timeouts,
//! deployment mode) is read once at startup into [`ServerConfig`] and handed
//! to the services that need it. Nothing reads the environment after that.
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATABASE_URL` - `PostgreSQL` connection string
//! - `VD_BASE_URL` - Public URL used in confirmation and reset links
//! - `JWT_SECRET_KEY` - Session signing secret (min 32 chars, high entropy)
//!
//! ## Optional
//! - `VD_HOST` - Bind address (default: 127.0.0.1)
//! - `VD_PORT` - Listen port (default: 8080)
//! - `VD_DEPLOYMENT_MODE` - `production` or `development` (default: production)
//! - `VD_SESSION_TTL_HOURS` - Session lifetime (default: 24)
//! - `VD_SESSION_COOKIE` - Session cookie name (default: `auth_token`)
//! - `VD_ALLOWED_EMAIL_DOMAINS` - Comma separated registration allow-list (default: any)
//! - `VD_STORE_TIMEOUT_MS` - Per-call store deadline (default: 5000)
//! - `VD_EMAIL_TIMEOUT_MS` - Per-message email deadline (default: 10000)
//! - `VD_SWEEP_INTERVAL_SECS` - Sweep cadence (default: 60)
//! - `VD_RATE_LIMIT` - Per-IP rate limiting on `/api` (default: true)
//! - `SMTP_HOST`, `SMTP_PORT`, `SMTP_USERNAME`, `SMTP_PASSWORD`, `SMTP_FROM` -
//!   outbound email; messages are only logged when `SMTP_HOST` is unset
//! - `GOOGLE_CLIENT_ID`, `GOOGLE_CLIENT_SECRET`, `GOOGLE_REDIRECT_URL` -
//!   federated login; disabled when `GOOGLE_CLIENT_ID` is unset
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment tag

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::TimeDelta;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const MIN_SESSION_SECRET_LENGTH: usize = 32;
const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "secret",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Whether registrations need an emailed confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Confirmation tokens are emailed and must be redeemed.
    Production,
    /// New subjects are confirmed immediately. Never use with real users.
    Development,
}

impl DeploymentMode {
    /// Whether registration should confirm the subject without email.
    #[must_use]
    pub const fn auto_confirms(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(format!("expected production or development, got {other:?}")),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Public base URL, without trailing slash
    pub base_url: String,
    /// Registration confirmation behavior
    pub mode: DeploymentMode,
    /// Session signing and transport
    pub session: SessionConfig,
    /// Ephemeral token lifetimes
    pub tokens: TokenPolicy,
    /// Who may register and with what password
    pub registration: RegistrationPolicy,
    /// Deadlines for blocking collaborators
    pub timeouts: TimeoutConfig,
    /// Background sweep cadence
    pub sweep_interval: Duration,
    /// Whether `/api` routes are rate limited per client IP
    pub rate_limit: bool,
    /// SMTP delivery (None = log only)
    pub smtp: Option<SmtpConfig>,
    /// Google OAuth (None = federated login disabled)
    pub google: Option<GoogleOAuthConfig>,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment tag
    pub sentry_environment: Option<String>,
}

/// Session token settings.
///
/// Implements `Debug` manually to redact the signing key.
#[derive(Clone)]
pub struct SessionConfig {
    /// HMAC signing key. Rotating it invalidates every outstanding session.
    pub secret: SecretString,
    /// Absolute lifetime of a session from issuance.
    pub ttl: TimeDelta,
    /// Cookie carrying the session when no Authorization header is sent.
    pub cookie_name: String,
    /// Whether the cookie gets the `Secure` attribute.
    pub secure_cookie: bool,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("secret", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .field("cookie_name", &self.cookie_name)
            .field("secure_cookie", &self.secure_cookie)
            .finish()
    }
}

/// Lifetimes of single-use tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    /// How long a registration confirmation stays redeemable.
    pub confirmation_ttl: TimeDelta,
    /// How long a password reset stays redeemable.
    pub reset_ttl: TimeDelta,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            confirmation_ttl: TimeDelta::minutes(5),
            reset_ttl: TimeDelta::minutes(30),
        }
    }
}

impl TokenPolicy {
    /// TTL for tokens of the given purpose.
    #[must_use]
    pub const fn ttl_for(&self, purpose: vdiamond_core::TokenPurpose) -> TimeDelta {
        match purpose {
            vdiamond_core::TokenPurpose::ConfirmRegistration => self.confirmation_ttl,
            vdiamond_core::TokenPurpose::ResetPassword => self.reset_ttl,
        }
    }
}

/// Registration rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationPolicy {
    /// Lowercase email domains allowed to register. Empty allows all.
    pub allowed_domains: Vec<String>,
    /// Minimum password length in characters.
    pub min_password_len: usize,
    /// Maximum password length in characters.
    pub max_password_len: usize,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            min_password_len: 6,
            max_password_len: 128,
        }
    }
}

/// Per-call deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Deadline for one store operation.
    pub store: Duration,
    /// Deadline for dispatching one email.
    pub email: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store: Duration::from_secs(5),
            email: Duration::from_secs(10),
        }
    }
}

/// SMTP relay settings.
///
/// Implements `Debug` manually to redact the password.
#[derive(Clone)]
pub struct SmtpConfig {
    /// SMTP relay host
    pub host: String,
    /// SMTP port (STARTTLS)
    pub port: u16,
    /// SMTP username
    pub username: String,
    /// SMTP password
    pub password: SecretString,
    /// From address on outgoing mail
    pub from_address: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("from_address", &self.from_address)
            .finish()
    }
}

/// Google OAuth 2.0 client settings.
///
/// Implements `Debug` manually to redact the client secret.
#[derive(Clone)]
pub struct GoogleOAuthConfig {
    /// OAuth client ID
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: SecretString,
    /// Registered callback URL
    pub redirect_url: String,
}

impl std::fmt::Debug for GoogleOAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleOAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_url", &self.redirect_url)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if secrets fail validation (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = SecretString::from(get_required_env("DATABASE_URL")?);
        let host = parse_env("VD_HOST", "127.0.0.1")?;
        let port = parse_env("VD_PORT", "8080")?;
        let base_url = get_required_env("VD_BASE_URL")?
            .trim_end_matches('/')
            .to_string();
        let mode: DeploymentMode = parse_env("VD_DEPLOYMENT_MODE", "production")?;

        let secret = get_validated_secret("JWT_SECRET_KEY")?;
        validate_session_secret(&secret, "JWT_SECRET_KEY")?;
        let ttl_hours: i64 = parse_env("VD_SESSION_TTL_HOURS", "24")?;
        let session = SessionConfig {
            secret,
            ttl: TimeDelta::hours(ttl_hours),
            cookie_name: get_env_or_default("VD_SESSION_COOKIE", "auth_token"),
            secure_cookie: mode == DeploymentMode::Production,
        };

        let registration = RegistrationPolicy {
            allowed_domains: parse_domain_list(&get_env_or_default("VD_ALLOWED_EMAIL_DOMAINS", "")),
            ..RegistrationPolicy::default()
        };

        let timeouts = TimeoutConfig {
            store: Duration::from_millis(parse_env("VD_STORE_TIMEOUT_MS", "5000")?),
            email: Duration::from_millis(parse_env("VD_EMAIL_TIMEOUT_MS", "10000")?),
        };
        let sweep_interval = Duration::from_secs(parse_env("VD_SWEEP_INTERVAL_SECS", "60")?);
        let rate_limit = parse_env("VD_RATE_LIMIT", "true")?;

        Ok(Self {
            database_url,
            host,
            port,
            base_url,
            mode,
            session,
            tokens: TokenPolicy::default(),
            registration,
            timeouts,
            sweep_interval,
            rate_limit,
            smtp: SmtpConfig::from_env()?,
            google: GoogleOAuthConfig::from_env()?,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Configuration with default policies and a fixed signing key.
    #[cfg(any(test, feature = "testing"))]
    #[must_use]
    pub fn for_testing(mode: DeploymentMode) -> Self {
        Self {
            database_url: SecretString::from("postgres://localhost/vdiamond_test"),
            host: IpAddr::from([127, 0, 0, 1]),
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
            mode,
            session: SessionConfig {
                secret: SecretString::from("tQ8#vL2$nR6!pW4^kJ9&zX3*mB7@fH1%"),
                ttl: TimeDelta::hours(24),
                cookie_name: "auth_token".to_string(),
                secure_cookie: false,
            },
            tokens: TokenPolicy::default(),
            registration: RegistrationPolicy::default(),
            timeouts: TimeoutConfig {
                store: Duration::from_secs(1),
                email: Duration::from_secs(1),
            },
            sweep_interval: Duration::from_secs(60),
            rate_limit: false,
            smtp: None,
            google: None,
            sentry_dsn: None,
            sentry_environment: None,
        }
    }
}

impl SmtpConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(host) = get_optional_env("SMTP_HOST") else {
            return Ok(None);
        };
        Ok(Some(Self {
            host,
            port: parse_env("SMTP_PORT", "587")?,
            username: get_required_env("SMTP_USERNAME")?,
            password: SecretString::from(get_required_env("SMTP_PASSWORD")?),
            from_address: get_env_or_default("SMTP_FROM", "V Diamond <no-reply@vdiamond.dev>"),
        }))
    }
}

impl GoogleOAuthConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(client_id) = get_optional_env("GOOGLE_CLIENT_ID") else {
            return Ok(None);
        };
        Ok(Some(Self {
            client_id,
            client_secret: get_validated_secret("GOOGLE_CLIENT_SECRET")?,
            redirect_url: get_required_env("GOOGLE_REDIRECT_URL")?,
        }))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get an optional environment variable. Empty values count as unset.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default` when unset.
fn parse_env<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env_or_default(key, default)
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

/// Split a comma separated domain list into trimmed lowercase entries.
fn parse_domain_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|d| d.trim().trim_start_matches('@').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

/// Validate that a session secret meets minimum length requirements.
fn validate_session_secret(secret: &SecretString, var_name: &str) -> Result<(), ConfigError> {
    let value = secret.expose_secret();
    if value.len() < MIN_SESSION_SECRET_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "must be at least {} characters (got {})",
                MIN_SESSION_SECRET_LENGTH,
                value.len()
            ),
        ));
    }
    Ok(())
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.chars().count() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)]
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    if let Some(pattern) = PLACEHOLDER_PATTERNS.iter().find(|p| lower.contains(*p)) {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!("appears to be a placeholder (contains '{pattern}')"),
        ));
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated secret."
            ),
        ));
    }

    Ok(())
}

/// Load and validate a secret from environment.
fn get_validated_secret(key: &str) -> Result<SecretString, ConfigError> {
    let value = get_required_env(key)?;
    validate_secret_strength(&value, key)?;
    Ok(SecretString::from(value))
}
