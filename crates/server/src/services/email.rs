//! Transactional email: registration confirmation and password reset.
//!
//! Messages are rendered from Askama templates into an [`OutboundEmail`] and
//! handed to a [`Mailer`]. Production uses [`EmailService`] (SMTP via lettre,
//! or log-only when SMTP is not configured); tests use `RecordingMailer`.

use std::future::Future;
use std::time::Duration;

use askama::Template;
use chrono::TimeDelta;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{MultiPart, SinglePart, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use secrecy::ExposeSecret;
use thiserror::Error;

use vdiamond_core::{Email, TokenValue};

use crate::config::SmtpConfig;

pub use lettre::transport::smtp::Error as SmtpError;

#[derive(Template)]
#[template(path = "email/confirm_registration.html")]
struct ConfirmRegistrationHtml<'a> {
    name: &'a str,
    link: &'a str,
    ttl_minutes: i64,
}

#[derive(Template)]
#[template(path = "email/confirm_registration.txt")]
struct ConfirmRegistrationText<'a> {
    name: &'a str,
    link: &'a str,
    ttl_minutes: i64,
}

#[derive(Template)]
#[template(path = "email/password_reset.html")]
struct PasswordResetHtml<'a> {
    email: &'a str,
    link: &'a str,
    ttl_minutes: i64,
}

#[derive(Template)]
#[template(path = "email/password_reset.txt")]
struct PasswordResetText<'a> {
    email: &'a str,
    link: &'a str,
    ttl_minutes: i64,
}

/// Errors that can occur when sending email.
#[derive(Debug, Error)]
pub enum MailError {
    /// SMTP transport error.
    #[error("SMTP error: {0}")]
    Smtp(#[from] SmtpError),

    /// Failed to build email message.
    #[error("Failed to build message: {0}")]
    MessageBuild(#[from] lettre::error::Error),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Template rendering error.
    #[error("Template error: {0}")]
    Template(#[from] askama::Error),

    /// Delivery did not finish in time.
    #[error("email delivery exceeded {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The transport refused the message.
    #[error("delivery refused: {0}")]
    Refused(String),
}

/// Which flow a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailKind {
    ConfirmRegistration,
    PasswordReset,
}

/// A rendered message ready for delivery.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub kind: EmailKind,
    pub to: Email,
    pub subject: String,
    /// The action link embedded in the body.
    pub link: String,
    pub text: String,
    pub html: String,
}

impl OutboundEmail {
    /// Render the registration confirmation message.
    ///
    /// # Errors
    ///
    /// Returns `MailError::Template` if rendering fails.
    pub fn confirm_registration(
        to: &Email,
        name: &str,
        link: String,
        ttl: TimeDelta,
    ) -> Result<Self, MailError> {
        let ttl_minutes = ttl.num_minutes();
        let html = ConfirmRegistrationHtml {
            name,
            link: &link,
            ttl_minutes,
        }
        .render()?;
        let text = ConfirmRegistrationText {
            name,
            link: &link,
            ttl_minutes,
        }
        .render()?;

        Ok(Self {
            kind: EmailKind::ConfirmRegistration,
            to: to.clone(),
            subject: "Confirm your email address".to_owned(),
            link,
            text,
            html,
        })
    }

    /// Render the password reset message.
    ///
    /// # Errors
    ///
    /// Returns `MailError::Template` if rendering fails.
    pub fn password_reset(to: &Email, link: String, ttl: TimeDelta) -> Result<Self, MailError> {
        let ttl_minutes = ttl.num_minutes();
        let html = PasswordResetHtml {
            email: to.as_str(),
            link: &link,
            ttl_minutes,
        }
        .render()?;
        let text = PasswordResetText {
            email: to.as_str(),
            link: &link,
            ttl_minutes,
        }
        .render()?;

        Ok(Self {
            kind: EmailKind::PasswordReset,
            to: to.clone(),
            subject: "Reset your password".to_owned(),
            link,
            text,
            html,
        })
    }

    /// The token carried by the action link, if it parses.
    #[must_use]
    pub fn token(&self) -> Option<TokenValue> {
        let (_, query) = self.link.split_once("token=")?;
        let value = query.split('&').next()?;
        TokenValue::parse(value).ok()
    }
}

/// Link that confirms a registration.
#[must_use]
pub fn confirmation_link(base_url: &str, token: &TokenValue) -> String {
    format!(
        "{}/auth/confirm?token={}",
        base_url.trim_end_matches('/'),
        token.expose()
    )
}

/// Link to the reset-password page.
#[must_use]
pub fn reset_link(base_url: &str, token: &TokenValue) -> String {
    format!(
        "{}/reset-password?token={}",
        base_url.trim_end_matches('/'),
        token.expose()
    )
}

/// Something that delivers rendered messages.
pub trait Mailer: Clone + Send + Sync + 'static {
    fn send(&self, email: OutboundEmail) -> impl Future<Output = Result<(), MailError>> + Send;
}

/// Send under a deadline.
///
/// # Errors
///
/// Returns the mailer's error, or `MailError::Timeout` when `limit` elapses.
pub async fn deliver<M: Mailer>(
    mailer: &M,
    email: OutboundEmail,
    limit: Duration,
) -> Result<(), MailError> {
    tokio::time::timeout(limit, mailer.send(email))
        .await
        .map_err(|_| MailError::Timeout(limit))?
}

/// Production mailer.
///
/// Without SMTP configuration, messages are dropped with a log line naming
/// the recipient and subject.
#[derive(Clone)]
pub struct EmailService {
    transport: Option<SmtpTransport>,
}

#[derive(Clone)]
struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
}

impl EmailService {
    /// Create a new email service from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the SMTP relay cannot be configured.
    pub fn new(config: Option<&SmtpConfig>) -> Result<Self, SmtpError> {
        let Some(config) = config else {
            tracing::warn!("SMTP not configured, emails will be logged only");
            return Ok(Self { transport: None });
        };

        let credentials = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(credentials)
            .build();

        Ok(Self {
            transport: Some(SmtpTransport {
                mailer,
                from_address: config.from_address.clone(),
            }),
        })
    }

    /// Log-only service.
    #[must_use]
    pub const fn log_only() -> Self {
        Self { transport: None }
    }
}

impl Mailer for EmailService {
    async fn send(&self, email: OutboundEmail) -> Result<(), MailError> {
        let Some(transport) = &self.transport else {
            tracing::info!(
                to = %email.to,
                subject = %email.subject,
                "SMTP disabled, email not sent"
            );
            return Ok(());
        };

        let message = Message::builder()
            .from(
                transport
                    .from_address
                    .parse()
                    .map_err(|_| MailError::InvalidAddress(transport.from_address.clone()))?,
            )
            .to(email
                .to
                .as_str()
                .parse()
                .map_err(|_| MailError::InvalidAddress(email.to.to_string()))?)
            .subject(&email.subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html),
                    ),
            )?;

        transport.mailer.send(message).await?;

        tracing::info!(to = %email.to, subject = %email.subject, "Email sent successfully");
        Ok(())
    }
}

#[cfg(any(test, feature = "testing"))]
pub use recording::RecordingMailer;

#[cfg(any(test, feature = "testing"))]
mod recording {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    use vdiamond_core::{Email, TokenValue};

    use super::{MailError, EmailKind, Mailer, OutboundEmail};

    /// Mailer that keeps every message in memory.
    #[derive(Clone, Default)]
    pub struct RecordingMailer {
        sent: Arc<Mutex<Vec<OutboundEmail>>>,
        failing: Arc<AtomicBool>,
    }

    impl RecordingMailer {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent send fail.
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Everything delivered so far.
        #[must_use]
        pub fn sent(&self) -> Vec<OutboundEmail> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Token from the most recent message of `kind` sent to `to`.
        #[must_use]
        pub fn last_token(&self, to: &Email, kind: EmailKind) -> Option<TokenValue> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .rev()
                .find(|m| &m.to == to && m.kind == kind)
                .and_then(OutboundEmail::token)
        }
    }

    impl Mailer for RecordingMailer {
        async fn send(&self, email: OutboundEmail) -> Result<(), MailError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MailError::Refused("recording mailer set to fail".to_owned()));
            }
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(email);
            Ok(())
        }
    }
}
