//! Integration tests for vdiamond.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p vdiamond-integration-tests
//! ```
//!
//! Everything runs against the in-memory store, a recording mailer and a
//! manual clock, so no database or SMTP server is needed. The same
//! [`TestApp`] drives both the services directly and the full router.
//!
//! # Test Files
//!
//! - `registration` - confirmation races, TTL boundary, resend, email failure
//! - `reset` - single-use reset tokens
//! - `cart` - concurrent cart creation, stock gate, checkout retries
//! - `sweep` - reclamation of abandoned registrations
//! - `http` - the router end to end

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tower::ServiceExt;

use vdiamond_core::{Email, Price, Role};
use vdiamond_server::config::{DeploymentMode, ServerConfig};
use vdiamond_server::db::memory::MemoryStore;
use vdiamond_server::models::{Product, Subject};
use vdiamond_server::services::clock::ManualClock;
use vdiamond_server::services::email::{EmailKind, RecordingMailer};
use vdiamond_server::services::registration::RegisterInput;
use vdiamond_server::state::AppState;

/// Password every helper registers with.
pub const PASSWORD: &str = "correct horse battery";

/// Application wired to in-memory collaborators.
pub struct TestApp {
    pub state: AppState<MemoryStore, RecordingMailer>,
    pub store: MemoryStore,
    pub mailer: RecordingMailer,
    pub clock: Arc<ManualClock>,
}

/// A response with its body decoded as JSON (`Null` if it was not JSON).
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    /// The `code` field of an error body.
    pub fn code(&self) -> &str {
        self.body["code"].as_str().unwrap_or_default()
    }

    /// The first `Set-Cookie` header.
    pub fn set_cookie(&self) -> Option<&str> {
        self.headers
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
    }
}

impl TestApp {
    /// Production mode: registrations need the emailed link.
    pub fn new() -> Self {
        Self::with_mode(DeploymentMode::Production)
    }

    pub fn with_mode(mode: DeploymentMode) -> Self {
        let store = MemoryStore::new();
        let mailer = RecordingMailer::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ));
        let state = AppState::new(
            ServerConfig::for_testing(mode),
            store.clone(),
            mailer.clone(),
            clock.clone(),
        )
        .unwrap();

        Self {
            state,
            store,
            mailer,
            clock,
        }
    }

    pub fn router(&self) -> Router {
        vdiamond_server::app(self.state.clone())
    }

    /// Register a pending subject and return it with its confirmation token.
    pub async fn register_pending(&self, email: &str) -> (Subject, String) {
        let registration = self
            .state
            .registration()
            .register(RegisterInput {
                email: email.to_string(),
                password: PASSWORD.to_string(),
                name: "Test Subject".to_string(),
            })
            .await
            .unwrap();
        let token = self
            .mailer
            .last_token(&registration.subject.email, EmailKind::ConfirmRegistration)
            .unwrap();
        (registration.subject, token.expose().to_string())
    }

    /// Register and confirm a subject.
    pub async fn register_active(&self, email: &str) -> Subject {
        let (_, token) = self.register_pending(email).await;
        self.state.registration().confirm(&token).await.unwrap()
    }

    /// Register, confirm and promote a subject.
    pub async fn register_admin(&self, email: &str) -> Subject {
        let subject = self.register_active(email).await;
        self.state.auth().set_role(subject.id, Role::Admin).await.unwrap()
    }

    /// Session token for an active subject.
    pub async fn login(&self, email: &str) -> String {
        self.state.auth().login(email, PASSWORD).await.unwrap().token
    }

    pub fn product(&self, name: &str, cents: i64, stock: i32) -> Product {
        self.store
            .insert_product(name, Price::from_cents(cents).unwrap(), stock)
    }

    /// Latest token of `kind` mailed to `email`.
    pub fn mailed_token(&self, email: &str, kind: EmailKind) -> Option<String> {
        self.mailer
            .last_token(&Email::parse(email).unwrap(), kind)
            .map(|t| t.expose().to_string())
    }

    /// Send one request through the full router.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}
