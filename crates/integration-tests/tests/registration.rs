//! Registration and confirmation against the in-memory store.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use chrono::TimeDelta;
use tokio::sync::Barrier;
use vdiamond_core::{Email, SubjectStatus};
use vdiamond_integration_tests::{PASSWORD, TestApp};
use vdiamond_server::config::DeploymentMode;
use vdiamond_server::db::SubjectStore;
use vdiamond_server::error::ErrorKind;
use vdiamond_server::services::auth::AuthError;
use vdiamond_server::services::email::EmailKind;
use vdiamond_server::services::registration::RegisterInput;

fn input(email: &str) -> RegisterInput {
    RegisterInput {
        email: email.to_string(),
        password: PASSWORD.to_string(),
        name: "Ada".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_confirm_has_one_winner() {
    let app = TestApp::new();
    let (subject, token) = app.register_pending("race@example.com").await;
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let state = app.state.clone();
            let token = token.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                state.registration().confirm(&token).await
            })
        })
        .collect();

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => assert!(matches!(e, AuthError::AlreadyConfirmed), "{e}"),
        }
    }
    assert_eq!(won, 1);

    let stored = app.store.subject_by_id(subject.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubjectStatus::Active);
}

#[tokio::test]
async fn test_confirm_inside_ttl_succeeds() {
    let app = TestApp::new();
    let (_, token) = app.register_pending("early@example.com").await;

    app.clock.advance(TimeDelta::minutes(4) + TimeDelta::seconds(59));

    let subject = app.state.registration().confirm(&token).await.unwrap();
    assert!(subject.is_active());
}

#[tokio::test]
async fn test_confirm_past_ttl_is_expired() {
    let app = TestApp::new();
    let (subject, token) = app.register_pending("late@example.com").await;

    app.clock.advance(TimeDelta::minutes(5) + TimeDelta::seconds(1));

    let err = app.state.registration().confirm(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenExpired));
    assert_eq!(err.kind(), ErrorKind::Expired);

    let stored = app.store.subject_by_id(subject.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubjectStatus::Pending);
}

#[tokio::test]
async fn test_second_confirm_reports_already_confirmed() {
    let app = TestApp::new();
    let (_, token) = app.register_pending("twice@example.com").await;

    app.state.registration().confirm(&token).await.unwrap();
    let err = app.state.registration().confirm(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::AlreadyConfirmed));
}

#[tokio::test]
async fn test_unknown_token_not_found() {
    let app = TestApp::new();
    let err = app
        .state
        .registration()
        .confirm(&"ab".repeat(32))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenNotFound));

    let err = app.state.registration().confirm("short").await.unwrap_err();
    assert!(matches!(err, AuthError::TokenNotFound));
}

#[tokio::test]
async fn test_resend_supersedes_previous_token() {
    let app = TestApp::new();
    let (_, first) = app.register_pending("resend@example.com").await;

    app.clock.advance(TimeDelta::minutes(1));
    app.state
        .registration()
        .resend("resend@example.com")
        .await
        .unwrap();
    let second = app
        .mailed_token("resend@example.com", EmailKind::ConfirmRegistration)
        .unwrap();
    assert_ne!(first, second);

    let err = app.state.registration().confirm(&first).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenExpired));
    assert!(app.state.registration().confirm(&second).await.is_ok());
}

#[tokio::test]
async fn test_resend_unknown_email_is_silent() {
    let app = TestApp::new();
    app.state
        .registration()
        .resend("nobody@example.com")
        .await
        .unwrap();
    assert!(app.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_duplicate_email_rejected() {
    let app = TestApp::new();
    app.register_pending("dup@example.com").await;

    let err = app
        .state
        .registration()
        .register(input("DUP@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::EmailAlreadyExists));
}

#[tokio::test]
async fn test_email_failure_leaves_nothing_behind() {
    let app = TestApp::new();
    app.mailer.set_failing(true);

    let err = app
        .state
        .registration()
        .register(input("bounce@example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    let email = Email::parse("bounce@example.com").unwrap();
    assert!(app.store.subject_by_email(&email).await.unwrap().is_none());

    // The address is free for a retry once mail works again
    app.mailer.set_failing(false);
    let retry = app
        .state
        .registration()
        .register(input("bounce@example.com"))
        .await
        .unwrap();
    assert!(retry.needs_confirmation);
}

#[tokio::test]
async fn test_development_mode_confirms_immediately() {
    let app = TestApp::with_mode(DeploymentMode::Development);

    let registration = app
        .state
        .registration()
        .register(input("dev@example.com"))
        .await
        .unwrap();
    assert!(!registration.needs_confirmation);
    assert!(registration.subject.is_active());
    assert!(app.mailer.sent().is_empty());

    assert!(app.state.auth().login("dev@example.com", PASSWORD).await.is_ok());
}

#[tokio::test]
async fn test_login_before_confirmation_rejected() {
    let app = TestApp::new();
    app.register_pending("wait@example.com").await;

    let err = app
        .state
        .auth()
        .login("wait@example.com", PASSWORD)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::EmailNotConfirmed));

    // Wrong password does not reveal the pending state
    let err = app
        .state
        .auth()
        .login("wait@example.com", "not the password")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials));
}

#[tokio::test]
async fn test_registration_provisions_cart() {
    let app = TestApp::new();
    let (subject, _) = app.register_pending("cart@example.com").await;
    assert_eq!(app.store.open_cart_count(subject.id), 1);
}
