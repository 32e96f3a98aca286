//! Password reset flow.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use chrono::TimeDelta;
use tokio::sync::Barrier;
use vdiamond_integration_tests::{PASSWORD, TestApp};
use vdiamond_server::services::auth::AuthError;
use vdiamond_server::services::email::EmailKind;

const NEW_PASSWORD: &str = "a brand new secret";

async fn reset_token(app: &TestApp, email: &str) -> String {
    app.state.reset().forgot(email).await.unwrap();
    app.mailed_token(email, EmailKind::PasswordReset).unwrap()
}

#[tokio::test]
async fn test_reset_token_is_single_use() {
    let app = TestApp::new();
    app.register_active("reset@example.com").await;
    let token = reset_token(&app, "reset@example.com").await;

    app.state.reset().reset(&token, NEW_PASSWORD).await.unwrap();
    let err = app
        .state
        .reset()
        .reset(&token, "yet another secret")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenUsed));

    assert!(
        app.state
            .auth()
            .login("reset@example.com", NEW_PASSWORD)
            .await
            .is_ok()
    );
    let err = app
        .state
        .auth()
        .login("reset@example.com", PASSWORD)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reset_has_one_winner() {
    let app = TestApp::new();
    app.register_active("burst@example.com").await;
    let token = reset_token(&app, "burst@example.com").await;
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let state = app.state.clone();
            let token = token.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                state
                    .reset()
                    .reset(&token, &format!("password number {i}"))
                    .await
            })
        })
        .collect();

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => won += 1,
            Err(e) => assert!(matches!(e, AuthError::TokenUsed), "{e}"),
        }
    }
    assert_eq!(won, 1);
}

#[tokio::test]
async fn test_validate_does_not_consume() {
    let app = TestApp::new();
    app.register_active("peek@example.com").await;
    let token = reset_token(&app, "peek@example.com").await;

    app.state.reset().validate(&token).await.unwrap();
    app.state.reset().validate(&token).await.unwrap();
    app.state.reset().reset(&token, NEW_PASSWORD).await.unwrap();

    let err = app.state.reset().validate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenUsed));
}

#[tokio::test]
async fn test_reset_token_expires() {
    let app = TestApp::new();
    app.register_active("slow@example.com").await;
    let token = reset_token(&app, "slow@example.com").await;

    app.clock.advance(TimeDelta::minutes(31));

    let err = app
        .state
        .reset()
        .reset(&token, NEW_PASSWORD)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenExpired));
}

#[tokio::test]
async fn test_newer_reset_supersedes_older() {
    let app = TestApp::new();
    app.register_active("again@example.com").await;
    let first = reset_token(&app, "again@example.com").await;
    let second = reset_token(&app, "again@example.com").await;

    let err = app.state.reset().validate(&first).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenExpired));
    assert!(app.state.reset().validate(&second).await.is_ok());
}

#[tokio::test]
async fn test_forgot_is_silent_for_unknown_and_pending() {
    let app = TestApp::new();
    app.register_pending("pending@example.com").await;
    let sent_before = app.mailer.sent().len();

    app.state.reset().forgot("ghost@example.com").await.unwrap();
    app.state.reset().forgot("pending@example.com").await.unwrap();

    assert_eq!(app.mailer.sent().len(), sent_before);
}

#[tokio::test]
async fn test_confirmation_token_cannot_reset() {
    let app = TestApp::new();
    let (_, token) = app.register_pending("mixup@example.com").await;

    let err = app
        .state
        .reset()
        .reset(&token, NEW_PASSWORD)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenNotFound));
}
