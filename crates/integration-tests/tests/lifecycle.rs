//! Whole account and order lifecycles through the services.

#![allow(clippy::unwrap_used)]

use chrono::TimeDelta;
use vdiamond_core::{CartStatus, Email, SubjectStatus};
use vdiamond_integration_tests::TestApp;
use vdiamond_server::db::SubjectStore;
use vdiamond_server::services::auth::AuthError;
use vdiamond_server::services::cart::CheckoutOutcome;
use vdiamond_server::services::email::EmailKind;
use vdiamond_server::services::registration::RegisterInput;

#[tokio::test]
async fn test_register_confirm_then_login() {
    let app = TestApp::new();

    let registration = app
        .state
        .registration()
        .register(RegisterInput {
            email: "a@gmail.com".to_string(),
            password: "secret1".to_string(),
            name: "Alice".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(registration.subject.status, SubjectStatus::Pending);
    assert!(registration.needs_confirmation);
    assert_eq!(app.mailer.sent().len(), 1);

    let token = app
        .mailed_token("a@gmail.com", EmailKind::ConfirmRegistration)
        .unwrap();
    app.clock.advance(TimeDelta::minutes(3));
    let subject = app.state.registration().confirm(&token).await.unwrap();
    assert_eq!(subject.status, SubjectStatus::Active);

    let login = app.state.auth().login("a@gmail.com", "secret1").await.unwrap();
    assert_eq!(login.subject.id, subject.id);
    assert!(app.state.issuer().verify_session(&login.token).is_ok());
}

#[tokio::test]
async fn test_abandoned_registration_expires_then_is_swept() {
    let app = TestApp::new();
    let (subject, token) = app.register_pending("late@example.com").await;

    app.clock.advance(TimeDelta::minutes(6));
    let err = app.state.registration().confirm(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenExpired));

    let report = app.state.sweep_worker().run_once().await.unwrap();
    assert_eq!(report.removed, 1);

    assert!(app.store.subject_by_id(subject.id).await.unwrap().is_none());
    let email = Email::parse("late@example.com").unwrap();
    assert!(app.store.subject_by_email(&email).await.unwrap().is_none());
}

#[tokio::test]
async fn test_merge_then_checkout_twice() {
    let app = TestApp::new();
    let user = app.register_active("c@example.com").await.id;
    app.login("c@example.com").await;
    let product = app.product("Pendant", 4000, 5);

    app.state.carts().add_item(user, product.id, 2).await.unwrap();
    app.state.carts().add_item(user, product.id, 2).await.unwrap();

    let view = app.state.carts().view(user).await.unwrap();
    assert_eq!(view.lines.len(), 1);
    let line = view.lines.first().unwrap();
    assert_eq!(line.product_id, product.id);
    assert_eq!(line.quantity, 4);
    let cart_id = view.cart.id;

    let first = app.state.carts().checkout(user, Some(cart_id)).await.unwrap();
    assert!(matches!(first, CheckoutOutcome::Closed(_)));
    assert_eq!(first.order().cart.status, CartStatus::Closed);

    let second = app.state.carts().checkout(user, Some(cart_id)).await.unwrap();
    assert!(matches!(second, CheckoutOutcome::AlreadyClosed(_)));
    assert_eq!(second.order(), first.order());
}
