//! Reclamation of abandoned registrations.

#![allow(clippy::unwrap_used)]

use chrono::TimeDelta;
use vdiamond_core::Email;
use vdiamond_integration_tests::TestApp;
use vdiamond_server::db::SubjectStore;
use vdiamond_server::services::sweep::SweepReport;

async fn exists(app: &TestApp, email: &str) -> bool {
    let email = Email::parse(email).unwrap();
    app.store.subject_by_email(&email).await.unwrap().is_some()
}

#[tokio::test]
async fn test_sweep_reaps_only_stale_pending() {
    let app = TestApp::new();
    app.register_pending("stale@example.com").await;
    app.register_active("kept@example.com").await;

    app.clock.advance(TimeDelta::minutes(4));
    app.register_pending("fresh@example.com").await;
    app.clock.advance(TimeDelta::minutes(2));

    let report = app.state.sweep_worker().run_once().await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            scanned: 1,
            removed: 1,
            failed: 0
        }
    );

    assert!(!exists(&app, "stale@example.com").await);
    assert!(exists(&app, "kept@example.com").await);
    assert!(exists(&app, "fresh@example.com").await);
}

#[tokio::test]
async fn test_reaped_email_can_register_again() {
    let app = TestApp::new();
    let (first, _) = app.register_pending("retry@example.com").await;

    app.clock.advance(TimeDelta::minutes(6));
    app.state.sweep_worker().run_once().await.unwrap();

    let (second, token) = app.register_pending("retry@example.com").await;
    assert_ne!(first.id, second.id);
    assert_eq!(app.store.token_count(first.id), 0);
    assert!(app.state.registration().confirm(&token).await.is_ok());
}

#[tokio::test]
async fn test_sweep_counts_failures_and_continues() {
    let app = TestApp::new();
    let (stuck, _) = app.register_pending("stuck@example.com").await;
    app.register_pending("gone@example.com").await;
    app.store.fail_reap_for(stuck.id);

    app.clock.advance(TimeDelta::minutes(10));
    let report = app.state.sweep_worker().run_once().await.unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.removed, 1);
    assert_eq!(report.failed, 1);
    assert!(exists(&app, "stuck@example.com").await);
    assert!(!exists(&app, "gone@example.com").await);
}

#[tokio::test]
async fn test_sweep_reports_unavailable_store() {
    let app = TestApp::new();
    app.store.set_unavailable(true);
    assert!(app.state.sweep_worker().run_once().await.is_err());
}

#[tokio::test]
async fn test_spawned_sweep_stops_on_shutdown() {
    let app = TestApp::new();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = app.state.sweep_worker().spawn(rx);

    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
