//! Background reclamation of abandoned registrations.
//!
//! Every cycle lists confirmation tokens that are still `unconfirmed` and
//! older than the confirmation TTL, and hard-deletes each one together with
//! its `pending` subject. Expiry is enforced when a token is redeemed, not
//! here; the sweep only frees the email address and the rows.
//!
//! This is the only place that deletes subjects.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use vdiamond_core::TokenPurpose;

use crate::db::{RepositoryError, Store};
use crate::services::clock::Clock;

/// Outcome of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale tokens found.
    pub scanned: usize,
    /// Registrations deleted.
    pub removed: usize,
    /// Registrations that errored and were skipped.
    pub failed: usize,
}

/// Deletes pending subjects whose confirmation window has passed.
#[derive(Clone)]
pub struct SweepWorker<S> {
    store: S,
    clock: Arc<dyn Clock>,
    ttl: TimeDelta,
    interval: Duration,
}

impl<S: Store> SweepWorker<S> {
    /// `ttl` is the confirmation TTL; `interval` the pause between cycles.
    #[must_use]
    pub fn new(store: S, clock: Arc<dyn Clock>, ttl: TimeDelta, interval: Duration) -> Self {
        Self {
            store,
            clock,
            ttl,
            interval,
        }
    }

    /// Run a single cycle.
    ///
    /// # Errors
    ///
    /// Returns an error only if the stale tokens cannot be listed. Failures
    /// on individual registrations are logged and counted.
    #[instrument(skip_all)]
    pub async fn run_once(&self) -> Result<SweepReport, RepositoryError> {
        let cutoff = self.clock.now() - self.ttl;
        let stale = self
            .store
            .unconfirmed_before(TokenPurpose::ConfirmRegistration, cutoff)
            .await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        for token in stale {
            match self.store.reap_registration(token.id, token.user_id).await {
                Ok(true) => {
                    debug!(token_id = %token.id, user_id = %token.user_id, "Reaped registration");
                    report.removed += 1;
                }
                // Confirmed between the listing and the delete
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        token_id = %token.id,
                        user_id = %token.user_id,
                        error = %e,
                        "Failed to reap registration"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 || report.failed > 0 {
            info!(
                removed = report.removed,
                failed = report.failed,
                "Sweep cycle finished"
            );
        } else {
            debug!(scanned = report.scanned, "Sweep cycle finished");
        }
        Ok(report)
    }

    /// Run cycles until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// The first cycle runs immediately.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(interval_secs = self.interval.as_secs(), "Starting registration sweep");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "Sweep cycle failed");
                        }
                    }
                }
            }

            info!("Registration sweep stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use vdiamond_core::{Email, SubjectStatus, TokenValue};

    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::{CredentialStore, SubjectStore};
    use crate::models::NewSubject;
    use crate::services::clock::ManualClock;

    fn worker(store: &MemoryStore, clock: &Arc<ManualClock>) -> SweepWorker<MemoryStore> {
        SweepWorker::new(
            store.clone(),
            clock.clone(),
            TimeDelta::minutes(5),
            Duration::from_secs(60),
        )
    }

    async fn register(store: &MemoryStore, clock: &ManualClock, email: &str, fill: char) {
        store
            .register_pending(
                NewSubject {
                    email: Email::parse(email).unwrap(),
                    name: "Pending".to_string(),
                    picture: None,
                    password_hash: Some("$argon2id$stub".to_string()),
                    external_id: None,
                    status: SubjectStatus::Pending,
                },
                TokenValue::parse(&fill.to_string().repeat(64)).unwrap(),
                clock.now(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reaps_only_stale_registrations() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        register(&store, &clock, "old@example.com", 'a').await;
        clock.advance(TimeDelta::minutes(3));
        register(&store, &clock, "new@example.com", 'b').await;
        clock.advance(TimeDelta::minutes(3));

        let report = worker(&store, &clock).run_once().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);

        let old = Email::parse("old@example.com").unwrap();
        let new = Email::parse("new@example.com").unwrap();
        assert!(store.subject_by_email(&old).await.unwrap().is_none());
        assert!(store.subject_by_email(&new).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_confirmed_subjects_survive() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        register(&store, &clock, "ada@example.com", 'a').await;
        let token = store
            .token_by_value(&TokenValue::parse(&"a".repeat(64)).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(store.confirm_registration(token.id, token.user_id).await.unwrap());

        clock.advance(TimeDelta::minutes(10));
        let report = worker(&store, &clock).run_once().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert!(store.subject_by_id(token.user_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failures_are_skipped() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        register(&store, &clock, "bad@example.com", 'a').await;
        register(&store, &clock, "good@example.com", 'b').await;
        let bad = store
            .subject_by_email(&Email::parse("bad@example.com").unwrap())
            .await
            .unwrap()
            .unwrap();
        store.fail_reap_for(bad.id);
        clock.advance(TimeDelta::minutes(6));

        let report = worker(&store, &clock).run_once().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 1);
        assert!(store.subject_by_id(bad.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_listing_failure_is_an_error() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        store.set_unavailable(true);

        let err = worker(&store, &clock).run_once().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_worker_stops_on_signal() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        register(&store, &clock, "old@example.com", 'a').await;
        clock.advance(TimeDelta::minutes(6));

        let (tx, rx) = watch::channel(false);
        let handle = worker(&store, &clock).spawn(rx);

        // Let the immediate first tick run
        tokio::time::sleep(Duration::from_millis(10)).await;
        let old = Email::parse("old@example.com").unwrap();
        assert!(store.subject_by_email(&old).await.unwrap().is_none());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
