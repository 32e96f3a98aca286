//! One-shot registration sweep.
//!
//! Runs exactly one cycle of the server's background sweep. Useful when the
//! server is down or to clear a backlog by hand.

use std::sync::Arc;
use std::time::Duration;

use vdiamond_server::config::TokenPolicy;
use vdiamond_server::db::PgStore;
use vdiamond_server::services::clock::SystemClock;
use vdiamond_server::services::sweep::{SweepReport, SweepWorker};

use super::{CommandError, connect};

/// Per-call store deadline for the sweep.
const STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run one sweep cycle and return what it did.
///
/// # Errors
///
/// Returns an error if the database is unreachable or stale registrations
/// cannot be listed. Individual failures are counted in the report.
pub async fn run() -> Result<SweepReport, CommandError> {
    let pool = connect().await?;
    let worker = SweepWorker::new(
        PgStore::new(pool, STORE_TIMEOUT),
        Arc::new(SystemClock),
        TokenPolicy::default().confirmation_ttl,
        Duration::ZERO,
    );

    Ok(worker.run_once().await?)
}
