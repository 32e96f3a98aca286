//! Role management commands.
//!
//! # Usage
//!
//! ```bash
//! vd-cli admin promote -e ops@example.com
//! vd-cli admin demote -e ops@example.com
//! ```
//!
//! The subject must already exist; the role applies from its next request
//! because the session guard reads roles from the store.

use vdiamond_core::{Email, Role};
use vdiamond_server::db::{RepositoryError, SubjectRepository};

use super::{CommandError, connect};

/// Set the role of the subject registered under `email`.
///
/// # Errors
///
/// Returns `CommandError::UnknownSubject` if no subject has that email.
pub async fn set_role(email: &str, role: Role) -> Result<(), CommandError> {
    let email = Email::parse(email)?;
    let pool = connect().await?;

    tracing::info!("Setting role of {} to {}", email, role);
    match SubjectRepository::new(&pool)
        .set_role_by_email(&email, role)
        .await
    {
        Ok(()) => {
            tracing::info!("Role updated");
            Ok(())
        }
        Err(RepositoryError::NotFound) => Err(CommandError::UnknownSubject(email.into_inner())),
        Err(e) => Err(e.into()),
    }
}
