//! Migration error taxonomy.
//!
//! Components raise; only the orchestrator catches and decides remediation.
//! After any rollback (graceful or emergency) the original triggering error
//! is still propagated to the `start_migration` caller — rollback success
//! does not mask the failure.

use std::time::Duration;

use crate::rollout::RolloutError;
use crate::service::ServiceError;

/// Errors produced by the migration orchestrator and its components.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Configuration rejected at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// `initialize` was not called before starting a migration.
    #[error("orchestrator is not initialized")]
    NotInitialized,

    /// A migration is already in progress; no state was mutated.
    #[error("a migration is already in progress")]
    AlreadyInProgress,

    /// The replacement service already owns all traffic; there is nothing
    /// left to migrate.
    #[error("replacement service is already active")]
    AlreadyCutOver,

    /// The standby service never reported healthy during preparation.
    #[error("standby service is not ready: {0}")]
    StandbyNotReady(String),

    /// A connection service call failed.
    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    /// A rollout-control call failed.
    #[error("rollout error: {0}")]
    Rollout(#[from] RolloutError),

    /// Health validation failed at a traffic-shift step.
    #[error("health validation failed at {percentage}%: {}", .reasons.join("; "))]
    HealthCheckFailed {
        /// Traffic percentage at which the check failed.
        percentage: u8,
        /// Human-readable reasons for the failure.
        reasons: Vec<String>,
    },

    /// The rollout control independently signaled a rollback condition.
    #[error("external rollback signal at {percentage}%")]
    RollbackSignaled {
        /// Traffic percentage at which the signal was observed.
        percentage: u8,
    },

    /// Post-shift subscription preservation fell below the acceptance gates.
    #[error(
        "subscription preservation below threshold: overall {overall_rate:.3}, user {user_rate:.3}"
    )]
    PreservationFailed {
        /// Aggregate subscription preservation ratio.
        overall_rate: f64,
        /// Fraction of users with no subscription loss.
        user_rate: f64,
    },

    /// The migration attempt exceeded its overall timeout.
    #[error("migration timed out after {0:?}")]
    Timeout(Duration),
}

/// Migration result type.
pub type Result<T> = std::result::Result<T, MigrationError>;
