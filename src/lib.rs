//! # Switchover
//!
//! Zero-downtime blue-green migration orchestrator for live, stateful
//! real-time connections.
//!
//! Switchover moves every connected client from a legacy real-time service to
//! a replacement service while continuously validating system health and
//! automatically rolling back on regression. It decides *which service*
//! currently owns a connection and whether migration should proceed, pause,
//! or reverse — never what data to broadcast.
//!
//! # Components
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`health`] | Progressive pass/fail thresholds as a function of traffic percentage |
//! | [`state`] | Per-user subscription capture and preservation validation |
//! | [`traffic`] | Stepwise traffic shifting through the rollout control |
//! | [`migrator`] | Orchestration, rollback, and the emergency escape hatch |
//!
//! # Migration Lifecycle
//!
//! 1. **Preparing** — rollout flag enabled, standby health-polled.
//! 2. **Migrating** — traffic ramps 10 → 25 → 50 → 75 → 100%, each step
//!    health-gated before the next begins.
//! 3. **Validating** — per-user subscription preservation verified against
//!    both services.
//! 4. **Completed** — active/standby flipped; the replacement owns all
//!    connections.
//!
//! Any failure rolls traffic back in larger strides (75 → 50 → 25 → 0) and
//! re-propagates the original error to the caller.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchover::{ConnectionMigrator, InMemoryRollout, MigrationConfig, ServerHandle};
//!
//! let migrator = ConnectionMigrator::new(
//!     MigrationConfig::default(),
//!     legacy_service,
//!     replacement_service,
//!     Arc::new(InMemoryRollout::new()),
//! )?;
//!
//! migrator.initialize(&ServerHandle::new("0.0.0.0:8080", "realtime")).await?;
//! migrator.start_migration().await?;
//! assert_eq!(migrator.active_service(), switchover::ServiceKind::Replacement);
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod migrator;
pub mod progress;
pub mod rollout;
pub mod service;
pub mod state;
pub mod traffic;

#[cfg(test)]
mod testutil;

pub use config::MigrationConfig;
pub use error::{MigrationError, Result};
pub use health::{HealthMetrics, HealthValidator, HealthVerdict, MESSAGE_DROP_THRESHOLD};
pub use migrator::{
    ConnectionMigrator, MigrationMetrics, MigrationStatus, MigratorStatsSnapshot,
    OVERALL_PRESERVATION_GATE, USER_PRESERVATION_GATE,
};
pub use progress::{
    BlueGreenState, ErrorRecord, MigrationCheckpoint, MigrationPhase, MigrationProgress,
    PhaseRecord, CHECKPOINT_CAPACITY,
};
pub use rollout::{InMemoryRollout, RolloutAnalysis, RolloutControl, RolloutError};
pub use service::{
    ConnectionService, ServerHandle, ServiceError, ServiceHealth, ServiceKind, ServiceStats,
    SharedService,
};
pub use state::{
    ConnectionState, PreservationReport, StateManager, BACKUP_CAPACITY, RESTORATION_THRESHOLD,
};
pub use traffic::{ShiftDirection, TrafficController, BACKWARD_STEPS, FORWARD_STEPS};
