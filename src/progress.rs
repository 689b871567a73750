//! Migration progress, checkpoints, and blue-green state.

use std::collections::VecDeque;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::health::HealthMetrics;
use crate::service::ServiceKind;

/// Maximum retained checkpoints; the oldest entry is evicted beyond this.
pub const CHECKPOINT_CAPACITY: usize = 20;

/// Returns the current Unix timestamp in seconds.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// MigrationPhase
// ---------------------------------------------------------------------------

/// Phase of one migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    /// Enabling the rollout flag and waiting for the standby to be ready.
    Preparing,
    /// Shifting traffic toward the replacement service.
    Migrating,
    /// Verifying subscription preservation after the shift.
    Validating,
    /// Migration completed — the replacement service is active.
    Completed,
    /// Migration failed.
    Failed,
    /// Migration was rolled back to the legacy service.
    RolledBack,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::Migrating => write!(f, "migrating"),
            Self::Validating => write!(f, "validating"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

// ---------------------------------------------------------------------------
// MigrationCheckpoint
// ---------------------------------------------------------------------------

/// Immutable snapshot of health metrics plus migration phase, retained for
/// post-hoc diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    /// When the checkpoint was taken.
    pub timestamp: SystemTime,
    /// Phase at checkpoint time.
    pub phase: MigrationPhase,
    /// Traffic percentage at checkpoint time.
    pub traffic_percentage: u8,
    /// Metrics snapshot.
    pub metrics: HealthMetrics,
}

// ---------------------------------------------------------------------------
// ErrorRecord
// ---------------------------------------------------------------------------

/// One error recorded against a migration attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// When the error occurred.
    pub timestamp: SystemTime,
    /// Phase the error occurred in.
    pub phase: MigrationPhase,
    /// Human-readable description.
    pub message: String,
}

// ---------------------------------------------------------------------------
// MigrationProgress
// ---------------------------------------------------------------------------

/// Mutable record of one migration attempt. A fresh instance is created at
/// the start of each attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationProgress {
    /// Current phase.
    pub phase: MigrationPhase,
    /// When the attempt started.
    pub started_at: SystemTime,
    /// When the attempt reached a terminal phase, if it has.
    pub completed_at: Option<SystemTime>,
    /// Users captured for migration.
    pub total_connections: u64,
    /// Users whose traffic has shifted so far.
    pub migrated_connections: u64,
    /// Users that failed to migrate.
    pub failed_migrations: u64,
    /// Subscriptions confirmed preserved after the shift.
    pub preserved_subscriptions: u64,
    /// Errors recorded during the attempt, append-only.
    pub errors: Vec<ErrorRecord>,
    /// Bounded ring of health checkpoints, oldest first.
    pub checkpoints: VecDeque<MigrationCheckpoint>,
}

impl MigrationProgress {
    /// Start a fresh attempt record in the `Preparing` phase.
    pub fn new() -> Self {
        Self {
            phase: MigrationPhase::Preparing,
            started_at: SystemTime::now(),
            completed_at: None,
            total_connections: 0,
            migrated_connections: 0,
            failed_migrations: 0,
            preserved_subscriptions: 0,
            errors: Vec::new(),
            checkpoints: VecDeque::with_capacity(CHECKPOINT_CAPACITY),
        }
    }

    /// Append a checkpoint, evicting the oldest beyond capacity.
    pub fn record_checkpoint(&mut self, traffic_percentage: u8, metrics: HealthMetrics) {
        self.checkpoints.push_back(MigrationCheckpoint {
            timestamp: SystemTime::now(),
            phase: self.phase,
            traffic_percentage,
            metrics,
        });
        while self.checkpoints.len() > CHECKPOINT_CAPACITY {
            self.checkpoints.pop_front();
        }
    }

    /// Append an error tagged with the current phase.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(ErrorRecord {
            timestamp: SystemTime::now(),
            phase: self.phase,
            message: message.into(),
        });
    }

    /// Move to a terminal phase and stamp the completion time.
    pub fn finish(&mut self, phase: MigrationPhase) {
        self.phase = phase;
        self.completed_at = Some(SystemTime::now());
    }
}

impl Default for MigrationProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// PhaseRecord
// ---------------------------------------------------------------------------

/// Historical record of a single phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// The phase this record represents.
    pub phase: MigrationPhase,
    /// Unix timestamp (seconds) when the phase started.
    pub started_at: u64,
    /// Unix timestamp (seconds) when the phase completed, if it has.
    pub completed_at: Option<u64>,
    /// Duration in milliseconds, if the phase has completed.
    pub duration_ms: Option<u64>,
    /// Human-readable details about the transition.
    pub details: String,
    /// Error message, if the phase ended in failure.
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// BlueGreenState
// ---------------------------------------------------------------------------

/// Process-wide blue-green routing state.
///
/// `active != standby` holds at all times: both fields can only change
/// together through [`flip`](Self::flip) or
/// [`reset_to_legacy`](Self::reset_to_legacy).
#[derive(Debug, Clone, Serialize)]
pub struct BlueGreenState {
    active: ServiceKind,
    standby: ServiceKind,
    /// Gate preventing concurrent migration attempts.
    pub migration_in_progress: bool,
    /// Fraction of traffic directed to the replacement service (0–100).
    pub traffic_split_percentage: u8,
}

impl BlueGreenState {
    /// Initial state: legacy active, replacement standby, no traffic shifted.
    pub fn new() -> Self {
        Self {
            active: ServiceKind::Legacy,
            standby: ServiceKind::Replacement,
            migration_in_progress: false,
            traffic_split_percentage: 0,
        }
    }

    /// The service currently owning connections.
    pub fn active(&self) -> ServiceKind {
        self.active
    }

    /// The warm standby service.
    pub fn standby(&self) -> ServiceKind {
        self.standby
    }

    /// Swap active and standby.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.active, &mut self.standby);
    }

    /// Force the pair back to legacy-active with no traffic shifted.
    pub fn reset_to_legacy(&mut self) {
        self.active = ServiceKind::Legacy;
        self.standby = ServiceKind::Replacement;
        self.traffic_split_percentage = 0;
    }
}

impl Default for BlueGreenState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::time::Duration;

    fn sample_metrics() -> HealthMetrics {
        HealthMetrics {
            error_rate: 0.0,
            response_time: Duration::from_millis(100),
            connection_count: 10,
            subscription_count: 20,
            message_drop_rate: 0.0,
        }
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(MigrationPhase::Preparing.to_string(), "preparing");
        assert_eq!(MigrationPhase::Migrating.to_string(), "migrating");
        assert_eq!(MigrationPhase::RolledBack.to_string(), "rolled_back");
    }

    #[test]
    fn test_fresh_progress() {
        let progress = MigrationProgress::new();
        assert_eq!(progress.phase, MigrationPhase::Preparing);
        assert!(progress.completed_at.is_none());
        assert!(progress.errors.is_empty());
        assert!(progress.checkpoints.is_empty());
    }

    #[test]
    fn test_checkpoint_ring_evicts_oldest() {
        let mut progress = MigrationProgress::new();
        progress.phase = MigrationPhase::Migrating;

        for pct in 0..=30u8 {
            progress.record_checkpoint(pct, sample_metrics());
        }

        assert_eq!(progress.checkpoints.len(), CHECKPOINT_CAPACITY);
        // The first eleven entries (0–10) were evicted.
        assert_eq!(progress.checkpoints.front().unwrap().traffic_percentage, 11);
        assert_eq!(progress.checkpoints.back().unwrap().traffic_percentage, 30);
    }

    #[test]
    fn test_error_record_tags_current_phase() {
        let mut progress = MigrationProgress::new();
        progress.phase = MigrationPhase::Validating;
        progress.record_error("preservation below gate");

        assert_eq!(progress.errors.len(), 1);
        assert_eq!(progress.errors[0].phase, MigrationPhase::Validating);
    }

    #[test]
    fn test_finish_stamps_completion() {
        let mut progress = MigrationProgress::new();
        progress.finish(MigrationPhase::Completed);
        assert_eq!(progress.phase, MigrationPhase::Completed);
        assert!(progress.completed_at.is_some());
    }

    #[test]
    fn test_blue_green_invariant_through_flip() {
        let mut state = BlueGreenState::new();
        assert_eq!(state.active(), ServiceKind::Legacy);
        assert_eq!(state.standby(), ServiceKind::Replacement);

        state.flip();
        assert_eq!(state.active(), ServiceKind::Replacement);
        assert_eq!(state.standby(), ServiceKind::Legacy);
        assert_ne!(state.active(), state.standby());

        state.flip();
        assert_ne!(state.active(), state.standby());
    }

    #[test]
    fn test_reset_to_legacy() {
        let mut state = BlueGreenState::new();
        state.flip();
        state.traffic_split_percentage = 100;

        state.reset_to_legacy();
        assert_eq!(state.active(), ServiceKind::Legacy);
        assert_eq!(state.traffic_split_percentage, 0);
        assert_ne!(state.active(), state.standby());
    }
}
