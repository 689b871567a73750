//! Migration configuration.
//!
//! Loaded once at orchestrator construction and immutable for the lifetime of
//! the instance. The [`accelerated`](MigrationConfig::accelerated) variant
//! shrinks every delay for test and validation runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

/// Configuration for the connection migration orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rollout feature flag controlling the traffic split.
    pub flag: String,
    /// How long to hold each traffic-shift step before health-checking it.
    /// Backward shifts use half of this delay.
    pub traffic_step_delay: Duration,
    /// Delay between standby readiness probes during preparation.
    pub service_ready_delay: Duration,
    /// Bounded drain period used by the emergency rollback path.
    pub drain_timeout: Duration,
    /// Interval of the background checkpoint recorder.
    pub checkpoint_interval: Duration,
    /// Maximum wall-clock time for one migration attempt. Exceeding it is
    /// treated like a health-validation failure and triggers rollback.
    pub overall_timeout: Duration,
    /// Maximum number of standby readiness probes before giving up.
    pub max_ready_attempts: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            flag: "realtime-connection-migration".to_string(),
            traffic_step_delay: Duration::from_secs(30),
            service_ready_delay: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(10),
            checkpoint_interval: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(30 * 60),
            max_ready_attempts: 5,
        }
    }
}

impl MigrationConfig {
    /// Reduced-delay variant for test and validation runs.
    pub fn accelerated() -> Self {
        Self {
            traffic_step_delay: Duration::from_millis(20),
            service_ready_delay: Duration::from_millis(5),
            drain_timeout: Duration::from_millis(20),
            checkpoint_interval: Duration::from_millis(10),
            overall_timeout: Duration::from_secs(10),
            max_ready_attempts: 2,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    ///
    /// The orchestrator calls this at construction; callers building configs
    /// by hand can use it to fail early.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.flag.trim().is_empty() {
            return Err(MigrationError::Config(
                "rollout flag must not be empty".to_string(),
            ));
        }
        if self.overall_timeout.is_zero() {
            return Err(MigrationError::Config(
                "overall timeout must be non-zero".to_string(),
            ));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(MigrationError::Config(
                "checkpoint interval must be non-zero".to_string(),
            ));
        }
        if self.max_ready_attempts == 0 {
            return Err(MigrationError::Config(
                "max ready attempts must be at least 1".to_string(),
            ));
        }
        if self.overall_timeout <= self.traffic_step_delay {
            return Err(MigrationError::Config(
                "overall timeout must exceed the per-step delay".to_string(),
            ));
        }
        Ok(())
    }
}
