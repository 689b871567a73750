//! Gradual traffic shifting between the two connection services.
//!
//! Forward shifts ramp through fixed percentage steps, each gated by a health
//! check before the next begins. Backward shifts retrace in larger strides
//! and at half the stabilization delay — recovery is optimized for speed, and
//! skips the health gate because it is the remediation, not the experiment.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::health::{HealthMetrics, HealthValidator};
use crate::rollout::RolloutControl;
use crate::service::SharedService;

/// Forward traffic-shift steps, in order. No step may be skipped.
pub const FORWARD_STEPS: [u8; 5] = [10, 25, 50, 75, 100];

/// Backward traffic-shift steps, in order. Larger strides than forward for
/// faster recovery.
pub const BACKWARD_STEPS: [u8; 4] = [75, 50, 25, 0];

// ---------------------------------------------------------------------------
// ShiftDirection
// ---------------------------------------------------------------------------

/// Direction of a traffic shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDirection {
    /// Toward the replacement service.
    Forward,
    /// Back toward the legacy service.
    Backward,
}

impl fmt::Display for ShiftDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
        }
    }
}

/// Callback invoked once per completed step with `(percentage, metrics)`.
pub type ProgressFn<'a> = dyn FnMut(u8, &HealthMetrics) + Send + 'a;

// ---------------------------------------------------------------------------
// TrafficController
// ---------------------------------------------------------------------------

/// Drives the step sequence of traffic percentages through the rollout
/// control, stabilizing and health-checking at every forward step.
#[derive(Clone)]
pub struct TrafficController {
    legacy: SharedService,
    replacement: SharedService,
    rollout: Arc<dyn RolloutControl>,
    flag: String,
    step_delay: Duration,
}

impl TrafficController {
    /// Create a controller over the two services and the rollout control.
    pub fn new(
        legacy: SharedService,
        replacement: SharedService,
        rollout: Arc<dyn RolloutControl>,
        config: &MigrationConfig,
    ) -> Self {
        Self {
            legacy,
            replacement,
            rollout,
            flag: config.flag.clone(),
            step_delay: config.traffic_step_delay,
        }
    }

    /// Collect a fresh [`HealthMetrics`] snapshot from both services plus the
    /// rollout control's own error/latency telemetry.
    pub async fn collect_metrics(&self) -> Result<HealthMetrics> {
        let legacy_stats = self.legacy.stats().await?;
        let replacement_stats = self.replacement.stats().await?;
        let analysis = self.rollout.statistical_analysis(&self.flag);

        let total_messages = legacy_stats.total_messages + replacement_stats.total_messages;
        let dropped = legacy_stats.dropped_messages + replacement_stats.dropped_messages;
        let message_drop_rate = if total_messages == 0 {
            0.0
        } else {
            dropped as f64 / total_messages as f64
        };

        Ok(HealthMetrics {
            error_rate: analysis.error_rate,
            response_time: analysis.average_response_time,
            connection_count: legacy_stats.active_connections
                + replacement_stats.active_connections,
            subscription_count: legacy_stats.total_subscriptions
                + replacement_stats.total_subscriptions,
            message_drop_rate,
        })
    }

    /// Walk the step sequence for `direction`.
    ///
    /// At each step: update the rollout percentage, wait for stabilization
    /// (half delay when backward), collect metrics, report progress, and —
    /// forward only — validate health and honor the external rollback
    /// signal. Strictly sequential: no step begins before the previous step's
    /// gate passes.
    ///
    /// `baseline_connections` is captured once by the caller at shift start
    /// and stays fixed for the whole shift.
    pub async fn shift(
        &self,
        direction: ShiftDirection,
        baseline_connections: u64,
        mut on_progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<()> {
        let (steps, delay): (&[u8], Duration) = match direction {
            ShiftDirection::Forward => (&FORWARD_STEPS, self.step_delay),
            ShiftDirection::Backward => (&BACKWARD_STEPS, self.step_delay / 2),
        };

        info!(%direction, ?steps, "starting traffic shift");

        for &pct in steps {
            // A rollback latched between steps (e.g. by a concurrent
            // operator-initiated rollback) stops the ramp before the next
            // percentage is applied.
            if direction == ShiftDirection::Forward
                && self.rollout.should_trigger_rollback(&self.flag)
            {
                warn!(pct, "rollback signal observed before step; aborting shift");
                return Err(MigrationError::RollbackSignaled { percentage: pct });
            }

            self.rollout.update_rollout_percentage(&self.flag, pct)?;
            debug!(pct, %direction, "rollout percentage updated");

            tokio::time::sleep(delay).await;

            let metrics = self.collect_metrics().await?;
            if let Some(cb) = on_progress.as_deref_mut() {
                cb(pct, &metrics);
            }

            if direction == ShiftDirection::Backward {
                continue;
            }

            let verdict = HealthValidator::validate(&metrics, pct, baseline_connections);
            if !verdict.healthy {
                warn!(pct, reasons = ?verdict.reasons, "health validation failed");
                return Err(MigrationError::HealthCheckFailed {
                    percentage: pct,
                    reasons: verdict.reasons,
                });
            }

            if self.rollout.should_trigger_rollback(&self.flag) {
                warn!(pct, "rollout control signaled rollback");
                return Err(MigrationError::RollbackSignaled { percentage: pct });
            }

            info!(pct, "traffic step healthy");
        }

        info!(%direction, "traffic shift complete");
        Ok(())
    }
}
