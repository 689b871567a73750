//! Progressive health validation.
//!
//! Thresholds are a function of the current traffic-shift percentage: the
//! system trusts the new path less at low volume and demands near-parity at
//! full cutover. Error-rate and response-time thresholds tighten as the
//! percentage rises; connection-loss tolerance loosens, because connections
//! naturally move between services during an active shift and must not
//! falsely trigger rollback. The message-drop threshold is a constant
//! tripwire, not a tunable.
//!
//! Everything here is pure — no service is ever called from this module.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Message-drop-rate tripwire, constant at every traffic level.
pub const MESSAGE_DROP_THRESHOLD: f64 = 0.01;

// ---------------------------------------------------------------------------
// HealthMetrics
// ---------------------------------------------------------------------------

/// A metrics snapshot computed fresh from both services plus the rollout
/// control on each evaluation. Never stored long-term except inside
/// checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Fraction of requests that errored (0.0–1.0).
    pub error_rate: f64,
    /// Mean response time of the flagged path.
    pub response_time: Duration,
    /// Open connections across both services.
    pub connection_count: u64,
    /// Live subscriptions across both services.
    pub subscription_count: u64,
    /// Fraction of messages dropped (0.0–1.0).
    pub message_drop_rate: f64,
}

// ---------------------------------------------------------------------------
// HealthVerdict
// ---------------------------------------------------------------------------

/// Outcome of evaluating one metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthVerdict {
    /// Whether every threshold passed.
    pub healthy: bool,
    /// One entry per breached threshold; empty when healthy.
    pub reasons: Vec<String>,
}

// ---------------------------------------------------------------------------
// HealthValidator
// ---------------------------------------------------------------------------

/// Pure function set computing progressive pass/fail thresholds and
/// evaluating metrics snapshots against them.
pub struct HealthValidator;

impl HealthValidator {
    /// Maximum tolerated error rate at the given traffic percentage.
    pub fn error_threshold(pct: u8) -> f64 {
        match pct {
            0..=10 => 0.02,
            11..=25 => 0.015,
            26..=50 => 0.01,
            _ => 0.005,
        }
    }

    /// Maximum tolerated mean response time at the given traffic percentage.
    pub fn response_time_threshold(pct: u8) -> Duration {
        match pct {
            0..=10 => Duration::from_millis(800),
            11..=25 => Duration::from_millis(600),
            26..=50 => Duration::from_millis(500),
            _ => Duration::from_millis(400),
        }
    }

    /// Minimum fraction of baseline connections that must still be open at
    /// the given traffic percentage.
    pub fn connection_loss_threshold(pct: u8) -> f64 {
        match pct {
            0..=10 => 0.95,
            11..=25 => 0.90,
            26..=50 => 0.85,
            _ => 0.80,
        }
    }

    /// Evaluate a metrics snapshot against the thresholds for `pct`.
    ///
    /// `baseline_connections` is the connection count captured once at shift
    /// start; a zero baseline disables the retention check.
    pub fn validate(
        metrics: &HealthMetrics,
        pct: u8,
        baseline_connections: u64,
    ) -> HealthVerdict {
        let mut reasons = Vec::new();

        let error_threshold = Self::error_threshold(pct);
        if metrics.error_rate > error_threshold {
            reasons.push(format!(
                "error rate {:.4} exceeds threshold {:.4} at {pct}%",
                metrics.error_rate, error_threshold
            ));
        }

        let response_threshold = Self::response_time_threshold(pct);
        if metrics.response_time > response_threshold {
            reasons.push(format!(
                "response time {:?} exceeds threshold {:?} at {pct}%",
                metrics.response_time, response_threshold
            ));
        }

        if baseline_connections > 0 {
            let retained = metrics.connection_count as f64 / baseline_connections as f64;
            let retention_threshold = Self::connection_loss_threshold(pct);
            if retained < retention_threshold {
                reasons.push(format!(
                    "connection retention {:.3} below threshold {:.3} at {pct}% \
                     ({} of {} baseline connections)",
                    retained, retention_threshold, metrics.connection_count, baseline_connections
                ));
            }
        }

        if metrics.message_drop_rate > MESSAGE_DROP_THRESHOLD {
            reasons.push(format!(
                "message drop rate {:.4} exceeds tripwire {MESSAGE_DROP_THRESHOLD:.2}",
                metrics.message_drop_rate
            ));
        }

        HealthVerdict {
            healthy: reasons.is_empty(),
            reasons,
        }
    }
}
