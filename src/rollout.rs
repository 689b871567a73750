//! Rollout-percentage control.
//!
//! The traffic split between the two connection services is driven through a
//! feature-flag store with percentage rollout. The store also accumulates
//! error/latency telemetry for the flagged path and can independently signal
//! a rollback condition; the orchestrator honors that signal at every traffic
//! step.
//!
//! [`InMemoryRollout`] is a complete process-local implementation suitable
//! for single-process deployments and validation runs.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// RolloutError
// ---------------------------------------------------------------------------

/// Errors raised by the rollout control.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RolloutError {
    /// The percentage update could not be applied.
    #[error("rollout update failed: {0}")]
    UpdateFailed(String),
}

// ---------------------------------------------------------------------------
// RolloutAnalysis
// ---------------------------------------------------------------------------

/// Statistical summary of the flagged path's observed behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RolloutAnalysis {
    /// Fraction of requests that errored (0.0–1.0).
    pub error_rate: f64,
    /// Mean response time across recorded requests.
    pub average_response_time: Duration,
}

impl Default for RolloutAnalysis {
    fn default() -> Self {
        Self {
            error_rate: 0.0,
            average_response_time: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// RolloutControl
// ---------------------------------------------------------------------------

/// Interface over the feature-flag / rollout-percentage store.
///
/// All operations are synchronous — the store is in-process. This keeps the
/// emergency rollback path free of suspension points.
pub trait RolloutControl: Send + Sync {
    /// Whether the flag is enabled at all.
    fn is_enabled(&self, flag: &str) -> bool;

    /// Enable or disable the flag entirely.
    fn toggle_flag(&self, flag: &str, enabled: bool);

    /// Set the rollout percentage (0–100, clamped) for the flag.
    fn update_rollout_percentage(&self, flag: &str, pct: u8) -> Result<(), RolloutError>;

    /// Current rollout percentage for the flag.
    fn rollout_percentage(&self, flag: &str) -> u8;

    /// Whether the store has independently decided the flagged path should be
    /// rolled back.
    fn should_trigger_rollback(&self, flag: &str) -> bool;

    /// Latch the rollback condition for the flag.
    fn trigger_rollback(&self, flag: &str);

    /// Error-rate and latency summary for the flagged path.
    fn statistical_analysis(&self, flag: &str) -> RolloutAnalysis;

    /// Clear accumulated telemetry (and any latched rollback) for the flag.
    fn reset_metrics(&self, flag: &str);
}

// ---------------------------------------------------------------------------
// InMemoryRollout
// ---------------------------------------------------------------------------

/// Per-flag state held by [`InMemoryRollout`].
#[derive(Debug, Default)]
struct FlagState {
    enabled: bool,
    percentage: u8,
    rollback_latched: bool,
    requests: u64,
    errors: u64,
    latency_sum_us: u64,
}

impl FlagState {
    fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.errors as f64 / self.requests as f64
    }
}

/// Process-local rollout control.
///
/// Tracks per-flag enablement, rollout percentage, and request telemetry.
/// The rollback signal fires when it has been latched explicitly or when the
/// observed error rate exceeds the trip threshold over a minimum sample.
pub struct InMemoryRollout {
    flags: RwLock<HashMap<String, FlagState>>,
    /// Error-rate fraction above which the rollback signal trips.
    trip_error_rate: f64,
    /// Minimum recorded requests before the trip threshold applies.
    min_sample: u64,
}

impl InMemoryRollout {
    /// Create a rollout control with the default 5% trip threshold over a
    /// 50-request minimum sample.
    pub fn new() -> Self {
        Self {
            flags: RwLock::new(HashMap::new()),
            trip_error_rate: 0.05,
            min_sample: 50,
        }
    }

    /// Override the automatic rollback trip threshold.
    pub fn with_trip_threshold(mut self, error_rate: f64, min_sample: u64) -> Self {
        self.trip_error_rate = error_rate;
        self.min_sample = min_sample;
        self
    }

    /// Record the outcome of one request on the flagged path.
    pub fn record_request(&self, flag: &str, success: bool, latency: Duration) {
        let mut flags = self.flags.write();
        let state = flags.entry(flag.to_string()).or_default();
        state.requests += 1;
        state.latency_sum_us += latency.as_micros() as u64;
        if !success {
            state.errors += 1;
        }
    }
}

impl Default for InMemoryRollout {
    fn default() -> Self {
        Self::new()
    }
}

impl RolloutControl for InMemoryRollout {
    fn is_enabled(&self, flag: &str) -> bool {
        self.flags.read().get(flag).is_some_and(|s| s.enabled)
    }

    fn toggle_flag(&self, flag: &str, enabled: bool) {
        let mut flags = self.flags.write();
        let state = flags.entry(flag.to_string()).or_default();
        if state.enabled != enabled {
            info!(flag, enabled, "rollout flag toggled");
        }
        state.enabled = enabled;
    }

    fn update_rollout_percentage(&self, flag: &str, pct: u8) -> Result<(), RolloutError> {
        let mut flags = self.flags.write();
        let state = flags.entry(flag.to_string()).or_default();
        state.percentage = pct.min(100);
        Ok(())
    }

    fn rollout_percentage(&self, flag: &str) -> u8 {
        self.flags.read().get(flag).map_or(0, |s| s.percentage)
    }

    fn should_trigger_rollback(&self, flag: &str) -> bool {
        let flags = self.flags.read();
        let Some(state) = flags.get(flag) else {
            return false;
        };
        if state.rollback_latched {
            return true;
        }
        state.requests >= self.min_sample && state.error_rate() > self.trip_error_rate
    }

    fn trigger_rollback(&self, flag: &str) {
        warn!(flag, "rollback condition latched");
        let mut flags = self.flags.write();
        flags.entry(flag.to_string()).or_default().rollback_latched = true;
    }

    fn statistical_analysis(&self, flag: &str) -> RolloutAnalysis {
        let flags = self.flags.read();
        let Some(state) = flags.get(flag) else {
            return RolloutAnalysis::default();
        };
        let average = if state.requests == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(state.latency_sum_us / state.requests)
        };
        RolloutAnalysis {
            error_rate: state.error_rate(),
            average_response_time: average,
        }
    }

    fn reset_metrics(&self, flag: &str) {
        let mut flags = self.flags.write();
        if let Some(state) = flags.get_mut(flag) {
            state.requests = 0;
            state.errors = 0;
            state.latency_sum_us = 0;
            state.rollback_latched = false;
        }
    }
}
