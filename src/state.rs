//! Per-user connection-state capture and subscription preservation.
//!
//! Before traffic moves, the state manager snapshots every connected user's
//! subscriptions from the active service; after the shift it verifies against
//! both services that those subscriptions survived the handover. A small
//! rolling backup is retained per user so a botched capture can be diagnosed
//! against earlier versions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::service::SharedService;

/// Retained backup versions per user; the oldest is evicted beyond this.
pub const BACKUP_CAPACITY: usize = 5;

/// Fraction of expected subscriptions below which best-effort restoration is
/// attempted for an individual user.
pub const RESTORATION_THRESHOLD: f64 = 0.5;

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Snapshot of one user's connection and subscriptions, taken at capture
/// time. Discarded at migration end — never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    /// User identity. Identity, not ownership.
    pub user_id: String,
    /// Synthetic id generated at capture time.
    pub connection_id: String,
    /// Topics the user was subscribed to; order-irrelevant.
    pub subscriptions: HashSet<String>,
    /// Last observed activity.
    pub last_activity: SystemTime,
    /// When the snapshot considers the connection established.
    pub connection_time: SystemTime,
    /// Free-form metadata, e.g. the original connection count.
    pub metadata: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// PreservationReport
// ---------------------------------------------------------------------------

/// Outcome of post-shift subscription verification.
///
/// Two independent metrics are tracked because a small aggregate loss
/// concentrated in few users is a materially different risk than a uniform
/// small loss spread across all users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreservationReport {
    /// Aggregate preserved/expected subscription ratio.
    pub overall_rate: f64,
    /// Fraction of users with no subscription loss.
    pub user_rate: f64,
    /// Users whose actual subscription count fell below expected.
    pub users_with_loss: u64,
    /// Users that were captured.
    pub total_users: u64,
    /// Subscriptions that were captured.
    pub total_subscriptions: u64,
}

impl PreservationReport {
    /// Total subscriptions confirmed preserved.
    pub fn preserved_subscriptions(&self) -> u64 {
        (self.overall_rate * self.total_subscriptions as f64).round() as u64
    }
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// Captures per-user connection snapshots before migration and verifies
/// subscription preservation afterwards.
pub struct StateManager {
    /// States captured for the current attempt, keyed by user id.
    states: RwLock<HashMap<String, ConnectionState>>,
    /// Rolling backups per user, newest last. Retained across attempts.
    backups: RwLock<HashMap<String, VecDeque<ConnectionState>>>,
    /// Best-effort restorations attempted so far.
    restorations_attempted: AtomicU64,
}

impl StateManager {
    /// Create an empty state manager.
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            backups: RwLock::new(HashMap::new()),
            restorations_attempted: AtomicU64::new(0),
        }
    }

    /// Snapshot every connected user from the **active** service.
    ///
    /// Users with no live connection are skipped. Any service read error
    /// propagates — migration must not start from an unknown baseline.
    /// Returns the number of users captured.
    pub async fn capture_states(&self, active: &SharedService) -> Result<usize> {
        let users = active.connected_users().await?;
        let mut captured: HashMap<String, ConnectionState> = HashMap::new();

        for user_id in users {
            let connections = active.connection_count(&user_id).await?;
            if connections == 0 {
                continue;
            }
            let subscriptions: HashSet<String> = active
                .user_subscriptions(&user_id)
                .await?
                .into_iter()
                .collect();

            let now = SystemTime::now();
            let mut metadata = HashMap::new();
            metadata.insert(
                "original_connection_count".to_string(),
                connections.to_string(),
            );

            captured.insert(
                user_id.clone(),
                ConnectionState {
                    user_id,
                    connection_id: Uuid::new_v4().to_string(),
                    subscriptions,
                    last_activity: now,
                    connection_time: now,
                    metadata,
                },
            );
        }

        {
            let mut backups = self.backups.write();
            for state in captured.values() {
                let ring = backups.entry(state.user_id.clone()).or_default();
                ring.push_back(state.clone());
                while ring.len() > BACKUP_CAPACITY {
                    ring.pop_front();
                }
            }
        }

        let count = captured.len();
        let subscription_total: usize = captured.values().map(|s| s.subscriptions.len()).sum();
        *self.states.write() = captured;

        info!(
            service = active.name(),
            users = count,
            subscriptions = subscription_total,
            "captured connection states"
        );
        Ok(count)
    }

    /// Verify that captured subscriptions survived the handover.
    ///
    /// A user may be mid-transition and visible on either service, so the
    /// per-user "actual" count is the maximum reported by the two. Users
    /// whose actual count falls below [`RESTORATION_THRESHOLD`] of expected
    /// get a best-effort restoration attempt.
    pub async fn validate_preservation(
        &self,
        legacy: &SharedService,
        replacement: &SharedService,
    ) -> Result<PreservationReport> {
        let captured = self.states();

        let mut expected_total: u64 = 0;
        let mut actual_total: u64 = 0;
        let mut users_with_loss: u64 = 0;

        for (user_id, state) in &captured {
            let expected = state.subscriptions.len() as u64;
            let on_legacy = legacy.user_subscriptions(user_id).await?.len() as u64;
            let on_replacement = replacement.user_subscriptions(user_id).await?.len() as u64;
            let actual = on_legacy.max(on_replacement);

            expected_total += expected;
            actual_total += actual;

            if actual < expected {
                users_with_loss += 1;
                debug!(
                    user_id,
                    expected, actual, "subscription loss detected for user"
                );
                if expected > 0 && (actual as f64 / expected as f64) < RESTORATION_THRESHOLD {
                    self.attempt_restoration(user_id, state, actual);
                }
            }
        }

        let total_users = captured.len() as u64;
        let overall_rate = if expected_total == 0 {
            1.0
        } else {
            actual_total as f64 / expected_total as f64
        };
        let user_rate = if total_users == 0 {
            1.0
        } else {
            (total_users - users_with_loss) as f64 / total_users as f64
        };

        let report = PreservationReport {
            overall_rate,
            user_rate,
            users_with_loss,
            total_users,
            total_subscriptions: expected_total,
        };
        info!(
            overall_rate = format!("{overall_rate:.3}"),
            user_rate = format!("{user_rate:.3}"),
            users_with_loss,
            total_users,
            "subscription preservation validated"
        );
        Ok(report)
    }

    /// Best-effort restoration for a user with severe subscription loss.
    ///
    /// Actual re-subscription is the connection service's own responsibility;
    /// this records and logs the attempt so operators can follow up.
    fn attempt_restoration(&self, user_id: &str, expected: &ConnectionState, actual: u64) {
        let versions = self
            .backups
            .read()
            .get(user_id)
            .map_or(0, VecDeque::len);
        self.restorations_attempted.fetch_add(1, Ordering::Relaxed);
        warn!(
            user_id,
            expected = expected.subscriptions.len(),
            actual,
            backup_versions = versions,
            "attempting best-effort subscription restoration"
        );
    }

    /// Defensive copy of the captured states.
    pub fn states(&self) -> HashMap<String, ConnectionState> {
        self.states.read().clone()
    }

    /// Number of users currently captured.
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether no states are captured.
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Retained backup versions for a user, oldest first.
    pub fn backups_for(&self, user_id: &str) -> Vec<ConnectionState> {
        self.backups
            .read()
            .get(user_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Restorations attempted since construction.
    pub fn restorations_attempted(&self) -> u64 {
        self.restorations_attempted.load(Ordering::Relaxed)
    }

    /// Discard captured states. Backups are retained.
    pub fn clear(&self) {
        self.states.write().clear();
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
