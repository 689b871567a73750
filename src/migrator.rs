//! Connection migration orchestrator.
//!
//! Owns the migration state machine and sequences the three supporting
//! components: state capture, gradual traffic shifting, and preservation
//! validation. Every error raised anywhere in that chain is caught exactly
//! once here, triggers a rollback, and is then re-propagated to the caller —
//! rollback success never masks the failure.
//!
//! # Migration Sequence
//!
//! 1. **Prepare** — enable the rollout flag, wait for the standby service to
//!    report healthy.
//! 2. **Capture** — snapshot every connected user's subscriptions from the
//!    active service.
//! 3. **Shift** — ramp traffic through 10/25/50/75/100%, health-checking
//!    each step.
//! 4. **Validate** — verify subscription preservation against both services.
//! 5. **Finalize** — flip active/standby; the replacement service owns all
//!    connections.
//!
//! Rollback is guarded by a single-slot lock: a second concurrent caller
//! awaits the first rollback's completion and receives the same outcome. If
//! the graceful path fails, the emergency path forces traffic back to legacy
//! without further health checks and never fails.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::health::HealthMetrics;
use crate::progress::{
    now_secs, BlueGreenState, MigrationPhase, MigrationProgress, PhaseRecord,
};
use crate::rollout::{RolloutAnalysis, RolloutControl};
use crate::service::{ServerHandle, ServiceKind, ServiceStats, SharedService};
use crate::state::StateManager;
use crate::traffic::{ShiftDirection, TrafficController};

/// Minimum aggregate subscription preservation ratio to finalize.
pub const OVERALL_PRESERVATION_GATE: f64 = 0.85;

/// Minimum fraction of users without subscription loss to finalize.
pub const USER_PRESERVATION_GATE: f64 = 0.90;

// ---------------------------------------------------------------------------
// Status views
// ---------------------------------------------------------------------------

/// Point-in-time view of the migration for operations consoles.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Progress of the current or most recent attempt, if any.
    pub progress: Option<MigrationProgress>,
    /// Current blue-green routing state.
    pub blue_green: BlueGreenState,
    /// Users currently held by the state manager.
    pub captured_state_count: usize,
    /// Whether the active service currently reports healthy.
    pub healthy: bool,
}

/// Combined metric view across the rollout control and both services.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationMetrics {
    /// Error/latency summary from the rollout control.
    pub rollout: RolloutAnalysis,
    /// Statistics from the legacy service.
    pub legacy_stats: ServiceStats,
    /// Statistics from the replacement service.
    pub replacement_stats: ServiceStats,
    /// Progress of the current or most recent attempt, if any.
    pub progress: Option<MigrationProgress>,
}

/// Serializable snapshot of cumulative orchestrator statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MigratorStatsSnapshot {
    /// Migration attempts started.
    pub attempts: u64,
    /// Attempts that completed successfully.
    pub completed: u64,
    /// Attempts that failed.
    pub failed: u64,
    /// Rollbacks executed.
    pub rolled_back: u64,
}

/// Atomic counters for cumulative orchestrator statistics.
struct MigratorStats {
    attempts: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rolled_back: AtomicU64,
}

impl MigratorStats {
    fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> MigratorStatsSnapshot {
        MigratorStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionMigrator
// ---------------------------------------------------------------------------

/// Orchestrates the blue-green cutover of live connections from the legacy
/// service to its replacement.
///
/// All orchestration state is owned by the instance — separate instances run
/// fully independent migrations. Thread-safe: share via `Arc`.
pub struct ConnectionMigrator {
    config: MigrationConfig,
    legacy: SharedService,
    replacement: SharedService,
    rollout: Arc<dyn RolloutControl>,
    state_manager: StateManager,
    traffic: TrafficController,
    blue_green: Arc<RwLock<BlueGreenState>>,
    progress: Arc<RwLock<Option<MigrationProgress>>>,
    phases: RwLock<Vec<PhaseRecord>>,
    stats: MigratorStats,
    initialized: AtomicBool,
    /// Set once a rollback has completed for the current attempt; a second
    /// caller that waited on the rollback lock observes this and returns the
    /// first caller's outcome.
    rollback_done: AtomicBool,
    rollback_lock: tokio::sync::Mutex<()>,
    checkpoint_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMigrator {
    /// Create an orchestrator over the two services and the rollout control.
    pub fn new(
        config: MigrationConfig,
        legacy: SharedService,
        replacement: SharedService,
        rollout: Arc<dyn RolloutControl>,
    ) -> Result<Self> {
        config.validate()?;
        let traffic = TrafficController::new(
            legacy.clone(),
            replacement.clone(),
            rollout.clone(),
            &config,
        );
        Ok(Self {
            config,
            legacy,
            replacement,
            rollout,
            state_manager: StateManager::new(),
            traffic,
            blue_green: Arc::new(RwLock::new(BlueGreenState::new())),
            progress: Arc::new(RwLock::new(None)),
            phases: RwLock::new(Vec::new()),
            stats: MigratorStats::new(),
            initialized: AtomicBool::new(false),
            rollback_done: AtomicBool::new(false),
            rollback_lock: tokio::sync::Mutex::new(()),
            checkpoint_task: Mutex::new(None),
        })
    }

    /// Hand the server bootstrap handle to both connection services.
    pub async fn initialize(&self, server: &ServerHandle) -> Result<()> {
        self.legacy.initialize(server).await?;
        self.replacement.initialize(server).await?;
        self.initialized.store(true, Ordering::Relaxed);
        info!(server = %server.server_name, "connection services initialized");
        Ok(())
    }

    /// Run one full migration attempt.
    ///
    /// Fails fast without mutating any state if the orchestrator is not
    /// initialized or a migration is already in progress. On any other
    /// failure a rollback runs first, then the original error is returned.
    pub async fn start_migration(&self) -> Result<()> {
        if !self.initialized.load(Ordering::Relaxed) {
            return Err(MigrationError::NotInitialized);
        }
        {
            let mut blue_green = self.blue_green.write();
            if blue_green.migration_in_progress {
                return Err(MigrationError::AlreadyInProgress);
            }
            if blue_green.active() == ServiceKind::Replacement {
                return Err(MigrationError::AlreadyCutOver);
            }
            blue_green.migration_in_progress = true;
        }

        self.rollback_done.store(false, Ordering::SeqCst);
        *self.progress.write() = Some(MigrationProgress::new());
        self.phases.write().clear();
        self.record_phase(MigrationPhase::Preparing, "migration attempt started");
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        info!(flag = %self.config.flag, "starting connection migration");

        let outcome =
            match tokio::time::timeout(self.config.overall_timeout, self.run_migration()).await
            {
                Ok(result) => result,
                Err(_) => Err(MigrationError::Timeout(self.config.overall_timeout)),
            };

        let result = match outcome {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "migration failed, rolling back");
                {
                    let mut progress = self.progress.write();
                    if let Some(p) = progress.as_mut() {
                        p.record_error(err.to_string());
                        p.failed_migrations =
                            p.total_connections.saturating_sub(p.migrated_connections);
                        // A rollback that already completed (concurrent
                        // operator action) owns the terminal phase.
                        if !self.rollback_done.load(Ordering::SeqCst) {
                            p.phase = MigrationPhase::Failed;
                        }
                    }
                }
                self.close_current_phase(Some(err.to_string()));
                self.stats.failed.fetch_add(1, Ordering::Relaxed);

                if let Err(rollback_err) = self.rollback_migration().await {
                    // The rollback path is defined never to fail; log and
                    // keep the original error as the caller-visible one.
                    error!(error = %rollback_err, "rollback reported an error");
                }
                Err(err)
            }
        };

        self.stop_checkpoint_task();
        self.blue_green.write().migration_in_progress = false;
        result
    }

    /// The migration sequence proper. Raises on the first failure; the caller
    /// owns remediation.
    async fn run_migration(&self) -> Result<()> {
        // (a) Standby must be ready before anything moves.
        self.prepare_standby().await?;

        // (b) Snapshot the baseline from the active service.
        let active = self.service_for(self.active_service()).clone();
        let captured = self.state_manager.capture_states(&active).await?;
        {
            let mut progress = self.progress.write();
            if let Some(p) = progress.as_mut() {
                p.total_connections = captured as u64;
            }
        }

        // (c) Ramp traffic toward the replacement.
        self.set_progress_phase(MigrationPhase::Migrating);
        self.record_phase(MigrationPhase::Migrating, "traffic shift started");
        self.spawn_checkpoint_task();

        // Connection-loss checks compare against the count observed once
        // here, not each step's own count — a stable baseline.
        let baseline = self.traffic.collect_metrics().await?.connection_count;

        let total = captured as u64;
        let mut on_progress = |pct: u8, metrics: &HealthMetrics| {
            // A rollback that latched mid-step owns the split percentage from
            // here on; drop stale forward progress.
            if self.rollback_done.load(Ordering::SeqCst)
                || self.rollout.should_trigger_rollback(&self.config.flag)
            {
                return;
            }
            self.blue_green.write().traffic_split_percentage = pct;
            let mut progress = self.progress.write();
            if let Some(p) = progress.as_mut() {
                p.migrated_connections = total * u64::from(pct) / 100;
                p.record_checkpoint(pct, metrics.clone());
            }
        };
        let shift_result = self
            .traffic
            .shift(ShiftDirection::Forward, baseline, Some(&mut on_progress))
            .await;
        self.stop_checkpoint_task();
        shift_result?;

        // (d) The shift succeeded; verify nothing was lost on the way.
        self.set_progress_phase(MigrationPhase::Validating);
        self.record_phase(
            MigrationPhase::Validating,
            "verifying subscription preservation",
        );
        let report = self
            .state_manager
            .validate_preservation(&self.legacy, &self.replacement)
            .await?;
        {
            let mut progress = self.progress.write();
            if let Some(p) = progress.as_mut() {
                p.preserved_subscriptions = report.preserved_subscriptions();
            }
        }
        if report.overall_rate < OVERALL_PRESERVATION_GATE
            || report.user_rate < USER_PRESERVATION_GATE
        {
            return Err(MigrationError::PreservationFailed {
                overall_rate: report.overall_rate,
                user_rate: report.user_rate,
            });
        }

        // (e) Finalize: the replacement service now owns all connections.
        {
            let mut blue_green = self.blue_green.write();
            blue_green.flip();
            blue_green.traffic_split_percentage = 100;
        }
        {
            let mut progress = self.progress.write();
            if let Some(p) = progress.as_mut() {
                p.migrated_connections = p.total_connections;
                p.finish(MigrationPhase::Completed);
            }
        }
        self.record_phase(MigrationPhase::Completed, "migration completed");
        self.state_manager.clear();
        info!("connection migration completed; replacement service is active");
        Ok(())
    }

    /// Enable the rollout flag and poll the standby until it reports healthy.
    async fn prepare_standby(&self) -> Result<()> {
        // Fresh attempt, fresh telemetry: stale error counts or a rollback
        // latched by a previous attempt must not gate this one.
        self.rollout.reset_metrics(&self.config.flag);
        if !self.rollout.is_enabled(&self.config.flag) {
            info!(flag = %self.config.flag, "enabling migration rollout flag");
            self.rollout.toggle_flag(&self.config.flag, true);
        }

        let standby = self.service_for(self.blue_green.read().standby());
        let mut last_detail = String::new();
        for attempt in 1..=self.config.max_ready_attempts {
            match standby.health().await {
                Ok(health) if health.healthy => {
                    info!(service = standby.name(), attempt, "standby service ready");
                    return Ok(());
                }
                Ok(health) => last_detail = health.detail,
                Err(err) => last_detail = err.to_string(),
            }
            debug!(attempt, detail = %last_detail, "standby not ready yet");
            tokio::time::sleep(self.config.service_ready_delay).await;
        }
        Err(MigrationError::StandbyNotReady(last_detail))
    }

    /// Roll traffic back to the legacy service.
    ///
    /// Concurrent callers serialize on a single-slot lock; whoever arrives
    /// second observes the completed rollback and returns the same outcome
    /// instead of starting a duplicate. Never returns an error: a graceful
    /// failure escalates to the emergency path, which is infallible.
    pub async fn rollback_migration(&self) -> Result<()> {
        let _slot = self.rollback_lock.lock().await;
        if self.rollback_done.load(Ordering::SeqCst) {
            debug!("rollback already completed by another caller");
            return Ok(());
        }
        warn!("rolling back connection migration");
        // Latch the rollback signal so an in-flight forward shift stops at
        // its next gate instead of re-raising the percentage under us.
        self.rollout.trigger_rollback(&self.config.flag);

        if let Err(err) = self.graceful_rollback().await {
            error!(error = %err, "graceful rollback failed, engaging emergency rollback");
            self.emergency_rollback().await;
        }

        self.rollback_done.store(true, Ordering::SeqCst);
        self.stats.rolled_back.fetch_add(1, Ordering::Relaxed);
        {
            let mut progress = self.progress.write();
            if let Some(p) = progress.as_mut() {
                p.finish(MigrationPhase::RolledBack);
            }
        }
        self.record_phase(
            MigrationPhase::RolledBack,
            "traffic returned to legacy service",
        );
        self.state_manager.clear();
        info!("rollback complete; legacy service is active");
        Ok(())
    }

    /// Staged backward shift, then disable the migration flag and reset the
    /// blue-green pair.
    async fn graceful_rollback(&self) -> Result<()> {
        let mut on_progress = |pct: u8, _metrics: &HealthMetrics| {
            self.blue_green.write().traffic_split_percentage = pct;
        };
        self.traffic
            .shift(ShiftDirection::Backward, 0, Some(&mut on_progress))
            .await?;

        self.rollout.toggle_flag(&self.config.flag, false);
        self.blue_green.write().reset_to_legacy();
        Ok(())
    }

    /// Last-resort reversion: force the rollout to zero, reset state, and
    /// wait out a short bounded drain. Prioritizes safety over gracefulness;
    /// never fails.
    async fn emergency_rollback(&self) {
        warn!("emergency rollback: forcing traffic to legacy without health checks");
        if let Err(err) = self
            .rollout
            .update_rollout_percentage(&self.config.flag, 0)
        {
            error!(error = %err, "emergency rollback could not zero the rollout percentage");
        }
        self.rollout.toggle_flag(&self.config.flag, false);
        self.blue_green.write().reset_to_legacy();
        tokio::time::sleep(self.config.drain_timeout).await;
    }

    /// Externally-callable escape hatch for an operator or watchdog.
    ///
    /// Bypasses the whole orchestration sequence: forces the rollout to
    /// zero/off and the blue-green pair back to legacy immediately, marking
    /// any in-flight attempt failed. Synchronous, no waiting, never fails.
    pub fn trigger_emergency_rollback(&self) {
        warn!("emergency rollback triggered externally");
        // Latch first: any in-flight forward shift aborts at its next gate
        // and stops reporting progress immediately.
        self.rollout.trigger_rollback(&self.config.flag);
        self.rollback_done.store(true, Ordering::SeqCst);
        self.stop_checkpoint_task();

        if let Err(err) = self
            .rollout
            .update_rollout_percentage(&self.config.flag, 0)
        {
            error!(error = %err, "could not zero rollout percentage during emergency rollback");
        }
        self.rollout.toggle_flag(&self.config.flag, false);

        {
            let mut blue_green = self.blue_green.write();
            blue_green.reset_to_legacy();
            blue_green.migration_in_progress = false;
        }
        {
            let mut progress = self.progress.write();
            if let Some(p) = progress.as_mut() {
                if p.completed_at.is_none() {
                    p.record_error("emergency rollback triggered");
                    p.finish(MigrationPhase::Failed);
                }
            }
        }
        self.record_phase(MigrationPhase::Failed, "emergency rollback triggered");
    }

    // -- observability -------------------------------------------------------

    /// Current migration status. Never fails; a service error surfaces as
    /// `healthy: false`.
    pub async fn migration_status(&self) -> MigrationStatus {
        let healthy = match self.service_for(self.active_service()).health().await {
            Ok(health) => health.healthy,
            Err(_) => false,
        };
        MigrationStatus {
            progress: self.progress.read().clone(),
            blue_green: self.blue_green.read().clone(),
            captured_state_count: self.state_manager.len(),
            healthy,
        }
    }

    /// Combined metrics across the rollout control and both services.
    pub async fn migration_metrics(&self) -> Result<MigrationMetrics> {
        Ok(MigrationMetrics {
            rollout: self.rollout.statistical_analysis(&self.config.flag),
            legacy_stats: self.legacy.stats().await?,
            replacement_stats: self.replacement.stats().await?,
            progress: self.progress.read().clone(),
        })
    }

    /// Whether a migration attempt is currently running.
    pub fn is_migration_in_progress(&self) -> bool {
        self.blue_green.read().migration_in_progress
    }

    /// Which service currently owns connections.
    pub fn active_service(&self) -> ServiceKind {
        self.blue_green.read().active()
    }

    /// Snapshot of the blue-green routing state.
    pub fn blue_green_state(&self) -> BlueGreenState {
        self.blue_green.read().clone()
    }

    /// Ordered history of phase transitions for the current attempt.
    pub fn phase_history(&self) -> Vec<PhaseRecord> {
        self.phases.read().clone()
    }

    /// Cumulative statistics across attempts.
    pub fn stats(&self) -> MigratorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Roll back if mid-migration, then release background resources.
    pub async fn shutdown(&self) {
        if self.is_migration_in_progress() {
            warn!("shutdown requested mid-migration; rolling back first");
            if let Err(err) = self.rollback_migration().await {
                error!(error = %err, "rollback during shutdown failed");
            }
            self.blue_green.write().migration_in_progress = false;
        }
        self.stop_checkpoint_task();
        info!("migration orchestrator shut down");
    }

    // -- internal helpers ----------------------------------------------------

    fn service_for(&self, kind: ServiceKind) -> &SharedService {
        match kind {
            ServiceKind::Legacy => &self.legacy,
            ServiceKind::Replacement => &self.replacement,
        }
    }

    fn set_progress_phase(&self, phase: MigrationPhase) {
        let mut progress = self.progress.write();
        if let Some(p) = progress.as_mut() {
            p.phase = phase;
        }
    }

    /// Start the fixed-interval checkpoint recorder. It only appends to the
    /// bounded checkpoint buffer and exits as soon as the migrating phase
    /// ends.
    fn spawn_checkpoint_task(&self) {
        let progress = Arc::clone(&self.progress);
        let blue_green = Arc::clone(&self.blue_green);
        let traffic = self.traffic.clone();
        let interval = self.config.checkpoint_interval;

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                let migrating = matches!(
                    progress.read().as_ref().map(|p| p.phase),
                    Some(MigrationPhase::Migrating)
                );
                if !migrating {
                    break;
                }
                match traffic.collect_metrics().await {
                    Ok(metrics) => {
                        let pct = blue_green.read().traffic_split_percentage;
                        let mut progress = progress.write();
                        if let Some(p) = progress.as_mut() {
                            p.record_checkpoint(pct, metrics);
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "checkpoint metrics collection failed");
                    }
                }
            }
        });

        if let Some(previous) = self.checkpoint_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_checkpoint_task(&self) {
        if let Some(handle) = self.checkpoint_task.lock().take() {
            handle.abort();
        }
    }

    fn record_phase(&self, phase: MigrationPhase, details: &str) {
        let now = now_secs();
        let mut phases = self.phases.write();
        if let Some(last) = phases.last_mut() {
            if last.completed_at.is_none() {
                last.completed_at = Some(now);
                last.duration_ms = Some(now.saturating_sub(last.started_at) * 1000);
            }
        }
        phases.push(PhaseRecord {
            phase,
            started_at: now,
            completed_at: None,
            duration_ms: None,
            details: details.to_string(),
            error: None,
        });
    }

    fn close_current_phase(&self, error: Option<String>) {
        let now = now_secs();
        let mut phases = self.phases.write();
        if let Some(last) = phases.last_mut() {
            if last.completed_at.is_none() {
                last.completed_at = Some(now);
                last.duration_ms = Some(now.saturating_sub(last.started_at) * 1000);
                last.error = error;
            }
        }
    }
}

impl Drop for ConnectionMigrator {
    fn drop(&mut self) {
        // The checkpoint task holds no reference back to the migrator, but
        // it must not outlive the instance that spawned it.
        self.stop_checkpoint_task();
    }
}
