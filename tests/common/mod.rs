//! Shared test utilities for switchover integration tests.
//!
//! Import via `mod common;` in integration test files.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use switchover::{
    ConnectionService, RolloutAnalysis, RolloutControl, RolloutError, ServerHandle,
    ServiceError, ServiceHealth, ServiceStats,
};

// ============================================================================
// MockConnectionService
// ============================================================================

#[derive(Debug, Clone)]
struct MockUser {
    subscriptions: Vec<String>,
    connections: u64,
}

/// Controllable in-memory connection service for integration tests.
pub struct MockConnectionService {
    name: String,
    users: RwLock<HashMap<String, MockUser>>,
    total_messages: AtomicU64,
    dropped_messages: AtomicU64,
    healthy: AtomicBool,
    fail_reads: AtomicBool,
    initialized: AtomicBool,
}

impl MockConnectionService {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            users: RwLock::new(HashMap::new()),
            total_messages: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn add_user(&self, user_id: &str, subscriptions: Vec<String>, connections: u64) {
        self.users.write().insert(
            user_id.to_string(),
            MockUser {
                subscriptions,
                connections,
            },
        );
    }

    /// Replace a user's subscriptions in place.
    pub fn set_subscriptions(&self, user_id: &str, subscriptions: Vec<String>) {
        if let Some(user) = self.users.write().get_mut(user_id) {
            user.subscriptions = subscriptions;
        }
    }

    pub fn set_message_stats(&self, total: u64, dropped: u64) {
        self.total_messages.store(total, Ordering::Relaxed);
        self.dropped_messages.store(dropped, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    fn check_reads(&self) -> Result<(), ServiceError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            Err(ServiceError::ReadFailed(format!(
                "{} reads disabled",
                self.name
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConnectionService for MockConnectionService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _server: &ServerHandle) -> Result<(), ServiceError> {
        self.initialized.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn connected_users(&self) -> Result<Vec<String>, ServiceError> {
        self.check_reads()?;
        Ok(self.users.read().keys().cloned().collect())
    }

    async fn user_subscriptions(&self, user_id: &str) -> Result<Vec<String>, ServiceError> {
        self.check_reads()?;
        Ok(self
            .users
            .read()
            .get(user_id)
            .map(|u| u.subscriptions.clone())
            .unwrap_or_default())
    }

    async fn connection_count(&self, user_id: &str) -> Result<u64, ServiceError> {
        self.check_reads()?;
        Ok(self.users.read().get(user_id).map_or(0, |u| u.connections))
    }

    async fn is_user_connected(&self, user_id: &str) -> Result<bool, ServiceError> {
        self.check_reads()?;
        Ok(self
            .users
            .read()
            .get(user_id)
            .is_some_and(|u| u.connections > 0))
    }

    async fn stats(&self) -> Result<ServiceStats, ServiceError> {
        self.check_reads()?;
        let users = self.users.read();
        Ok(ServiceStats {
            active_connections: users.values().map(|u| u.connections).sum(),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            total_subscriptions: users.values().map(|u| u.subscriptions.len() as u64).sum(),
        })
    }

    async fn health(&self) -> Result<ServiceHealth, ServiceError> {
        let healthy = self.healthy.load(Ordering::Relaxed);
        Ok(ServiceHealth {
            healthy,
            detail: if healthy {
                "ok".to_string()
            } else {
                format!("{} degraded", self.name)
            },
        })
    }
}

// ============================================================================
// ScriptedRollout
// ============================================================================

type UpdateHook = Box<dyn Fn(u8) + Send + Sync>;

/// Rollout control with scripted, percentage-keyed behavior.
///
/// Error rates and response times are looked up by the currently applied
/// percentage, so a test can make the 50% step unhealthy while every other
/// step passes. Every applied percentage is recorded in order for step
/// sequence assertions.
pub struct ScriptedRollout {
    enabled: RwLock<HashMap<String, bool>>,
    current_pct: Mutex<u8>,
    applied: Mutex<Vec<u8>>,
    error_rate_at: Mutex<HashMap<u8, f64>>,
    response_time_at: Mutex<HashMap<u8, Duration>>,
    /// When set, any percentage update below the current value fails.
    fail_backward_updates: AtomicBool,
    signal_rollback_at: Mutex<Option<u8>>,
    latched: AtomicBool,
    on_update: Mutex<Option<UpdateHook>>,
    resets: AtomicU64,
}

impl ScriptedRollout {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            enabled: RwLock::new(HashMap::new()),
            current_pct: Mutex::new(0),
            applied: Mutex::new(Vec::new()),
            error_rate_at: Mutex::new(HashMap::new()),
            response_time_at: Mutex::new(HashMap::new()),
            fail_backward_updates: AtomicBool::new(false),
            signal_rollback_at: Mutex::new(None),
            latched: AtomicBool::new(false),
            on_update: Mutex::new(None),
            resets: AtomicU64::new(0),
        })
    }

    /// Script the error rate reported while `pct` is applied.
    pub fn set_error_rate_at(&self, pct: u8, rate: f64) {
        self.error_rate_at.lock().insert(pct, rate);
    }

    /// Script the response time reported while `pct` is applied.
    pub fn set_response_time_at(&self, pct: u8, response_time: Duration) {
        self.response_time_at.lock().insert(pct, response_time);
    }

    /// Make any decreasing percentage update fail.
    pub fn fail_backward_updates(&self) {
        self.fail_backward_updates.store(true, Ordering::SeqCst);
    }

    /// Signal a rollback condition while `pct` is applied.
    pub fn signal_rollback_at(&self, pct: u8) {
        *self.signal_rollback_at.lock() = Some(pct);
    }

    /// Run `hook` after every percentage update.
    pub fn set_on_update(&self, hook: impl Fn(u8) + Send + Sync + 'static) {
        *self.on_update.lock() = Some(Box::new(hook));
    }

    /// Every percentage applied so far, in order.
    pub fn applied(&self) -> Vec<u8> {
        self.applied.lock().clone()
    }

    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

impl RolloutControl for ScriptedRollout {
    fn is_enabled(&self, flag: &str) -> bool {
        self.enabled.read().get(flag).copied().unwrap_or(false)
    }

    fn toggle_flag(&self, flag: &str, enabled: bool) {
        self.enabled.write().insert(flag.to_string(), enabled);
    }

    fn update_rollout_percentage(&self, _flag: &str, pct: u8) -> Result<(), RolloutError> {
        let mut current = self.current_pct.lock();
        if self.fail_backward_updates.load(Ordering::SeqCst) && pct < *current {
            return Err(RolloutError::UpdateFailed(format!(
                "scripted failure updating {} -> {pct}",
                *current
            )));
        }
        *current = pct;
        self.applied.lock().push(pct);
        drop(current);
        if let Some(hook) = self.on_update.lock().as_ref() {
            hook(pct);
        }
        Ok(())
    }

    fn rollout_percentage(&self, _flag: &str) -> u8 {
        *self.current_pct.lock()
    }

    fn should_trigger_rollback(&self, _flag: &str) -> bool {
        if self.latched.load(Ordering::SeqCst) {
            return true;
        }
        let current = *self.current_pct.lock();
        *self.signal_rollback_at.lock() == Some(current)
    }

    fn trigger_rollback(&self, _flag: &str) {
        self.latched.store(true, Ordering::SeqCst);
    }

    fn statistical_analysis(&self, _flag: &str) -> RolloutAnalysis {
        let current = *self.current_pct.lock();
        RolloutAnalysis {
            error_rate: self
                .error_rate_at
                .lock()
                .get(&current)
                .copied()
                .unwrap_or(0.0),
            average_response_time: self
                .response_time_at
                .lock()
                .get(&current)
                .copied()
                .unwrap_or(Duration::from_millis(100)),
        }
    }

    fn reset_metrics(&self, _flag: &str) {
        self.latched.store(false, Ordering::SeqCst);
        self.resets.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// `count` topic names with the given prefix.
pub fn topics(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}:{i}")).collect()
}

/// Populate `service` with `users` users of `subs_each` subscriptions each.
pub fn populate(service: &MockConnectionService, users: usize, subs_each: usize) {
    for i in 0..users {
        let user_id = format!("user{i:03}");
        service.add_user(&user_id, topics(&user_id, subs_each), 1);
    }
}

pub fn test_server() -> ServerHandle {
    ServerHandle::new("127.0.0.1:0", "realtime-test")
}
