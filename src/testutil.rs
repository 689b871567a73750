//! Shared fixtures for in-crate unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::service::{
    ConnectionService, ServerHandle, ServiceError, ServiceHealth, ServiceStats,
};

#[derive(Debug, Clone)]
struct TestUser {
    subscriptions: Vec<String>,
    connections: u64,
}

/// Controllable in-memory connection service.
pub(crate) struct TestService {
    name: String,
    users: RwLock<HashMap<String, TestUser>>,
    total_messages: AtomicU64,
    dropped_messages: AtomicU64,
    healthy: AtomicBool,
    fail_reads: AtomicBool,
    initialized: AtomicBool,
}

impl TestService {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            users: RwLock::new(HashMap::new()),
            total_messages: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub(crate) fn add_user(&self, user_id: &str, subscriptions: &[&str], connections: u64) {
        self.users.write().insert(
            user_id.to_string(),
            TestUser {
                subscriptions: subscriptions.iter().map(|s| s.to_string()).collect(),
                connections,
            },
        );
    }

    pub(crate) fn set_subscriptions(&self, user_id: &str, subscriptions: &[&str]) {
        if let Some(user) = self.users.write().get_mut(user_id) {
            user.subscriptions = subscriptions.iter().map(|s| s.to_string()).collect();
        }
    }

    pub(crate) fn set_message_stats(&self, total: u64, dropped: u64) {
        self.total_messages.store(total, Ordering::Relaxed);
        self.dropped_messages.store(dropped, Ordering::Relaxed);
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub(crate) fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub(crate) fn is_initialized(&self) -> bool {
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
impl ConnectionService for TestService {
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
        Ok(self.users.read().get(user_id).is_some_and(|u| u.connections > 0))
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
