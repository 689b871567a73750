//! Connection-service interface.
//!
//! The orchestrator coordinates two structurally identical real-time
//! connection services — the legacy one and its replacement. Both are modeled
//! behind one explicit trait with the read operations the migration needs;
//! nothing here assumes field-level structural compatibility between the two
//! implementations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ServiceKind
// ---------------------------------------------------------------------------

/// Identifies which side of the blue-green pair a service occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    /// The legacy real-time service currently holding production traffic.
    Legacy,
    /// The replacement real-time service being migrated to.
    Replacement,
}

impl ServiceKind {
    /// The opposite side of the pair.
    pub fn other(self) -> Self {
        match self {
            Self::Legacy => Self::Replacement,
            Self::Replacement => Self::Legacy,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Replacement => write!(f, "replacement"),
        }
    }
}

// ---------------------------------------------------------------------------
// ServerHandle
// ---------------------------------------------------------------------------

/// Opaque handle to the HTTP server bootstrap, passed through to each
/// connection service at initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHandle {
    /// Address the server is bound to.
    pub bind_addr: String,
    /// Human-readable server name for logs.
    pub server_name: String,
}

impl ServerHandle {
    /// Create a handle for the given bind address and name.
    pub fn new(bind_addr: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            server_name: server_name.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceStats / ServiceHealth
// ---------------------------------------------------------------------------

/// Point-in-time throughput statistics reported by a connection service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Currently open client connections.
    pub active_connections: u64,
    /// Messages delivered since service start.
    pub total_messages: u64,
    /// Messages dropped since service start.
    pub dropped_messages: u64,
    /// Live topic subscriptions across all users.
    pub total_subscriptions: u64,
}

/// Health report from a connection service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Whether the service considers itself healthy.
    pub healthy: bool,
    /// Free-form diagnostic detail.
    pub detail: String,
}

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

/// Errors raised by a connection service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// The service could not be reached.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Initialization failed.
    #[error("initialization failed: {0}")]
    InitFailed(String),
}

// ---------------------------------------------------------------------------
// ConnectionService
// ---------------------------------------------------------------------------

/// Read interface over one real-time connection service.
///
/// Implementations hold and serve live client connections; the orchestrator
/// only observes them. All methods are expected to complete quickly — none is
/// awaited concurrently with anything else.
#[async_trait]
pub trait ConnectionService: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Hand the server bootstrap handle to the service.
    async fn initialize(&self, server: &ServerHandle) -> Result<(), ServiceError>;

    /// All users with at least one open connection.
    async fn connected_users(&self) -> Result<Vec<String>, ServiceError>;

    /// Topics the given user is subscribed to.
    async fn user_subscriptions(&self, user_id: &str) -> Result<Vec<String>, ServiceError>;

    /// Number of open connections for the given user.
    async fn connection_count(&self, user_id: &str) -> Result<u64, ServiceError>;

    /// Whether the given user currently has an open connection.
    async fn is_user_connected(&self, user_id: &str) -> Result<bool, ServiceError>;

    /// Current throughput statistics.
    async fn stats(&self) -> Result<ServiceStats, ServiceError>;

    /// Current health report.
    async fn health(&self) -> Result<ServiceHealth, ServiceError>;
}

/// Shared handle to a connection service.
pub type SharedService = Arc<dyn ConnectionService>;
