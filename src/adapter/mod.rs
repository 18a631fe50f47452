// Adapter contract
// The uniform interface implemented by both engines, plus statement
// classification and health aggregation shared between them.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::EngineKind;
use crate::error::DbError;
use crate::transaction::TransactionContext;
use crate::value::{leading_keyword, QueryOutcome, SqlValue};

pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

/// Statements starting with one of these route to replicas when available
const READ_ONLY_KEYWORDS: [&str; 4] = ["SELECT", "WITH", "EXPLAIN", "SHOW"];

/// Classify a statement by its leading keyword, case-insensitive, leading
/// whitespace ignored. Everything that is not a known read keyword is a write.
pub fn is_read_only(sql: &str) -> bool {
    let keyword = leading_keyword(sql);
    READ_ONLY_KEYWORDS.contains(&keyword.as_str())
}

/// Point-in-time snapshot of connection usage; total = idle + active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub total: u32,
    pub idle: u32,
    pub waiting: u32,
    pub active: u32,
}

impl ConnectionStats {
    /// Connection utilization as a percentage of the pool
    pub fn utilization_pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.total - self.idle) as f64 / self.total as f64 * 100.0
        }
    }
}

/// Health status of an engine or one of its endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Probe outcome for a single replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub name: String,
    pub status: HealthStatus,
    /// Replication lag in seconds, read best-effort during the probe
    pub lag_seconds: Option<f64>,
}

/// Result of probing the adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub connections: ConnectionStats,
    pub replicas: Vec<ReplicaStatus>,
}

/// Aggregate an overall status from the primary probe and replica probes.
/// The primary dominates: if it fails the adapter is unhealthy no matter
/// what the replicas report. With a healthy primary, a partially failing
/// replica set degrades the adapter; a fully failed one is unhealthy.
pub fn aggregate_status(primary_ok: bool, replicas: &[ReplicaStatus]) -> HealthStatus {
    if !primary_ok {
        return HealthStatus::Unhealthy;
    }
    let failed = replicas
        .iter()
        .filter(|r| r.status != HealthStatus::Healthy)
        .count();
    if failed == 0 {
        HealthStatus::Healthy
    } else if failed < replicas.len() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

/// The uniform database contract implemented by every engine
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Capability tag identifying the engine behind this adapter
    fn engine_kind(&self) -> EngineKind;

    /// Execute a SQL statement and return rows, row count and a command tag
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome, DbError>;

    /// Open a transaction bound to a single physical connection
    async fn begin(&self) -> Result<TransactionContext, DbError>;

    /// Probe the engine for liveness
    async fn health_check(&self) -> Result<HealthCheckResult, DbError>;

    /// Synchronous, side-effect-free connection statistics
    fn stats(&self) -> ConnectionStats;

    /// Release all underlying resources. Idempotent; calls already in
    /// flight complete on resources they hold.
    async fn close(&self);
}

impl dyn DatabaseAdapter {
    /// Run a callback against a transaction with exactly-once finalization:
    /// auto-commit when the callback returns normally with the transaction
    /// still open, auto-rollback and rethrow of the original error when it
    /// fails. A rollback failure is logged and never masks the original.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: for<'a> FnOnce(&'a mut TransactionContext) -> BoxFuture<'a, Result<T, DbError>> + Send,
        T: Send,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                if tx.is_open() {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Err(err) => {
                if tx.is_open() {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "rollback after failed transaction callback also failed");
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(name: &str, status: HealthStatus) -> ReplicaStatus {
        ReplicaStatus {
            name: name.to_string(),
            status,
            lag_seconds: None,
        }
    }

    #[test]
    fn test_read_only_classification() {
        assert!(is_read_only("SELECT * FROM bookings"));
        assert!(is_read_only("  select id from drivers"));
        assert!(is_read_only("\n\tWITH cte AS (SELECT 1) SELECT * FROM cte"));
        assert!(is_read_only("EXPLAIN SELECT 1"));
        assert!(is_read_only("show server_version"));

        assert!(!is_read_only("INSERT INTO bookings VALUES (1)"));
        assert!(!is_read_only("UPDATE drivers SET active = true"));
        assert!(!is_read_only("DELETE FROM locations"));
        assert!(!is_read_only("CREATE TABLE t (id INT)"));
        assert!(!is_read_only(""));
    }

    #[test]
    fn test_primary_failure_dominates() {
        let replicas = vec![
            replica("a", HealthStatus::Healthy),
            replica("b", HealthStatus::Healthy),
        ];
        assert_eq!(aggregate_status(false, &replicas), HealthStatus::Unhealthy);
        assert_eq!(aggregate_status(false, &[]), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_mixed_replicas_degrade() {
        let replicas = vec![
            replica("a", HealthStatus::Healthy),
            replica("b", HealthStatus::Unhealthy),
        ];
        assert_eq!(aggregate_status(true, &replicas), HealthStatus::Degraded);
    }

    #[test]
    fn test_all_healthy() {
        let replicas = vec![
            replica("a", HealthStatus::Healthy),
            replica("b", HealthStatus::Healthy),
        ];
        assert_eq!(aggregate_status(true, &replicas), HealthStatus::Healthy);
        assert_eq!(aggregate_status(true, &[]), HealthStatus::Healthy);
    }

    #[test]
    fn test_all_replicas_down() {
        let replicas = vec![
            replica("a", HealthStatus::Unhealthy),
            replica("b", HealthStatus::Unhealthy),
        ];
        assert_eq!(aggregate_status(true, &replicas), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_utilization_pct() {
        let stats = ConnectionStats {
            total: 10,
            idle: 3,
            waiting: 0,
            active: 7,
        };
        assert!((stats.utilization_pct() - 70.0).abs() < f64::EPSILON);
        assert_eq!(ConnectionStats::default().utilization_pct(), 0.0);
    }
}
