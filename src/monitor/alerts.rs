// Alerting
// Alert model and the per-cycle threshold rules. Rules are evaluated
// independently; multiple may fire in one cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{EngineKind, MonitorSettings};
use crate::monitor::metrics::DatabaseMetrics;

/// Slow queries in one interval beyond this raise a warning
pub(crate) const SLOW_QUERY_HIGH_WATER: u64 = 10;
/// p99 response time beyond this is critical
pub(crate) const P99_CEILING_MS: f64 = 5_000.0;
/// Failed logins in the trailing window beyond this are critical
pub(crate) const FAILED_LOGIN_CEILING: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConnectionUtilization,
    SlowQueries,
    ResponseTime,
    FailedLogins,
    PrivilegeEscalation,
    HealthCheck,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlertKind::ConnectionUtilization => "connection_utilization",
            AlertKind::SlowQueries => "slow_queries",
            AlertKind::ResponseTime => "response_time",
            AlertKind::FailedLogins => "failed_logins",
            AlertKind::PrivilegeEscalation => "privilege_escalation",
            AlertKind::HealthCheck => "health_check",
        };
        write!(f, "{}", name)
    }
}

/// An operational alert. Unresolved alerts live until explicitly resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub(crate) fn new(level: AlertLevel, kind: AlertKind, message: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            level,
            kind,
            message,
            timestamp: Utc::now(),
            acknowledged: false,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// A rule that fired, ready to be turned into a stored alert
pub(crate) type PendingAlert = (AlertLevel, AlertKind, String);

/// Evaluate every alert rule against one snapshot. Utilization is
/// suppressed for the single-handle engine, where the one connection would
/// read as 100% for the duration of any in-flight statement.
pub(crate) fn evaluate(
    snapshot: &DatabaseMetrics,
    engine: EngineKind,
    settings: &MonitorSettings,
) -> Vec<PendingAlert> {
    let mut pending = Vec::new();

    if engine != EngineKind::Sqlite && snapshot.connections.total > 0 {
        let pct = snapshot.connections.utilization_pct();
        if pct >= settings.utilization_critical_pct {
            pending.push((
                AlertLevel::Critical,
                AlertKind::ConnectionUtilization,
                format!("Connection utilization at {:.1}%", pct),
            ));
        } else if pct >= settings.utilization_warning_pct {
            pending.push((
                AlertLevel::Warning,
                AlertKind::ConnectionUtilization,
                format!("Connection utilization at {:.1}%", pct),
            ));
        }
    }

    if snapshot.query_performance.slow_query_count > SLOW_QUERY_HIGH_WATER {
        pending.push((
            AlertLevel::Warning,
            AlertKind::SlowQueries,
            format!(
                "{} slow queries in the last interval",
                snapshot.query_performance.slow_query_count
            ),
        ));
    }

    if snapshot.query_performance.p99_response_ms > P99_CEILING_MS {
        pending.push((
            AlertLevel::Critical,
            AlertKind::ResponseTime,
            format!(
                "p99 response time at {:.0}ms",
                snapshot.query_performance.p99_response_ms
            ),
        ));
    }

    if snapshot.security.failed_logins > FAILED_LOGIN_CEILING {
        pending.push((
            AlertLevel::Critical,
            AlertKind::FailedLogins,
            format!(
                "{} failed logins in the last hour",
                snapshot.security.failed_logins
            ),
        ));
    }

    if snapshot.security.privilege_escalations > 0 {
        pending.push((
            AlertLevel::Critical,
            AlertKind::PrivilegeEscalation,
            format!(
                "{} privilege escalation attempts detected",
                snapshot.security.privilege_escalations
            ),
        ));
    }

    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ConnectionStats;
    use crate::monitor::metrics::{QueryPerformance, SecurityMetrics, SystemHealth};

    fn snapshot() -> DatabaseMetrics {
        DatabaseMetrics {
            timestamp: Utc::now(),
            connections: ConnectionStats {
                total: 10,
                idle: 9,
                waiting: 0,
                active: 1,
            },
            query_performance: QueryPerformance::default(),
            system_health: SystemHealth::default(),
            security: SecurityMetrics::default(),
            errors: 0,
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings::default()
    }

    #[test]
    fn test_quiet_snapshot_raises_nothing() {
        assert!(evaluate(&snapshot(), EngineKind::Postgres, &settings()).is_empty());
    }

    #[test]
    fn test_utilization_thresholds() {
        let mut snap = snapshot();
        snap.connections = ConnectionStats {
            total: 10,
            idle: 3,
            waiting: 0,
            active: 7,
        };
        let pending = evaluate(&snap, EngineKind::Postgres, &settings());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, AlertLevel::Warning);
        assert_eq!(pending[0].1, AlertKind::ConnectionUtilization);

        snap.connections.idle = 0;
        snap.connections.active = 10;
        let pending = evaluate(&snap, EngineKind::Postgres, &settings());
        assert_eq!(pending[0].0, AlertLevel::Critical);
    }

    #[test]
    fn test_utilization_suppressed_for_embedded_engine() {
        let mut snap = snapshot();
        snap.connections = ConnectionStats {
            total: 1,
            idle: 0,
            waiting: 0,
            active: 1,
        };
        assert!(evaluate(&snap, EngineKind::Sqlite, &settings()).is_empty());
    }

    #[test]
    fn test_slow_query_high_water() {
        let mut snap = snapshot();
        snap.query_performance.slow_query_count = SLOW_QUERY_HIGH_WATER;
        assert!(evaluate(&snap, EngineKind::Postgres, &settings()).is_empty());

        snap.query_performance.slow_query_count = SLOW_QUERY_HIGH_WATER + 1;
        let pending = evaluate(&snap, EngineKind::Postgres, &settings());
        assert_eq!(pending[0].1, AlertKind::SlowQueries);
        assert_eq!(pending[0].0, AlertLevel::Warning);
    }

    #[test]
    fn test_p99_ceiling() {
        let mut snap = snapshot();
        snap.query_performance.p99_response_ms = P99_CEILING_MS + 1.0;
        let pending = evaluate(&snap, EngineKind::Postgres, &settings());
        assert_eq!(pending[0].1, AlertKind::ResponseTime);
        assert_eq!(pending[0].0, AlertLevel::Critical);
    }

    #[test]
    fn test_security_rules() {
        let mut snap = snapshot();
        snap.security.failed_logins = FAILED_LOGIN_CEILING + 1;
        snap.security.privilege_escalations = 1;
        let pending = evaluate(&snap, EngineKind::Postgres, &settings());
        let kinds: Vec<AlertKind> = pending.iter().map(|p| p.1).collect();
        assert!(kinds.contains(&AlertKind::FailedLogins));
        assert!(kinds.contains(&AlertKind::PrivilegeEscalation));
    }

    #[test]
    fn test_multiple_rules_fire_independently() {
        let mut snap = snapshot();
        snap.connections = ConnectionStats {
            total: 10,
            idle: 0,
            waiting: 2,
            active: 10,
        };
        snap.query_performance.slow_query_count = 50;
        snap.query_performance.p99_response_ms = 9_000.0;
        let pending = evaluate(&snap, EngineKind::Postgres, &settings());
        assert_eq!(pending.len(), 3);
    }
}
