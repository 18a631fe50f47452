// Configuration
// One settings object supplied at construction; validation is fatal and
// happens before any connection is attempted.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DbError;

/// Supported database engines
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Postgres,
    Sqlite,
}

impl EngineKind {
    /// Display name for logs
    pub fn display_name(&self) -> &'static str {
        match self {
            EngineKind::Postgres => "PostgreSQL",
            EngineKind::Sqlite => "SQLite",
        }
    }

    /// Default port for the engine
    pub fn default_port(&self) -> u16 {
        match self {
            EngineKind::Postgres => 5432,
            EngineKind::Sqlite => 0, // File-based, no port
        }
    }
}

/// A read replica endpoint of the primary database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSettings {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Connection pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_idle: u32,
    pub max_size: u32,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_size: 10,
            acquire_timeout_ms: 5_000,
            idle_timeout_secs: 300,
            reap_interval_secs: 30,
        }
    }
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Email composition settings; the composed message is handed to an HTTP
/// mail relay, the relay owns delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    pub relay_url: String,
    pub recipients: Vec<String>,
}

/// Monitoring cadence, thresholds and notification targets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub metrics_interval_secs: u64,
    pub health_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Queries slower than this are captured in the slow-query log
    pub slow_query_threshold_ms: u64,
    /// Captured SQL text is truncated to this many bytes
    pub slow_query_sql_cap: usize,
    pub max_metrics_history: usize,
    pub max_slow_queries: usize,
    pub max_alerts: usize,
    pub metrics_retention_days: i64,
    pub slow_query_retention_days: i64,
    pub resolved_alert_grace_hours: i64,
    pub utilization_warning_pct: f64,
    pub utilization_critical_pct: f64,
    pub alerting_enabled: bool,
    pub webhook_url: Option<String>,
    pub email: Option<EmailSettings>,
    pub service_name: String,
    pub environment: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 30,
            health_interval_secs: 10,
            cleanup_interval_secs: 3_600,
            slow_query_threshold_ms: 500,
            slow_query_sql_cap: 200,
            max_metrics_history: 1_000,
            max_slow_queries: 100,
            max_alerts: 500,
            metrics_retention_days: 7,
            slow_query_retention_days: 3,
            resolved_alert_grace_hours: 24,
            utilization_warning_pct: 70.0,
            utilization_critical_pct: 90.0,
            alerting_enabled: false,
            webhook_url: None,
            email: None,
            service_name: "dispatch-api".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Unified database configuration, supplied once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub engine: EngineKind,

    // Networked engine fields
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: String,
    /// "disable", "prefer", "require", "verify-ca", "verify-full"
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
    #[serde(default)]
    pub replicas: Vec<ReplicaSettings>,

    // Embedded engine field
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub pool: PoolSettings,

    /// When set, the monitor derives security counts from the audit log table
    #[serde(default)]
    pub audit_log_enabled: bool,

    #[serde(default)]
    pub monitor: MonitorSettings,
}

fn default_sslmode() -> String {
    "prefer".to_string()
}

impl DatabaseSettings {
    pub fn postgres(host: &str, database: &str, username: &str, password: &str) -> Self {
        Self {
            engine: EngineKind::Postgres,
            host: Some(host.to_string()),
            port: None,
            database: database.to_string(),
            username: Some(username.to_string()),
            password: password.to_string(),
            sslmode: default_sslmode(),
            replicas: Vec::new(),
            path: None,
            pool: PoolSettings::default(),
            audit_log_enabled: false,
            monitor: MonitorSettings::default(),
        }
    }

    pub fn sqlite(path: &str) -> Self {
        Self {
            engine: EngineKind::Sqlite,
            host: None,
            port: None,
            database: String::new(),
            username: None,
            password: String::new(),
            sslmode: default_sslmode(),
            replicas: Vec::new(),
            path: Some(path.to_string()),
            pool: PoolSettings::default(),
            audit_log_enabled: false,
            monitor: MonitorSettings::default(),
        }
    }

    pub fn get_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }

    pub fn validate(&self) -> Result<(), DbError> {
        match self.engine {
            EngineKind::Sqlite => {
                if self.path.as_deref().map(|p| p.is_empty()).unwrap_or(true) {
                    return Err(DbError::Config(
                        "SQLite database path is required".to_string(),
                    ));
                }
            }
            EngineKind::Postgres => {
                if self.host.as_deref().map(|h| h.is_empty()).unwrap_or(true) {
                    return Err(DbError::Config("Host is required".to_string()));
                }
                if self.username.as_deref().map(|u| u.is_empty()).unwrap_or(true) {
                    return Err(DbError::Config("Username is required".to_string()));
                }
                if self.database.is_empty() {
                    return Err(DbError::Config("Database name is required".to_string()));
                }
                for replica in &self.replicas {
                    if replica.host.is_empty() {
                        return Err(DbError::Config(format!(
                            "Replica '{}' has no host",
                            replica.name
                        )));
                    }
                }
            }
        }
        if self.pool.max_size == 0 {
            return Err(DbError::Config("Pool max_size must be at least 1".to_string()));
        }
        if self.pool.min_idle > self.pool.max_size {
            return Err(DbError::Config(
                "Pool min_idle cannot exceed max_size".to_string(),
            ));
        }
        if self.monitor.utilization_warning_pct > self.monitor.utilization_critical_pct {
            return Err(DbError::Config(
                "Utilization warning threshold cannot exceed the critical threshold".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a tokio-postgres connection string for the primary endpoint
    pub(crate) fn primary_conn_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={}",
            self.host.as_deref().unwrap_or_default(),
            self.get_port(),
            self.database,
            self.username.as_deref().unwrap_or_default(),
            self.password,
            self.sslmode,
        )
    }

    /// Build a connection string for one replica; credentials and database
    /// are shared with the primary.
    pub(crate) fn replica_conn_string(&self, replica: &ReplicaSettings) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={}",
            replica.host,
            replica.port.unwrap_or_else(|| self.engine.default_port()),
            self.database,
            self.username.as_deref().unwrap_or_default(),
            self.password,
            self.sslmode,
        )
    }
}
