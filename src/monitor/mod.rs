// Database monitor
// Periodic metrics collection, slow-query capture, threshold alerting,
// notification dispatch and retention cleanup. Monitoring failures are
// logged and swallowed; the data path never sees them.

pub mod alerts;
pub mod metrics;
mod notify;

pub use alerts::{Alert, AlertKind, AlertLevel};
pub use metrics::{
    DatabaseMetrics, QueryPerformance, SecurityMetrics, SlowQuery, SystemHealth,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapter::{DatabaseAdapter, HealthStatus};
use crate::config::{DatabaseSettings, EngineKind, MonitorSettings};
use crate::error::truncate_sql;
use crate::manager::ConnectionManager;
use crate::monitor::metrics::{percentile, RollingCounters, RESPONSE_TIME_BUFFER_CAP};
use crate::monitor::notify::AlertNotifier;
use crate::value::SqlValue;

const PG_LOCK_WAITS_SQL: &str = "SELECT COUNT(*) FROM pg_locks WHERE NOT granted";

const PG_ACTIVITY_TOTALS_SQL: &str = "SELECT COALESCE(SUM(deadlocks), 0)::bigint, \
     COALESCE(SUM(xact_commit + xact_rollback), 0)::bigint FROM pg_stat_database";

const PG_AUDIT_WINDOW_SQL: &str = "SELECT COUNT(*) FILTER (WHERE event_type = 'failed_login'), \
     COUNT(*) FILTER (WHERE event_type = 'privilege_escalation') \
     FROM security_audit_log WHERE occurred_at > NOW() - INTERVAL '1 hour'";

const SQLITE_AUDIT_WINDOW_SQL: &str = "SELECT COALESCE(SUM(event_type = 'failed_login'), 0), \
     COALESCE(SUM(event_type = 'privilege_escalation'), 0) \
     FROM security_audit_log WHERE occurred_at > datetime('now', '-1 hour')";

/// Point-in-time monitor summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub is_running: bool,
    pub active_alerts: usize,
    pub total_metrics: usize,
}

/// Last observed cumulative engine totals, for delta reporting
#[derive(Debug, Default)]
struct EngineBaseline {
    deadlocks: i64,
    transactions: i64,
    observed_at: Option<DateTime<Utc>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Periodic metrics, alerting and retention over the active adapter
pub struct DatabaseMonitor {
    settings: MonitorSettings,
    audit_log_enabled: bool,
    manager: Arc<ConnectionManager>,
    notifier: AlertNotifier,
    counters: Mutex<RollingCounters>,
    baseline: Mutex<EngineBaseline>,
    history: Mutex<VecDeque<DatabaseMetrics>>,
    slow_queries: Mutex<VecDeque<SlowQuery>>,
    alerts: Mutex<Vec<Alert>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DatabaseMonitor {
    pub fn new(manager: Arc<ConnectionManager>, settings: &DatabaseSettings) -> Arc<Self> {
        Arc::new(Self {
            settings: settings.monitor.clone(),
            audit_log_enabled: settings.audit_log_enabled,
            manager,
            notifier: AlertNotifier::new(&settings.monitor),
            counters: Mutex::new(RollingCounters::default()),
            baseline: Mutex::new(EngineBaseline::default()),
            history: Mutex::new(VecDeque::new()),
            slow_queries: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the metrics, health and cleanup loops
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            metrics_interval_secs = self.settings.metrics_interval_secs,
            health_interval_secs = self.settings.health_interval_secs,
            "database monitor started"
        );

        let mut tasks = lock(&self.tasks);

        let monitor = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(monitor.settings.metrics_interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.collect_and_evaluate().await;
            }
        }));

        let monitor = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(monitor.settings.health_interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.run_health_probe().await;
            }
        }));

        let monitor = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(monitor.settings.cleanup_interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.cleanup();
            }
        }));
    }

    /// Stop all loops. Stored metrics, slow queries and alerts survive.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        info!("database monitor stopped");
    }

    // --- Interceptor feed ---

    /// Record one observed query. Statements over the slow threshold are
    /// captured immediately, independent of the snapshot cadence.
    pub fn record_query(&self, sql: &str, params: &[SqlValue], duration_ms: u64) {
        let slow = duration_ms > self.settings.slow_query_threshold_ms;
        {
            let mut counters = lock(&self.counters);
            counters.query_count += 1;
            if counters.response_times_ms.len() < RESPONSE_TIME_BUFFER_CAP {
                counters.response_times_ms.push(duration_ms);
            }
            if slow {
                counters.slow_query_count += 1;
            }
        }

        if slow {
            let entry = SlowQuery {
                query: truncate_sql(sql, self.settings.slow_query_sql_cap),
                duration_ms,
                timestamp: Utc::now(),
                params: serde_json::to_value(params).unwrap_or(serde_json::Value::Null),
            };
            warn!(duration_ms, query = %entry.query, "slow query captured");
            let mut slow_queries = lock(&self.slow_queries);
            slow_queries.push_back(entry);
            while slow_queries.len() > self.settings.max_slow_queries {
                slow_queries.pop_front();
            }
        }
    }

    /// Record one failed query
    pub fn record_error(&self) {
        lock(&self.counters).error_count += 1;
    }

    // --- Collection ---

    async fn collect_and_evaluate(&self) {
        let adapter = self.manager.adapter().await;
        let engine = adapter.engine_kind();
        let snapshot = self.collect_snapshot(&adapter).await;

        {
            let mut history = lock(&self.history);
            history.push_back(snapshot.clone());
            while history.len() > self.settings.max_metrics_history {
                history.pop_front();
            }
        }
        debug!(
            queries = snapshot.query_performance.query_count,
            errors = snapshot.errors,
            p99_ms = snapshot.query_performance.p99_response_ms,
            connections = snapshot.connections.total,
            "metrics snapshot"
        );

        for (level, kind, message) in alerts::evaluate(&snapshot, engine, &self.settings) {
            self.raise_alert(level, kind, message);
        }
    }

    async fn collect_snapshot(&self, adapter: &Arc<dyn DatabaseAdapter>) -> DatabaseMetrics {
        let connections = adapter.stats();
        let window = lock(&self.counters).drain();

        let mut times = window.response_times_ms;
        times.sort_unstable();
        let avg = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<u64>() as f64 / times.len() as f64
        };

        let query_performance = QueryPerformance {
            query_count: window.query_count,
            error_count: window.error_count,
            avg_response_ms: avg,
            p95_response_ms: percentile(&times, 95.0),
            p99_response_ms: percentile(&times, 99.0),
            slow_query_count: window.slow_query_count,
        };

        let system_health = self.collect_system_health(adapter).await;
        let security = self.collect_security(adapter).await;

        DatabaseMetrics {
            timestamp: Utc::now(),
            connections,
            query_performance,
            system_health,
            security,
            errors: window.error_count,
        }
    }

    /// Engine-side health figures. Best-effort: a failed probe logs and
    /// reports zeros. The embedded engine has no lock or deadlock
    /// visibility and always reports zeros.
    async fn collect_system_health(&self, adapter: &Arc<dyn DatabaseAdapter>) -> SystemHealth {
        match adapter.engine_kind() {
            EngineKind::Sqlite => SystemHealth::default(),
            EngineKind::Postgres => {
                let lock_waits = match adapter.query(PG_LOCK_WAITS_SQL, &[]).await {
                    Ok(outcome) => outcome
                        .first_value()
                        .and_then(SqlValue::as_i64)
                        .unwrap_or(0),
                    Err(err) => {
                        warn!(error = %err, "lock wait collection failed");
                        0
                    }
                };

                let (deadlocks, transactions_per_sec) =
                    match adapter.query(PG_ACTIVITY_TOTALS_SQL, &[]).await {
                        Ok(outcome) => {
                            let row = outcome.rows.first();
                            let deadlock_total = row
                                .and_then(|r| r.first())
                                .and_then(SqlValue::as_i64)
                                .unwrap_or(0);
                            let xact_total = row
                                .and_then(|r| r.get(1))
                                .and_then(SqlValue::as_i64)
                                .unwrap_or(0);
                            self.apply_baseline(deadlock_total, xact_total, Utc::now())
                        }
                        Err(err) => {
                            warn!(error = %err, "engine activity collection failed");
                            (0, 0.0)
                        }
                    };

                SystemHealth {
                    lock_waits,
                    deadlocks,
                    transactions_per_sec,
                }
            }
        }
    }

    /// Turn cumulative engine totals into per-interval deltas. The first
    /// observation only seeds the baseline.
    fn apply_baseline(
        &self,
        deadlock_total: i64,
        xact_total: i64,
        now: DateTime<Utc>,
    ) -> (i64, f64) {
        let mut baseline = lock(&self.baseline);
        let result = match baseline.observed_at {
            Some(observed_at) => {
                let elapsed = (now - observed_at).num_milliseconds().max(1) as f64 / 1_000.0;
                let deadlocks = (deadlock_total - baseline.deadlocks).max(0);
                let rate = (xact_total - baseline.transactions).max(0) as f64 / elapsed;
                (deadlocks, rate)
            }
            None => (0, 0.0),
        };
        baseline.deadlocks = deadlock_total;
        baseline.transactions = xact_total;
        baseline.observed_at = Some(now);
        result
    }

    /// Security counts over the trailing hour. A missing audit source is
    /// not an error: the counts read as zero.
    async fn collect_security(&self, adapter: &Arc<dyn DatabaseAdapter>) -> SecurityMetrics {
        if !self.audit_log_enabled {
            return SecurityMetrics::default();
        }
        let sql = match adapter.engine_kind() {
            EngineKind::Postgres => PG_AUDIT_WINDOW_SQL,
            EngineKind::Sqlite => SQLITE_AUDIT_WINDOW_SQL,
        };
        match adapter.query(sql, &[]).await {
            Ok(outcome) => {
                let row = outcome.rows.first();
                SecurityMetrics {
                    failed_logins: row
                        .and_then(|r| r.first())
                        .and_then(SqlValue::as_i64)
                        .unwrap_or(0),
                    privilege_escalations: row
                        .and_then(|r| r.get(1))
                        .and_then(SqlValue::as_i64)
                        .unwrap_or(0),
                }
            }
            Err(_) => SecurityMetrics::default(),
        }
    }

    // --- Health probe ---

    async fn run_health_probe(&self) {
        let adapter = self.manager.adapter().await;
        match adapter.health_check().await {
            Ok(result) if result.status == HealthStatus::Healthy => {}
            Ok(result) => {
                self.raise_alert(
                    AlertLevel::Critical,
                    AlertKind::HealthCheck,
                    format!(
                        "Database health check returned {} ({}ms)",
                        result.status, result.response_time_ms
                    ),
                );
            }
            Err(err) => {
                self.raise_alert(
                    AlertLevel::Critical,
                    AlertKind::HealthCheck,
                    format!("Database health check failed: {}", err),
                );
            }
        }
    }

    // --- Alerts ---

    /// Store and emit an alert. Never fails; dispatch is fire-and-forget.
    fn raise_alert(&self, level: AlertLevel, kind: AlertKind, message: String) {
        let alert = Alert::new(level, kind, message);
        {
            let mut alerts = lock(&self.alerts);
            alerts.push(alert.clone());
            if alerts.len() > self.settings.max_alerts {
                // Unresolved alerts are immortal; evict the oldest resolved one
                if let Some(pos) = alerts.iter().position(|a| a.is_resolved()) {
                    alerts.remove(pos);
                }
            }
        }
        match level {
            AlertLevel::Critical => error!(kind = %kind, message = %alert.message, "database alert"),
            AlertLevel::Warning => warn!(kind = %kind, message = %alert.message, "database alert"),
            AlertLevel::Info => info!(kind = %kind, message = %alert.message, "database alert"),
        }

        if self.settings.alerting_enabled {
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                notifier.dispatch(&alert).await;
            });
        }
    }

    /// Mark an alert acknowledged. Acknowledging twice is safe.
    pub fn acknowledge_alert(&self, id: &str) -> bool {
        let mut alerts = lock(&self.alerts);
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Resolve an alert; an unknown id returns false. The first resolution
    /// timestamp is kept on repeat calls.
    pub fn resolve_alert(&self, id: &str) -> bool {
        let mut alerts = lock(&self.alerts);
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                if alert.resolved_at.is_none() {
                    alert.resolved_at = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }

    // --- Retention ---

    /// Prune aged data. Unresolved alerts are never pruned.
    fn cleanup(&self) {
        let now = Utc::now();
        let metrics_cutoff = now - chrono::Duration::days(self.settings.metrics_retention_days);
        let slow_cutoff = now - chrono::Duration::days(self.settings.slow_query_retention_days);
        let resolved_cutoff =
            now - chrono::Duration::hours(self.settings.resolved_alert_grace_hours);

        let before: usize;
        let after: usize;
        {
            let mut history = lock(&self.history);
            history.retain(|m| m.timestamp >= metrics_cutoff);
        }
        {
            let mut slow_queries = lock(&self.slow_queries);
            slow_queries.retain(|q| q.timestamp >= slow_cutoff);
        }
        {
            let mut alerts = lock(&self.alerts);
            before = alerts.len();
            alerts.retain(|a| match a.resolved_at {
                Some(resolved_at) => resolved_at >= resolved_cutoff,
                None => true,
            });
            after = alerts.len();
        }
        debug!(pruned_alerts = before - after, "retention cleanup done");
    }

    // --- Observability read API ---

    /// The most recent snapshots, oldest first
    pub fn get_metrics(&self, limit: usize) -> Vec<DatabaseMetrics> {
        let history = lock(&self.history);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// The most recent slow queries, oldest first
    pub fn get_slow_queries(&self, limit: usize) -> Vec<SlowQuery> {
        let slow_queries = lock(&self.slow_queries);
        let skip = slow_queries.len().saturating_sub(limit);
        slow_queries.iter().skip(skip).cloned().collect()
    }

    /// The most recent alerts, oldest first
    pub fn get_alerts(&self, limit: usize) -> Vec<Alert> {
        let alerts = lock(&self.alerts);
        let skip = alerts.len().saturating_sub(limit);
        alerts.iter().skip(skip).cloned().collect()
    }

    pub fn current_status(&self) -> MonitorStatus {
        MonitorStatus {
            is_running: self.running.load(Ordering::SeqCst),
            active_alerts: lock(&self.alerts).iter().filter(|a| !a.is_resolved()).count(),
            total_metrics: lock(&self.history).len(),
        }
    }
}
