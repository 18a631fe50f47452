// Metrics model
// Interval-scoped snapshots and the rolling counters they drain. Every
// snapshot reflects only the interval since the previous reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::ConnectionStats;

/// Response-time samples kept between snapshots are capped so a stalled
/// metrics loop cannot grow the buffer without bound.
pub(crate) const RESPONSE_TIME_BUFFER_CAP: usize = 10_000;

/// Query throughput and latency over one collection interval
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPerformance {
    pub query_count: u64,
    pub error_count: u64,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub p99_response_ms: f64,
    pub slow_query_count: u64,
}

/// Engine-side health figures; zeros for engines without visibility
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemHealth {
    pub lock_waits: i64,
    pub deadlocks: i64,
    pub transactions_per_sec: f64,
}

/// Security counts derived from the audit source over a trailing window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityMetrics {
    pub failed_logins: i64,
    pub privilege_escalations: i64,
}

/// One timestamped sample of aggregated metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMetrics {
    pub timestamp: DateTime<Utc>,
    pub connections: ConnectionStats,
    pub query_performance: QueryPerformance,
    pub system_health: SystemHealth,
    pub security: SecurityMetrics,
    pub errors: u64,
}

/// A query whose duration exceeded the configured threshold, captured the
/// instant it was observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowQuery {
    pub query: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub params: serde_json::Value,
}

/// Counters updated by every intercepted call and drained by the periodic
/// collector
#[derive(Debug, Default)]
pub(crate) struct RollingCounters {
    pub query_count: u64,
    pub error_count: u64,
    pub response_times_ms: Vec<u64>,
    pub slow_query_count: u64,
}

impl RollingCounters {
    /// Take the current window, leaving a fresh one behind
    pub fn drain(&mut self) -> RollingCounters {
        std::mem::take(self)
    }
}

/// Nearest-rank percentile over an ascending-sorted sample
pub(crate) fn percentile(sorted_ms: &[u64], pct: f64) -> f64 {
    if sorted_ms.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0 * sorted_ms.len() as f64).ceil() as usize;
    sorted_ms[rank.clamp(1, sorted_ms.len()) - 1] as f64
}
