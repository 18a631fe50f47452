// Query interceptor
// Thin decorator timing every query and forwarding duration and failures
// to the monitor. Errors are rethrown unchanged, never swallowed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use crate::adapter::{ConnectionStats, DatabaseAdapter, HealthCheckResult};
use crate::config::EngineKind;
use crate::error::DbError;
use crate::monitor::DatabaseMonitor;
use crate::transaction::TransactionContext;
use crate::value::{QueryOutcome, SqlValue};

/// Wraps an adapter so every call is observed by the monitor
pub struct QueryInterceptor {
    inner: Arc<dyn DatabaseAdapter>,
    monitor: Arc<DatabaseMonitor>,
}

impl QueryInterceptor {
    pub fn new(inner: Arc<dyn DatabaseAdapter>, monitor: Arc<DatabaseMonitor>) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl DatabaseAdapter for QueryInterceptor {
    fn engine_kind(&self) -> EngineKind {
        self.inner.engine_kind()
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome, DbError> {
        let started = Instant::now();
        let result = self.inner.query(sql, params).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.monitor.record_query(sql, params, duration_ms);
        if result.is_err() {
            self.monitor.record_error();
        }
        result
    }

    async fn begin(&self) -> Result<TransactionContext, DbError> {
        self.inner.begin().await
    }

    async fn health_check(&self) -> Result<HealthCheckResult, DbError> {
        self.inner.health_check().await
    }

    fn stats(&self) -> ConnectionStats {
        self.inner.stats()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
