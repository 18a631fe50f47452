// SQLite adapter
// One file-backed connection opened asynchronously at construction; every
// operation serializes on that single handle. Callers arriving before the
// open completes await the same one-time initialization.

use async_trait::async_trait;
use rusqlite::OpenFlags;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tracing::{error, info};

use crate::adapter::{
    ConnectionStats, DatabaseAdapter, HealthCheckResult, HealthStatus,
};
use crate::config::{DatabaseSettings, EngineKind};
use crate::error::{truncate_sql, DbError};
use crate::transaction::{TransactionContext, TxConnection};
use crate::value::{leading_keyword, QueryOutcome, SqlValue};

const SQL_LOG_CAP: usize = 200;

type SharedHandle = Arc<Mutex<rusqlite::Connection>>;

/// Embedded adapter serializing all operations on one connection
pub struct SqliteAdapter {
    path: String,
    handle: Arc<OnceCell<SharedHandle>>,
    waiting: Arc<AtomicU32>,
    closed: AtomicBool,
}

impl SqliteAdapter {
    /// Start opening the database file. The open completes in the
    /// background; the first operation to arrive awaits it.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, DbError> {
        settings.validate()?;
        let path = settings
            .path
            .clone()
            .ok_or_else(|| DbError::Config("SQLite database path is required".to_string()))?;

        let adapter = Self {
            path: path.clone(),
            handle: Arc::new(OnceCell::new()),
            waiting: Arc::new(AtomicU32::new(0)),
            closed: AtomicBool::new(false),
        };

        let cell = Arc::clone(&adapter.handle);
        tokio::spawn(async move {
            match Self::open_once(&cell, &path).await {
                Ok(_) => info!(path = %path, "opened SQLite database"),
                Err(err) => error!(error = %err, path = %path, "initial SQLite open failed"),
            }
        });

        Ok(adapter)
    }

    /// One-time initialization every caller awaits. A failed open leaves
    /// the cell empty so the next caller retries.
    async fn open_once(cell: &OnceCell<SharedHandle>, path: &str) -> Result<SharedHandle, DbError> {
        cell.get_or_try_init(|| async {
            let path = path.to_string();
            let conn = tokio::task::spawn_blocking(move || {
                rusqlite::Connection::open_with_flags(
                    &path,
                    OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
                )
            })
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?
            .map_err(|e| {
                DbError::Connection(format!("Failed to open SQLite database: {}", e))
            })?;
            Ok(Arc::new(Mutex::new(conn)))
        })
        .await
        .cloned()
    }

    async fn shared(&self) -> Result<SharedHandle, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Connection("adapter is closed".to_string()));
        }
        Self::open_once(&self.handle, &self.path).await
    }
}

fn run_statement(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<QueryOutcome, DbError> {
    let keyword = leading_keyword(sql);

    if crate::adapter::is_read_only(sql) {
        let mut stmt = conn.prepare(sql).map_err(|e| query_error(sql, e))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let column_count = stmt.column_count();

        let mut data = Vec::new();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| query_error(sql, e))?;
        while let Some(row) = rows.next().map_err(|e| query_error(sql, e))? {
            let mut cells = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                let cell = row
                    .get_ref(idx)
                    .map(SqlValue::from_sqlite_ref)
                    .map_err(|e| query_error(sql, e))?;
                cells.push(cell);
            }
            data.push(cells);
        }
        Ok(QueryOutcome::rows(columns, data, &keyword))
    } else {
        let affected = conn
            .execute(sql, rusqlite::params_from_iter(params.iter()))
            .map_err(|e| query_error(sql, e))?;
        Ok(QueryOutcome::affected(affected as u64, &keyword))
    }
}

fn query_error(sql: &str, err: rusqlite::Error) -> DbError {
    error!(error = %err, sql = %truncate_sql(sql, SQL_LOG_CAP), "query failed");
    DbError::Query(err.to_string())
}

/// The single handle, held exclusively for the life of one transaction.
/// Concurrent logical callers queue at the mutex until the guard drops.
struct SqliteTxConnection {
    guard: OwnedMutexGuard<rusqlite::Connection>,
}

impl Drop for SqliteTxConnection {
    fn drop(&mut self) {
        // A context dropped while still inside BEGIN would leave the next
        // caller of the shared handle inside this transaction.
        if !self.guard.is_autocommit() {
            let _ = self.guard.execute_batch("ROLLBACK");
        }
    }
}

#[async_trait]
impl TxConnection for SqliteTxConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome, DbError> {
        run_statement(&self.guard, sql, params)
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.guard
            .execute_batch("COMMIT")
            .map_err(|e| DbError::Transaction(e.to_string()))
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.guard
            .execute_batch("ROLLBACK")
            .map_err(|e| DbError::Transaction(e.to_string()))
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn engine_kind(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome, DbError> {
        let shared = self.shared().await?;
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let conn = shared.lock().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        run_statement(&conn, sql, params)
    }

    async fn begin(&self) -> Result<TransactionContext, DbError> {
        let shared = self.shared().await?;
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = shared.lock_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        guard
            .execute_batch("BEGIN")
            .map_err(|e| DbError::Transaction(e.to_string()))?;
        Ok(TransactionContext::new(Box::new(SqliteTxConnection {
            guard,
        })))
    }

    async fn health_check(&self) -> Result<HealthCheckResult, DbError> {
        let started = Instant::now();
        let status = match self.query("SELECT 1", &[]).await {
            Ok(_) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        Ok(HealthCheckResult {
            status,
            response_time_ms: started.elapsed().as_millis() as u64,
            connections: self.stats(),
            replicas: Vec::new(),
        })
    }

    fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats {
            waiting: self.waiting.load(Ordering::SeqCst),
            ..ConnectionStats::default()
        };
        if let Some(shared) = self.handle.get() {
            stats.total = 1;
            match shared.try_lock() {
                Ok(_idle_probe) => stats.idle = 1,
                Err(_) => stats.active = 1,
            }
        }
        stats
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(path = %self.path, "closed SQLite adapter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tempfile::tempdir;

    async fn adapter_at(dir: &tempfile::TempDir) -> SqliteAdapter {
        let path = dir.path().join("dispatch.db");
        let settings = DatabaseSettings::sqlite(path.to_str().unwrap());
        SqliteAdapter::connect(&settings).await.unwrap()
    }

    #[tokio::test]
    async fn test_query_before_open_completes() {
        let dir = tempdir().unwrap();
        let adapter = adapter_at(&dir).await;
        // No sleep: the first call must await the one-time open, not fail
        let outcome = adapter
            .query("CREATE TABLE bookings (id INTEGER PRIMARY KEY, rider TEXT)", &[])
            .await
            .unwrap();
        assert_eq!(outcome.command, "CREATE 0");
    }

    #[tokio::test]
    async fn test_read_and_write_outcomes() {
        let dir = tempdir().unwrap();
        let adapter = adapter_at(&dir).await;
        adapter
            .query("CREATE TABLE drivers (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();

        let outcome = adapter
            .query(
                "INSERT INTO drivers (name) VALUES (?1), (?2)",
                &[SqlValue::Text("ada".into()), SqlValue::Text("lin".into())],
            )
            .await
            .unwrap();
        assert_eq!(outcome.row_count, 2);
        assert_eq!(outcome.command, "INSERT 2");

        let outcome = adapter
            .query("SELECT id, name FROM drivers ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(outcome.columns, vec!["id", "name"]);
        assert_eq!(outcome.row_count, 2);
        assert_eq!(outcome.rows[0][1], SqlValue::Text("ada".to_string()));
    }

    #[tokio::test]
    async fn test_query_error_propagates() {
        let dir = tempdir().unwrap();
        let adapter = adapter_at(&dir).await;
        let err = adapter.query("SELECT * FROM missing_table", &[]).await;
        assert!(matches!(err, Err(DbError::Query(_))));
    }

    #[tokio::test]
    async fn test_transaction_commit_persists() {
        let dir = tempdir().unwrap();
        let adapter: Arc<dyn DatabaseAdapter> = Arc::new(adapter_at(&dir).await);
        adapter
            .query("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();

        adapter
            .transaction(|tx| {
                async move {
                    tx.query("INSERT INTO t DEFAULT VALUES", &[]).await?;
                    tx.query("INSERT INTO t DEFAULT VALUES", &[]).await?;
                    Ok::<_, DbError>(())
                }
                .boxed()
            })
            .await
            .unwrap();

        let count = adapter
            .query("SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap()
            .first_value()
            .and_then(SqlValue::as_i64);
        assert_eq!(count, Some(2));
    }

    #[tokio::test]
    async fn test_transaction_error_rolls_back_and_rethrows() {
        let dir = tempdir().unwrap();
        let adapter: Arc<dyn DatabaseAdapter> = Arc::new(adapter_at(&dir).await);
        adapter
            .query("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();

        let result: Result<(), DbError> = adapter
            .transaction(|tx| {
                async move {
                    tx.query("INSERT INTO t DEFAULT VALUES", &[]).await?;
                    Err(DbError::Query("callback failed".to_string()))
                }
                .boxed()
            })
            .await;

        // The original error is rethrown unchanged
        match result {
            Err(DbError::Query(msg)) => assert_eq!(msg, "callback failed"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        let count = adapter
            .query("SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap()
            .first_value()
            .and_then(SqlValue::as_i64);
        assert_eq!(count, Some(0));
    }

    #[tokio::test]
    async fn test_explicit_finalization_is_not_repeated() {
        let dir = tempdir().unwrap();
        let adapter: Arc<dyn DatabaseAdapter> = Arc::new(adapter_at(&dir).await);
        adapter
            .query("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();

        // Explicit commit: the combinator must not finalize again
        adapter
            .transaction(|tx| {
                async move {
                    tx.query("INSERT INTO t DEFAULT VALUES", &[]).await?;
                    tx.commit().await?;
                    Ok::<_, DbError>(())
                }
                .boxed()
            })
            .await
            .unwrap();

        // Explicit rollback with a normal return: value comes back, nothing commits
        adapter
            .transaction(|tx| {
                async move {
                    tx.query("INSERT INTO t DEFAULT VALUES", &[]).await?;
                    tx.rollback().await?;
                    Ok::<_, DbError>(())
                }
                .boxed()
            })
            .await
            .unwrap();

        let count = adapter
            .query("SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap()
            .first_value()
            .and_then(SqlValue::as_i64);
        assert_eq!(count, Some(1));
    }

    #[tokio::test]
    async fn test_dropped_open_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let adapter = adapter_at(&dir).await;
        adapter
            .query("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();

        let mut tx = adapter.begin().await.unwrap();
        tx.query("INSERT INTO t DEFAULT VALUES", &[]).await.unwrap();
        drop(tx);

        let count = adapter
            .query("SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap()
            .first_value()
            .and_then(SqlValue::as_i64);
        assert_eq!(count, Some(0));
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(adapter_at(&dir).await);
        adapter
            .query("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let adapter = Arc::clone(&adapter);
            handles.push(tokio::spawn(async move {
                adapter.query("INSERT INTO t DEFAULT VALUES", &[]).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let count = adapter
            .query("SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap()
            .first_value()
            .and_then(SqlValue::as_i64);
        assert_eq!(count, Some(8));
    }

    #[tokio::test]
    async fn test_stats_single_handle() {
        let dir = tempdir().unwrap();
        let adapter = adapter_at(&dir).await;
        adapter.query("SELECT 1", &[]).await.unwrap();

        let stats = adapter.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, stats.idle + stats.active);

        // While a transaction holds the handle it reads as active
        let tx = adapter.begin().await.unwrap();
        let stats = adapter.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 1);
        drop(tx);
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempdir().unwrap();
        let adapter = adapter_at(&dir).await;
        let result = adapter.health_check().await.unwrap();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert!(result.replicas.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let adapter = adapter_at(&dir).await;
        adapter.query("SELECT 1", &[]).await.unwrap();

        adapter.close().await;
        adapter.close().await;
        assert!(matches!(
            adapter.query("SELECT 1", &[]).await,
            Err(DbError::Connection(_))
        ));
    }
}
