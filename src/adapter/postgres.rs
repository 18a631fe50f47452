// PostgreSQL adapter
// Pooled, multi-connection engine with one primary pool and zero or more
// replica pools. Reads round-robin across replicas; writes and everything
// inside a transaction pin to the primary.

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use bb8_postgres::PostgresConnectionManager as PgPoolManager;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio_postgres::types::ToSql as PgToSql;
use tokio_postgres::NoTls;
use tracing::{debug, error, info};

use crate::adapter::{
    aggregate_status, is_read_only, ConnectionStats, DatabaseAdapter, HealthCheckResult,
    HealthStatus, ReplicaStatus,
};
use crate::config::{DatabaseSettings, EngineKind, PoolSettings};
use crate::error::{truncate_sql, DbError};
use crate::transaction::{TransactionContext, TxConnection};
use crate::value::{leading_keyword, QueryOutcome, SqlValue};

/// Type alias for our connection pool
pub type PostgresPool = Pool<PgPoolManager<NoTls>>;

type OwnedPgConnection = PooledConnection<'static, PgPoolManager<NoTls>>;

const SQL_LOG_CAP: usize = 200;

const REPLICA_LAG_SQL: &str =
    "SELECT EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::float8";

/// One endpoint's pool plus the bookkeeping bb8 does not expose
#[derive(Clone)]
struct PoolHandle {
    name: String,
    pool: PostgresPool,
    waiting: Arc<AtomicU32>,
}

impl PoolHandle {
    /// Acquire a connection, counting the caller as waiting until the pool
    /// hands one out or the acquire timeout fails the caller.
    async fn acquire(&self) -> Result<OwnedPgConnection, DbError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let result = self.pool.get_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result.map_err(DbError::from)
    }

    fn accumulate(&self, stats: &mut ConnectionStats) {
        let state = self.pool.state();
        stats.total += state.connections;
        stats.idle += state.idle_connections;
        stats.waiting += self.waiting.load(Ordering::SeqCst);
    }
}

struct PoolSet {
    primary: PoolHandle,
    replicas: Vec<PoolHandle>,
}

/// Networked adapter over one primary pool and its replica pools
pub struct PostgresAdapter {
    /// None once the adapter has been closed
    pools: RwLock<Option<PoolSet>>,
    rr_index: AtomicUsize,
    /// Last primary probe result; while it reads false, read traffic
    /// collapses onto the primary instead of fanning out
    primary_probe_ok: AtomicBool,
}

impl PostgresAdapter {
    /// Build all pools from configuration and connect
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, DbError> {
        settings.validate()?;

        let primary =
            Self::build_pool("primary", &settings.primary_conn_string(), &settings.pool).await?;
        let mut replicas = Vec::with_capacity(settings.replicas.len());
        for replica in &settings.replicas {
            replicas.push(
                Self::build_pool(
                    &replica.name,
                    &settings.replica_conn_string(replica),
                    &settings.pool,
                )
                .await?,
            );
        }
        info!(
            replicas = replicas.len(),
            "connected PostgreSQL adapter"
        );

        Ok(Self {
            pools: RwLock::new(Some(PoolSet { primary, replicas })),
            rr_index: AtomicUsize::new(0),
            primary_probe_ok: AtomicBool::new(true),
        })
    }

    async fn build_pool(
        name: &str,
        conn_string: &str,
        pool_cfg: &PoolSettings,
    ) -> Result<PoolHandle, DbError> {
        let manager = PgPoolManager::new_from_stringlike(conn_string, NoTls)
            .map_err(|e| DbError::Config(e.to_string()))?;

        let mut builder = Pool::builder()
            .max_size(pool_cfg.max_size)
            .connection_timeout(pool_cfg.acquire_timeout())
            .idle_timeout(Some(pool_cfg.idle_timeout()))
            .reaper_rate(pool_cfg.reap_interval());
        if pool_cfg.min_idle > 0 {
            builder = builder.min_idle(Some(pool_cfg.min_idle));
        }
        let pool = builder
            .build(manager)
            .await
            .map_err(|e| DbError::Connection(format!("pool '{}': {}", name, e)))?;

        Ok(PoolHandle {
            name: name.to_string(),
            pool,
            waiting: Arc::new(AtomicU32::new(0)),
        })
    }

    fn pool_set(&self) -> Result<(PoolHandle, Vec<PoolHandle>), DbError> {
        let guard = self.pools.read().unwrap_or_else(|e| e.into_inner());
        let set = guard
            .as_ref()
            .ok_or_else(|| DbError::Connection("adapter is closed".to_string()))?;
        Ok((set.primary.clone(), set.replicas.clone()))
    }

    /// Pick the pool for a statement: reads rotate across replicas when at
    /// least one is configured, everything else goes to the primary.
    fn route_for(&self, sql: &str) -> Result<PoolHandle, DbError> {
        let guard = self.pools.read().unwrap_or_else(|e| e.into_inner());
        let set = guard
            .as_ref()
            .ok_or_else(|| DbError::Connection("adapter is closed".to_string()))?;
        if is_read_only(sql)
            && !set.replicas.is_empty()
            && self.primary_probe_ok.load(Ordering::SeqCst)
        {
            let idx = rr_pick(&self.rr_index, set.replicas.len());
            Ok(set.replicas[idx].clone())
        } else {
            Ok(set.primary.clone())
        }
    }

    async fn probe_primary(handle: &PoolHandle) -> (bool, u64) {
        let started = Instant::now();
        let ok = match handle.acquire().await {
            Ok(conn) => conn.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        };
        (ok, started.elapsed().as_millis() as u64)
    }

    async fn probe_replica(handle: &PoolHandle) -> ReplicaStatus {
        let conn = match handle.acquire().await {
            Ok(conn) => conn,
            Err(_) => {
                return ReplicaStatus {
                    name: handle.name.clone(),
                    status: HealthStatus::Unhealthy,
                    lag_seconds: None,
                }
            }
        };
        if conn.simple_query("SELECT 1").await.is_err() {
            return ReplicaStatus {
                name: handle.name.clone(),
                status: HealthStatus::Unhealthy,
                lag_seconds: None,
            };
        }
        // Lag is best-effort; NULL on an endpoint that is not replaying
        let lag_seconds = conn
            .query_one(REPLICA_LAG_SQL, &[])
            .await
            .ok()
            .and_then(|row| row.try_get::<_, Option<f64>>(0).ok().flatten());
        ReplicaStatus {
            name: handle.name.clone(),
            status: HealthStatus::Healthy,
            lag_seconds,
        }
    }
}

/// Strict round-robin: index incremented mod replica count
fn rr_pick(counter: &AtomicUsize, len: usize) -> usize {
    counter.fetch_add(1, Ordering::Relaxed) % len
}

async fn run_statement(
    client: &tokio_postgres::Client,
    sql: &str,
    params: &[SqlValue],
) -> Result<QueryOutcome, DbError> {
    let keyword = leading_keyword(sql);
    let pg_params: Vec<&(dyn PgToSql + Sync)> =
        params.iter().map(|p| p as &(dyn PgToSql + Sync)).collect();

    if is_read_only(sql) {
        let rows = client
            .query(sql, &pg_params)
            .await
            .map_err(|e| query_error(sql, e))?;
        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let data = rows
            .iter()
            .map(|row| (0..row.len()).map(|i| SqlValue::from_pg_row(row, i)).collect())
            .collect();
        Ok(QueryOutcome::rows(columns, data, &keyword))
    } else {
        let affected = client
            .execute(sql, &pg_params)
            .await
            .map_err(|e| query_error(sql, e))?;
        Ok(QueryOutcome::affected(affected, &keyword))
    }
}

fn query_error(sql: &str, err: tokio_postgres::Error) -> DbError {
    error!(error = %err, sql = %truncate_sql(sql, SQL_LOG_CAP), "query failed");
    DbError::Query(err.to_string())
}

/// Primary connection held exclusively for the life of one transaction.
/// The connection returns to the pool once finalized, or through the drop
/// guard, so no other transaction interleaves on it.
struct PgTxConnection {
    /// Taken on finalization; a connection still present at drop is mid-
    /// transaction and must roll back before the pool reuses it.
    conn: Option<OwnedPgConnection>,
}

impl PgTxConnection {
    fn client(&self) -> Result<&tokio_postgres::Client, DbError> {
        self.conn
            .as_deref()
            .ok_or_else(|| DbError::Transaction("connection already released".to_string()))
    }
}

#[async_trait]
impl TxConnection for PgTxConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome, DbError> {
        run_statement(self.client()?, sql, params).await
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let result = self
            .client()?
            .batch_execute("COMMIT")
            .await
            .map_err(|e| DbError::Transaction(e.to_string()));
        // A rejected COMMIT rolls back server-side; released either way
        self.conn = None;
        result
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        let result = self
            .client()?
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| DbError::Transaction(e.to_string()));
        self.conn = None;
        result
    }
}

impl Drop for PgTxConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Returned to the pool mid-transaction the connection would
            // leak its BEGIN into the next acquirer
            tokio::spawn(async move {
                let _ = conn.batch_execute("ROLLBACK").await;
            });
        }
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn engine_kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome, DbError> {
        let handle = self.route_for(sql)?;
        debug!(pool = %handle.name, "executing statement");
        let conn = handle.acquire().await?;
        run_statement(&conn, sql, params).await
    }

    async fn begin(&self) -> Result<TransactionContext, DbError> {
        let (primary, _) = self.pool_set()?;
        let conn = primary.acquire().await?;
        conn.batch_execute("BEGIN")
            .await
            .map_err(|e| DbError::Transaction(e.to_string()))?;
        Ok(TransactionContext::new(Box::new(PgTxConnection {
            conn: Some(conn),
        })))
    }

    async fn health_check(&self) -> Result<HealthCheckResult, DbError> {
        let (primary, replicas) = self.pool_set()?;

        let (primary_ok, response_time_ms) = Self::probe_primary(&primary).await;
        self.primary_probe_ok.store(primary_ok, Ordering::SeqCst);
        let mut replica_statuses = Vec::with_capacity(replicas.len());
        for handle in &replicas {
            replica_statuses.push(Self::probe_replica(handle).await);
        }

        Ok(HealthCheckResult {
            status: aggregate_status(primary_ok, &replica_statuses),
            response_time_ms,
            connections: self.stats(),
            replicas: replica_statuses,
        })
    }

    fn stats(&self) -> ConnectionStats {
        let guard = self.pools.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = ConnectionStats::default();
        if let Some(set) = guard.as_ref() {
            set.primary.accumulate(&mut stats);
            for replica in &set.replicas {
                replica.accumulate(&mut stats);
            }
        }
        stats.active = stats.total - stats.idle;
        stats
    }

    async fn close(&self) {
        let taken = {
            let mut guard = self.pools.write().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if taken.is_some() {
            info!("closed PostgreSQL adapter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_distribution() {
        let counter = AtomicUsize::new(0);
        let mut hits = [0usize; 2];
        for _ in 0..6 {
            hits[rr_pick(&counter, 2)] += 1;
        }
        assert_eq!(hits, [3, 3]);
    }

    #[test]
    fn test_round_robin_uneven() {
        let counter = AtomicUsize::new(0);
        let mut hits = [0usize; 3];
        for _ in 0..7 {
            hits[rr_pick(&counter, 3)] += 1;
        }
        // 7 queries over 3 replicas: each receives floor(7/3) or ceil(7/3)
        assert!(hits.iter().all(|&h| h == 2 || h == 3));
        assert_eq!(hits.iter().sum::<usize>(), 7);
    }

    #[test]
    fn test_round_robin_order() {
        let counter = AtomicUsize::new(0);
        let picks: Vec<usize> = (0..6).map(|_| rr_pick(&counter, 2)).collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0, 1]);
    }
}
