// Connection manager
// Owns the active adapter, builds it from configuration, optionally runs a
// periodic health-check loop, and supports hot adapter replacement.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adapter::{DatabaseAdapter, HealthStatus, PostgresAdapter, SqliteAdapter};
use crate::config::{DatabaseSettings, EngineKind};
use crate::error::DbError;

/// Construct the adapter named by the configuration
pub async fn build_adapter(
    settings: &DatabaseSettings,
) -> Result<Arc<dyn DatabaseAdapter>, DbError> {
    settings.validate()?;
    let adapter: Arc<dyn DatabaseAdapter> = match settings.engine {
        EngineKind::Postgres => Arc::new(PostgresAdapter::connect(settings).await?),
        EngineKind::Sqlite => Arc::new(SqliteAdapter::connect(settings).await?),
    };
    Ok(adapter)
}

/// Owns the active adapter; explicitly constructed and injected into
/// whatever consumes it.
pub struct ConnectionManager {
    adapter: RwLock<Arc<dyn DatabaseAdapter>>,
    health_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Build the configured adapter and wrap it in a manager
    pub async fn connect(settings: &DatabaseSettings) -> Result<Arc<Self>, DbError> {
        let adapter = build_adapter(settings).await?;
        info!(engine = settings.engine.display_name(), "database adapter ready");
        Ok(Self::from_adapter(adapter))
    }

    /// Wrap an already-constructed adapter
    pub fn from_adapter(adapter: Arc<dyn DatabaseAdapter>) -> Arc<Self> {
        Arc::new(Self {
            adapter: RwLock::new(adapter),
            health_task: std::sync::Mutex::new(None),
        })
    }

    /// The currently active adapter. Callers keep their clone across a hot
    /// swap, so in-flight operations complete on the pre-swap adapter.
    pub async fn adapter(&self) -> Arc<dyn DatabaseAdapter> {
        self.adapter.read().await.clone()
    }

    /// Start a fixed-interval liveness loop that logs non-healthy results
    pub fn start_health_loop(self: &Arc<Self>, period: Duration) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let adapter = manager.adapter().await;
                match adapter.health_check().await {
                    Ok(result) if result.status == HealthStatus::Healthy => {
                        debug!(response_time_ms = result.response_time_ms, "health check ok");
                    }
                    Ok(result) => {
                        warn!(
                            status = %result.status,
                            response_time_ms = result.response_time_ms,
                            "database health check returned non-healthy status"
                        );
                    }
                    Err(err) => {
                        warn!(error = %err, "database health check failed");
                    }
                }
            }
        });

        let mut slot = self.health_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Stop the health loop if one is running
    pub fn stop_health_loop(&self) {
        let mut slot = self.health_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// Hot swap: close the current adapter and construct a new one from the
    /// new configuration. In-flight calls complete on the old adapter; they
    /// are never force-cancelled.
    pub async fn replace(&self, settings: &DatabaseSettings) -> Result<(), DbError> {
        settings.validate()?;
        let mut slot = self.adapter.write().await;
        slot.close().await;
        let fresh = build_adapter(settings).await?;
        *slot = fresh;
        info!(engine = settings.engine.display_name(), "adapter replaced");
        Ok(())
    }

    /// Stop the health loop and close the adapter
    pub async fn close(&self) {
        self.stop_health_loop();
        self.adapter.read().await.close().await;
    }
}

/// Block until the process receives a termination signal. Callers stop
/// their monitors and close the manager afterwards, before exit.
pub async fn wait_for_termination() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sqlite_settings(dir: &tempfile::TempDir, file: &str) -> DatabaseSettings {
        DatabaseSettings::sqlite(dir.path().join(file).to_str().unwrap())
    }

    #[tokio::test]
    async fn test_connect_and_query() {
        let dir = tempdir().unwrap();
        let manager = ConnectionManager::connect(&sqlite_settings(&dir, "a.db"))
            .await
            .unwrap();
        let adapter = manager.adapter().await;
        assert_eq!(adapter.engine_kind(), EngineKind::Sqlite);
        adapter.query("SELECT 1", &[]).await.unwrap();
        manager.close().await;
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_construction() {
        let mut settings = DatabaseSettings::sqlite("/tmp/x.db");
        settings.path = None;
        assert!(matches!(
            ConnectionManager::connect(&settings).await,
            Err(DbError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_hot_swap_closes_old_adapter() {
        let dir = tempdir().unwrap();
        let manager = ConnectionManager::connect(&sqlite_settings(&dir, "a.db"))
            .await
            .unwrap();

        let old = manager.adapter().await;
        old.query("SELECT 1", &[]).await.unwrap();

        manager
            .replace(&sqlite_settings(&dir, "b.db"))
            .await
            .unwrap();

        // New calls through the manager land on the fresh adapter
        let fresh = manager.adapter().await;
        fresh.query("SELECT 1", &[]).await.unwrap();

        // The pre-swap adapter no longer accepts new calls
        assert!(matches!(
            old.query("SELECT 1", &[]).await,
            Err(DbError::Connection(_))
        ));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let manager = ConnectionManager::connect(&sqlite_settings(&dir, "a.db"))
            .await
            .unwrap();
        manager.start_health_loop(Duration::from_secs(60));
        manager.close().await;
        manager.close().await;
    }
}
