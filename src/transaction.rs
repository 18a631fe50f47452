// Transaction context
// One physical connection, one terminal state, reached exactly once.

use async_trait::async_trait;

use crate::error::DbError;
use crate::value::{QueryOutcome, SqlValue};

/// A connection pinned to an open transaction. Implementations hold the
/// physical resource for the whole transaction and release it on drop.
#[async_trait]
pub trait TxConnection: Send {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome, DbError>;
    async fn commit(&mut self) -> Result<(), DbError>;
    async fn rollback(&mut self) -> Result<(), DbError>;
}

/// Transaction lifecycle states. Committed and RolledBack are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// Ephemeral handle bound to exactly one physical connection for its
/// lifetime. Every statement issued through it runs on that connection,
/// in issued order.
pub struct TransactionContext {
    conn: Box<dyn TxConnection>,
    state: TxState,
}

impl TransactionContext {
    pub(crate) fn new(conn: Box<dyn TxConnection>) -> Self {
        Self {
            conn,
            state: TxState::Open,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    fn ensure_open(&self, operation: &str) -> Result<(), DbError> {
        match self.state {
            TxState::Open => Ok(()),
            TxState::Committed => Err(DbError::Transaction(format!(
                "cannot {}: transaction already committed",
                operation
            ))),
            TxState::RolledBack => Err(DbError::Transaction(format!(
                "cannot {}: transaction already rolled back",
                operation
            ))),
        }
    }

    /// Run a statement inside the transaction.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryOutcome, DbError> {
        self.ensure_open("query")?;
        self.conn.execute(sql, params).await
    }

    /// Commit the transaction. A commit rejected by the engine leaves the
    /// transaction rolled back server-side, so the context moves to the
    /// rolled-back terminal state rather than staying open.
    pub async fn commit(&mut self) -> Result<(), DbError> {
        self.ensure_open("commit")?;
        match self.conn.commit().await {
            Ok(()) => {
                self.state = TxState::Committed;
                Ok(())
            }
            Err(err) => {
                self.state = TxState::RolledBack;
                Err(err)
            }
        }
    }

    /// Roll the transaction back. The terminal state is reached even if the
    /// engine reports an error, since the transaction cannot continue.
    pub async fn rollback(&mut self) -> Result<(), DbError> {
        self.ensure_open("rollback")?;
        let result = self.conn.rollback().await;
        self.state = TxState::RolledBack;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    // Mock connection recording the calls it receives
    struct MockTxConnection {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_commit: bool,
    }

    #[async_trait]
    impl TxConnection for MockTxConnection {
        async fn execute(
            &mut self,
            _sql: &str,
            _params: &[SqlValue],
        ) -> Result<QueryOutcome, DbError> {
            self.calls.lock().unwrap().push("execute");
            Ok(QueryOutcome::affected(1, "UPDATE"))
        }

        async fn commit(&mut self) -> Result<(), DbError> {
            self.calls.lock().unwrap().push("commit");
            if self.fail_commit {
                Err(DbError::Transaction("commit rejected".to_string()))
            } else {
                Ok(())
            }
        }

        async fn rollback(&mut self) -> Result<(), DbError> {
            self.calls.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    fn context(fail_commit: bool) -> (TransactionContext, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let conn = MockTxConnection {
            calls: Arc::clone(&calls),
            fail_commit,
        };
        (TransactionContext::new(Box::new(conn)), calls)
    }

    #[tokio::test]
    async fn test_commit_is_terminal() {
        let (mut tx, calls) = context(false);
        tx.query("UPDATE t SET x = 1", &[]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TxState::Committed);

        assert!(tx.commit().await.is_err());
        assert!(tx.rollback().await.is_err());
        assert!(tx.query("SELECT 1", &[]).await.is_err());
        // The guarded calls never reached the connection
        assert_eq!(*calls.lock().unwrap(), vec!["execute", "commit"]);
    }

    #[tokio::test]
    async fn test_rollback_is_terminal() {
        let (mut tx, calls) = context(false);
        tx.rollback().await.unwrap();
        assert_eq!(tx.state(), TxState::RolledBack);

        assert!(tx.commit().await.is_err());
        assert!(tx.rollback().await.is_err());
        assert_eq!(*calls.lock().unwrap(), vec!["rollback"]);
    }

    #[tokio::test]
    async fn test_failed_commit_moves_to_rolled_back() {
        let (mut tx, _calls) = context(true);
        assert!(tx.commit().await.is_err());
        assert_eq!(tx.state(), TxState::RolledBack);
        // No second finalization is possible
        assert!(tx.rollback().await.is_err());
    }
}
