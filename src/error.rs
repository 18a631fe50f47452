// Error taxonomy
// Data-path errors always reach the caller; observability-path errors never do.

use thiserror::Error;

/// Common database error type
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query execution error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Monitoring error: {0}")]
    Monitoring(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Error tag used for metric labels and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Config(_) => "config",
            DbError::Connection(_) => "connection",
            DbError::Query(_) => "query",
            DbError::Transaction(_) => "transaction",
            DbError::Monitoring(_) => "monitoring",
            DbError::Io(_) => "io",
        }
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        DbError::Query(err.to_string())
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::Query(err.to_string())
    }
}

impl<E: std::error::Error + 'static> From<bb8::RunError<E>> for DbError {
    fn from(err: bb8::RunError<E>) -> Self {
        match err {
            bb8::RunError::TimedOut => {
                DbError::Connection("timed out waiting for a pooled connection".to_string())
            }
            bb8::RunError::User(e) => DbError::Connection(e.to_string()),
        }
    }
}

/// Truncate SQL text for log output. Parameters are never logged in full,
/// and statement text is capped so oversized queries cannot flood the log.
pub(crate) fn truncate_sql(sql: &str, cap: usize) -> String {
    if sql.len() <= cap {
        sql.to_string()
    } else {
        let mut end = cap;
        while !sql.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &sql[..end])
    }
}
