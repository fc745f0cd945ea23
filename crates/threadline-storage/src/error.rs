// Storage error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by the history store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Requested thread, run or event does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// DSN names a backend this store cannot talk to
    #[error("unsupported database: {0}")]
    UnsupportedDsn(String),

    /// Stored value could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Database error
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Database(other),
        }
    }
}
