use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for bibsync_core::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Database(e) => bibsync_core::Error::Database(e),
            other => bibsync_core::Error::internal(other),
        }
    }
}
