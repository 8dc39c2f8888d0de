use crate::models::JobState;

/// Low-level errors raised by stores, scorers and the lease
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("External API error: {0}")]
    ExternalApi(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether retrying the same operation could succeed
    ///
    /// Only I/O-level failures qualify: dropped connections, pool timeouts,
    /// Postgres connection exceptions (SQLSTATE class 08) and transaction
    /// rollbacks such as serialization failures or deadlocks (class 40).
    /// Constraint violations and bad data never do.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(e) => match e {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .map(|code| code.starts_with("08") || code.starts_with("40"))
                    .unwrap_or(false),
                _ => false,
            },
            AppError::Cache(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            AppError::HttpClient(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Fatal outcomes of a refresh run
///
/// Any of these leaves the previously published snapshot authoritative.
#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("Staging failed: {0}")]
    Staging(#[source] AppError),

    #[error("Scoring failed: {0}")]
    Scoring(#[source] AppError),

    #[error("Publishing failed: {0}")]
    Persistence(#[source] AppError),

    #[error("Deadline exceeded during {stage}")]
    DeadlineExceeded { stage: JobState },

    #[error("Another refresh holds the lease for job '{0}'")]
    AlreadyRunning(String),

    #[error("Refresh interrupted during {stage}")]
    Interrupted { stage: JobState },

    #[error("Invalid configuration: {0}")]
    Config(String),
}
