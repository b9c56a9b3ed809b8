#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt job row: {0}")]
    Corrupt(String),

    #[error("validation error: {0}")]
    Validation(String),
}

pub type JobResult<T> = std::result::Result<T, JobError>;
