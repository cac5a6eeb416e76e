use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("STORAGE_UNAVAILABLE: {0}")]
    StorageUnavailable(String),
    #[error("SEQUENCE_DRIFT: persisted sequence {persisted} is behind max id {max_id}")]
    SequenceDrift { persisted: i64, max_id: i64 },
    #[error("PARTITION_INCONSISTENCY: {0}")]
    PartitionInconsistency(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION",
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::SequenceDrift { .. } => "SEQUENCE_DRIFT",
            Self::PartitionInconsistency(_) => "PARTITION_INCONSISTENCY",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::StorageUnavailable(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        match &value {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound(value.to_string()),
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::SystemIoFailure
                | ErrorCode::PermissionDenied
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt => Self::StorageUnavailable(value.to_string()),
                _ => Self::Internal(value.to_string()),
            },
            _ => Self::Internal(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
