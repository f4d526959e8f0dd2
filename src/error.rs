use std::fmt;

use serde::Serialize;

use crate::llm::ServiceError;
use crate::storage::StorageError;

/// Application-level failures: the things around the pipeline, never the
/// DSL itself (those are defects).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "code", content = "detail")]
pub enum AppError {
    NotFound { what: String },
    IoError { message: String },
    InvalidVariables { message: String },
    SettingsError { message: String },
    NoProvider { message: String },
    ServiceError { message: String },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound { what } => write!(f, "{what} not found"),
            AppError::IoError { message } => write!(f, "I/O error: {message}"),
            AppError::InvalidVariables { message } => {
                write!(f, "Invalid variables file: {message}")
            }
            AppError::SettingsError { message } => write!(f, "Settings error: {message}"),
            AppError::NoProvider { message } => write!(f, "No generation service: {message}"),
            AppError::ServiceError { message } => write!(f, "Generation service error: {message}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::IoError {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::InvalidVariables {
            message: e.to_string(),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(io_err) => AppError::IoError {
                message: io_err.to_string(),
            },
            StorageError::Json(json_err) => AppError::SettingsError {
                message: json_err.to_string(),
            },
            StorageError::Invalid(msg) => AppError::SettingsError { message: msg },
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(e: ServiceError) -> Self {
        AppError::ServiceError {
            message: e.to_string(),
        }
    }
}

impl From<AppError> for String {
    fn from(e: AppError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_codes() {
        let err = AppError::from(StorageError::Invalid("version 9".into()));
        assert_eq!(err.to_string(), "Settings error: version 9");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "SettingsError");
        assert_eq!(json["detail"]["message"], "version 9");
    }

    #[test]
    fn service_errors_keep_their_message() {
        let err = AppError::from(ServiceError::RateLimited);
        assert_eq!(err.to_string(), "Generation service error: rate limited by provider");
    }
}
