use std::io;

use http::status::StatusCode;
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum ExecutorError {
    #[error("Identity store error: {0}")]
    Store(String),
    #[error("Invalid request: {0}")]
    Command(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Kernel error: {0}")]
    Kernel(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("File watcher error: {0}")]
    Watch(String),
}

impl ExecutorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ExecutorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExecutorError::Command(_) => StatusCode::BAD_REQUEST,
            ExecutorError::Custom(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExecutorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExecutorError::Kernel(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExecutorError::NotFound(_) => StatusCode::NOT_FOUND,
            ExecutorError::PermissionDenied => StatusCode::FORBIDDEN,
            ExecutorError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExecutorError::Watch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<toml::de::Error> for ExecutorError {
    fn from(src: toml::de::Error) -> ExecutorError {
        ExecutorError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for ExecutorError {
    fn from(src: toml::ser::Error) -> ExecutorError {
        ExecutorError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for ExecutorError {
    fn from(src: JsonError) -> ExecutorError {
        ExecutorError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for ExecutorError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => ExecutorError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => ExecutorError::PermissionDenied,
            _ => ExecutorError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<RegexError> for ExecutorError {
    fn from(x: RegexError) -> Self {
        ExecutorError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<JoinError> for ExecutorError {
    fn from(x: JoinError) -> Self {
        if x.is_cancelled() {
            ExecutorError::Custom("task was cancelled".to_string())
        } else {
            ExecutorError::Custom(format!("task panicked: {x}"))
        }
    }
}

impl From<NotifyError> for ExecutorError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => ExecutorError::Watch(format!(
                "notify-debouncer: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => ExecutorError::Watch(format!(
                "notify-debouncer: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => ExecutorError::NotFound(format!(
                "notify-debouncer: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => ExecutorError::NotFound(format!(
                "notify-debouncer: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                ExecutorError::Watch("notify-debouncer invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                ExecutorError::Watch("notify-debouncer max file watch limit reached".to_string())
            }
        }
    }
}

impl From<SqlxError> for ExecutorError {
    fn from(db_error: SqlxError) -> Self {
        ExecutorError::Store(format!("database error: {db_error:?}"))
    }
}

impl From<sqlx::migrate::MigrateError> for ExecutorError {
    fn from(migrate_error: sqlx::migrate::MigrateError) -> Self {
        ExecutorError::Store(format!("database migration error: {migrate_error}"))
    }
}

#[cfg(feature = "service")]
impl axum::response::IntoResponse for ExecutorError {
    fn into_response(self) -> axum::response::Response {
        let body = axum::Json(serde_json::json!({
            "message": self.to_string(),
            "reason": self.status_code().canonical_reason(),
        }));
        (self.status_code(), body).into_response()
    }
}
