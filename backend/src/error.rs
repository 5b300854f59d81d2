//! Application error types and result alias.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Bad or missing input. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// External dump/restore tool exited unsuccessfully.
    #[error("{tool} failed ({}): {stderr}", exit_label(.exit_code))]
    ToolExecution {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Operation exceeded its allotted time; the process was killed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Checksum or decryption failure.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Storage backend failure. Transient failures are retried by the backend.
    #[error("Storage error: {message}")]
    Storage { message: String, transient: bool },

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Exclusivity violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Task was cancelled by the caller
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Machine-distinguishable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    ToolExecution,
    Timeout,
    Integrity,
    Storage,
    NotFound,
    Conflict,
    Cancelled,
    Internal,
}

impl AppError {
    /// Non-transient storage failure (auth, permissions, malformed request).
    pub fn storage(message: impl Into<String>) -> Self {
        AppError::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// Storage failure worth retrying (network, throttling, 5xx).
    pub fn transient(message: impl Into<String>) -> Self {
        AppError::Storage {
            message: message.into(),
            transient: true,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Config(_) | AppError::Json(_) => ErrorKind::Configuration,
            AppError::ToolExecution { .. } => ErrorKind::ToolExecution,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::Integrity(_) => ErrorKind::Integrity,
            AppError::Storage { .. } | AppError::Io(_) => ErrorKind::Storage,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::Cancelled(_) => ErrorKind::Cancelled,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable code for API responses and CLI diagnostics.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Configuration => "CONFIG_ERROR",
            ErrorKind::ToolExecution => "TOOL_EXECUTION_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Integrity => "INTEGRITY_ERROR",
            ErrorKind::Storage => "STORAGE_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Configuration => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Integrity => 422,
            ErrorKind::Cancelled => 499,
            ErrorKind::ToolExecution => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Storage => match self {
                AppError::Storage {
                    transient: true, ..
                } => 503,
                _ => 500,
            },
            ErrorKind::Internal => 500,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Storage { transient, .. } => *transient,
            AppError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
