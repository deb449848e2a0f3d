//! Error taxonomy shared by every module.
//!
//! Validation errors are raised before any backend call and carry a
//! user-facing message. Backend errors keep the HTTP status and the
//! PostgREST error code so callers can tell a row-level-security denial
//! apart from an ordinary server failure.

use thiserror::Error;

/// PostgREST / Postgres codes that mean "the request was authenticated but
/// not allowed to see or touch the rows".
const PERMISSION_DENIED_CODES: &[&str] = &["42501", "PGRST301", "PGRST302"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Backend,
    Network,
    Database,
    Config,
    Serialization,
}

#[derive(Debug, Clone, Error)]
pub enum PosError {
    #[error("{0}")]
    Validation(String),

    #[error("Backend error (HTTP {status}): {message}")]
    Backend {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    Serialization(String),
}

pub type PosResult<T> = Result<T, PosError>;

impl PosError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::Network(_) => ErrorKind::Network,
            Self::Database(_) => ErrorKind::Database,
            Self::Config(_) => ErrorKind::Config,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// True when the backend refused access (401/403 or an RLS error code).
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Backend { status, code, .. } => {
                matches!(status, 401 | 403)
                    || code
                        .as_deref()
                        .map(|c| PERMISSION_DENIED_CODES.contains(&c))
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Short message suitable for a toast.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Backend { .. } if self.is_permission_denied() => {
                "Access denied by the store database (check row-level security policies)"
                    .to_string()
            }
            Self::Backend { status, .. } if *status >= 500 => {
                format!("Store database is unavailable (HTTP {status})")
            }
            Self::Backend { message, .. } => message.clone(),
            Self::Network(_) => "Cannot reach the store database".to_string(),
            Self::Database(_) => "Local database error".to_string(),
            Self::Config(msg) => msg.clone(),
            Self::Serialization(_) => "Unexpected data from the store database".to_string(),
        }
    }
}

impl From<reqwest::Error> for PosError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::Serialization(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::Backend {
                status: status.as_u16(),
                code: None,
                message: err.to_string(),
            };
        }
        if err.is_timeout() {
            return Self::Network(format!("request timed out: {err}"));
        }
        if err.is_connect() {
            return Self::Network(format!("connection failed: {err}"));
        }
        Self::Network(err.to_string())
    }
}

impl From<rusqlite::Error> for PosError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PosError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rust_decimal::Error> for PosError {
    fn from(err: rust_decimal::Error) -> Self {
        Self::Serialization(format!("decimal: {err}"))
    }
}
