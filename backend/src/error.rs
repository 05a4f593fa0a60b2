use serde::Serialize;

#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("{message} ({code})")]
    BusinessRule { code: String, message: String },

    #[error("Provider transport error: {0}")]
    Transport(String),

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl AppError {
    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    pub fn business(code: &str, message: impl Into<String>) -> Self {
        Self::BusinessRule {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code, mirrored to clients by the fan-out layer.
    pub fn code(&self) -> &str {
        match self {
            Self::Database(_) => "DATABASE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::BusinessRule { code, .. } => code,
            Self::Transport(_) => "TRANSPORT",
            Self::Validation { .. } => "VALIDATION",
            Self::Config(_) => "CONFIG",
            Self::Io(_) => "IO",
            Self::Internal(_) => "INTERNAL",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled(_) => "CANCELLED",
        }
    }

    /// Wrap an existing error with additional context message.
    pub fn context(self, msg: impl Into<String>) -> Self {
        let ctx = msg.into();
        match self {
            Self::Database(e) => Self::Database(format!("{ctx}: {e}")),
            Self::Transport(e) => Self::Transport(format!("{ctx}: {e}")),
            Self::Io(e) => Self::Io(format!("{ctx}: {e}")),
            Self::Internal(e) => Self::Internal(format!("{ctx}: {e}")),
            Self::Config(e) => Self::Config(format!("{ctx}: {e}")),
            Self::Timeout(e) => Self::Timeout(format!("{ctx}: {e}")),
            Self::Cancelled(e) => Self::Cancelled(format!("{ctx}: {e}")),
            other => other, // Structured variants pass through unchanged
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::PoolTimedOut => {
                Self::Timeout(format!("Database connection pool timed out: {value}"))
            }
            sqlx::Error::ColumnNotFound(col) => {
                Self::Database(format!("Column '{col}' not found: {value}"))
            }
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            _ => Self::Database(value.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(value: sqlx::migrate::MigrateError) -> Self {
        Self::Database(value.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout(format!("Provider request timed out: {value}"))
        } else {
            Self::Transport(value.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Transport(format!("Malformed provider payload: {value}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}
