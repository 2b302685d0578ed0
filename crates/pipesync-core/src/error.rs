use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipesyncError {
    // Store errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict updating {kind} {id}: resource version {expected} is stale")]
    Conflict {
        kind: &'static str,
        id: String,
        expected: u64,
    },

    #[error("Database error: {0}")]
    Database(String),

    // Reference errors
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    // Engine errors
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Engine {op} timed out after {timeout_secs}s")]
    EngineTimeout { op: &'static str, timeout_secs: u64 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipesyncError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True when the store reported that the record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_invalid_reference(&self) -> bool {
        matches!(self, Self::InvalidReference(_))
    }
}

pub type Result<T> = std::result::Result<T, PipesyncError>;
