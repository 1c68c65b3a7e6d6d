use thiserror::Error;

/// Main error type for weave sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation broke a structural invariant (e.g. empty node id)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("ID parse error: {0}")]
    IdParse(#[from] crate::types::ids::IdParseError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Stable error code for logs and wire error payloads
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::InvalidOperation(_) => "invalid_operation",
            SyncError::Config(_) => "invalid_config",
            SyncError::Io(_) => "io_error",
            SyncError::Json(_) => "malformed",
            SyncError::TomlParse(_) => "invalid_config",
            SyncError::TomlSerialize(_) => "internal_error",
            SyncError::IdParse(_) => "invalid_args",
            SyncError::Internal(_) => "internal_error",
        }
    }

    /// Whether the error breaks a local invariant and must reach the caller
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, SyncError::InvalidOperation(_))
    }
}
