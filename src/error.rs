//! Error types for modhost.

use thiserror::Error;

/// Common error type for modhost.
#[derive(Error, Debug)]
pub enum ModhostError {
    /// Database error.
    ///
    /// The durable backing store failed. Errors from sqlx are converted
    /// automatically.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Module source failed to compile.
    #[error("compile error: {0}")]
    Compile(String),

    /// No module is installed under the given name.
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    /// The module has no handler for the requested command.
    #[error("module '{module}' has no command '{command}'")]
    CommandNotFound { module: String, command: String },

    /// The script raised an error or exceeded a resource limit.
    #[error("script fault: {0}")]
    ScriptFault(String),

    /// A listen call was cancelled by its caller.
    #[error("listen cancelled")]
    Cancelled,

    /// Validation error for caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

// Conversion from sqlx errors
impl From<sqlx::Error> for ModhostError {
    fn from(e: sqlx::Error) -> Self {
        ModhostError::Database(e.to_string())
    }
}

/// Result type alias for modhost operations.
pub type Result<T> = std::result::Result<T, ModhostError>;
