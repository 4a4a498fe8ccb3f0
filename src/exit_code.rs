//! Exit codes for CLI operations following Unix conventions.
//!
//! - `0`: Success
//! - `1`: General error
//! - `2`: Blocking error, e.g. a corrupt data directory
//! - `3-125`: Specific recoverable errors

use crate::error::EmbedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    /// Critical error that should halt automation
    BlockingError = 2,
    /// Record or prototype not found
    NotFound = 3,
    /// Input vector rejected by the vector contract
    InvalidVector = 4,
    IoError = 5,
    ConfigError = 6,
    /// Not enough rows for the requested index
    InsufficientData = 7,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl ExitCode {
    /// Maps an error to the code scripts can branch on.
    pub fn from_error(error: &EmbedError) -> Self {
        match error {
            EmbedError::RecordNotFound { .. }
            | EmbedError::PrototypeNotFound { .. }
            | EmbedError::NotAMember { .. } => Self::NotFound,
            EmbedError::Vector(_) | EmbedError::MissingEmbedding { .. } => Self::InvalidVector,
            EmbedError::InvalidFormat { .. } | EmbedError::Journal(_) => Self::BlockingError,
            EmbedError::Storage { .. } => Self::IoError,
            EmbedError::Config { .. } => Self::ConfigError,
            EmbedError::InsufficientData { .. } => Self::InsufficientData,
            _ => Self::GeneralError,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
