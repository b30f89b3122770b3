//! Error types for analog-core.

use thiserror::Error;

/// Result alias for line construction.
pub type LineResult<T> = Result<T, LineError>;

/// Structural errors raised while building an [`AnalogLine`](crate::line::AnalogLine).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    /// No owning line group was supplied.
    #[error("circuit group is missing")]
    MissingGroup,

    /// Another line already backs the requested circuit.
    #[error("circuit {code} already allocated")]
    CircuitAllocated { code: u32 },

    /// The requested circuit is not in the group.
    #[error("circuit {code} is missing")]
    MissingCircuit { code: u32 },
}

/// Configuration parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The `callsetup` key carries an unrecognized word.
    #[error("unknown call setup mode '{value}'")]
    UnknownCallSetup { value: String },
}
