//! Error types for circuit-core.
//!
//! Operational failures in this crate are reported in-band: reservation
//! returns `None` for congestion, state rejections return `false`. Typed
//! errors cover configuration parsing only.

use thiserror::Error;

/// Result alias for configuration parsing.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The `strategy` key carries an unrecognized word.
    #[error("unknown allocation strategy '{value}'")]
    UnknownStrategy { value: String },

    /// The `strategy-restrict` key carries an unrecognized word.
    #[error("unknown strategy restriction '{value}'")]
    UnknownRestrict { value: String },
}
