//! Analog line (FXO/FXS) layer of the rsig signalling stack.
//!
//! Builds on [`rsig_circuit_core`]: an [`AnalogLine`] owns one circuit of an
//! [`AnalogLineGroup`] and adds line-side semantics: a forward-only state
//! machine, symmetric peer pairing for monitored FXO/FXS pairs, echo
//! canceller control and per-line timers.

pub mod config;
pub mod errors;
pub mod group;
pub mod line;

pub use config::{AnalogLineConfig, CallSetup};
pub use errors::{ConfigError, LineError, LineResult};
pub use group::AnalogLineGroup;
pub use line::{AnalogLine, AnalogLineEvent, LineKind, LineState, TimerKind};
