//! Call-control and circuit-reservation core of the rsig signalling stack.
//!
//! This crate mediates between higher-level call logic (SS7/ISDN/analog call
//! state machines) and a pool of physical or logical circuits:
//!
//! - [`CircuitGroup`] owns [`Circuit`]s organized into [`CircuitSpan`]s and
//!   arbitrates reservation according to a configurable [`AllocationStrategy`]
//!   with even/odd restrictions and parity fallback.
//! - [`Circuit`] tracks per-channel status and queues driver events, with at
//!   most one [`CircuitEvent`] in flight toward the consumer at a time.
//! - [`CallControl`] tracks live [`Call`]s, pumps their [`SignallingEvent`]s
//!   upward and broadcasts a terminal `Disable` event on shutdown.
//!
//! Wire/driver I/O is delegated to a [`CircuitDriver`] plug-in; protocol
//! stacks sit above the [`Call`] trait.

pub mod call;
pub mod circuit;
pub mod config;
pub mod control;
pub mod errors;
pub mod event;
pub mod group;

pub use call::{Call, CallData, SignallingMessage};
pub use circuit::{
    Circuit, CircuitDriver, CircuitEvent, CircuitEventKind, CircuitSpan, CircuitStatus,
    CircuitType, LOCK_LOCAL_BLOCK, LOCK_MAINTENANCE, LOCK_REMOTE_BLOCK,
};
pub use config::{ControlConfig, StrategyRestrict};
pub use control::{CallControl, Dumper};
pub use errors::{ConfigError, ConfigResult};
pub use event::{SignallingEvent, SignallingKind};
pub use group::{
    flip_parity, strategy_word, AllocationStrategy, CircuitGroup, FALLBACK, ONLY_EVEN, ONLY_ODD,
    SELECTOR_MASK,
};
