//! Circuits, circuit spans and circuit events.
//!
//! A [`Circuit`] is one addressable signalling/media channel belonging to a
//! [`CircuitGroup`](crate::group::CircuitGroup). Circuits carry:
//!
//! - a status ([`CircuitStatus`]) driven by the reservation allocator and the
//!   hardware driver,
//! - administrative lock flags (blocking bits, distinct from runtime mutexes),
//! - a FIFO queue of [`CircuitEvent`]s produced by the driver, with at most
//!   one event in flight toward the consumer at any time.
//!
//! Hardware access is delegated to a [`CircuitDriver`] plug-in; the default
//! driver accepts every status change and refuses outbound events.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::group::CircuitGroup;

/// Allocate a process-unique event id.
///
/// Ids pair a delivered event with the "last event" slot of its origin, so a
/// stale drop notification can never clear a newer event.
pub(crate) fn next_event_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Administrative lock bit: locally blocked circuit.
pub const LOCK_LOCAL_BLOCK: u32 = 0x0001;
/// Administrative lock bit: remotely blocked circuit.
pub const LOCK_REMOTE_BLOCK: u32 = 0x0002;
/// Administrative lock bit: circuit under local maintenance.
pub const LOCK_MAINTENANCE: u32 = 0x0004;

/// Lifecycle status of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CircuitStatus {
    /// Removed from its group; only external holders keep it alive.
    Missing,
    /// Present but administratively unusable.
    Disabled,
    /// Free for reservation.
    Idle,
    /// Allocated to a caller, not yet carrying media.
    Reserved,
    /// Carrying a connected call.
    Connected,
    /// Driver-specific special mode.
    Special,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitStatus::Missing => "Missing",
            CircuitStatus::Disabled => "Disabled",
            CircuitStatus::Idle => "Idle",
            CircuitStatus::Reserved => "Reserved",
            CircuitStatus::Connected => "Connected",
            CircuitStatus::Special => "Special",
        };
        f.write_str(name)
    }
}

/// Driver-defined circuit type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitType {
    Unknown,
    Local,
    Tdm,
    Rtp,
}

/// Type tag of a circuit event.
///
/// The set is open ended toward drivers; these are the tags the core and the
/// analog line layer interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitEventKind {
    Unknown,
    Dtmf,
    PulseStart,
    PulseDigit,
    Alarm,
    NoAlarm,
    RingBegin,
    RingEnd,
    Polarity,
    OnHook,
    OffHook,
    Flash,
    Wink,
    StartLine,
    Timeout,
    Generic,
}

impl fmt::Display for CircuitEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Hardware/driver plug-in for a circuit.
///
/// Methods run with the circuit's internal lock held and must not call back
/// into the same circuit.
pub trait CircuitDriver: Send + Sync {
    /// Approve or refuse a status change. `sync` requests that any pending
    /// hardware reconfiguration completes before returning.
    fn on_status_change(&self, code: u32, new_status: CircuitStatus, sync: bool) -> bool {
        let _ = (code, new_status, sync);
        true
    }

    /// Send an event toward the hardware.
    fn send_event(&self, code: u32, kind: CircuitEventKind, params: &HashMap<String, String>) -> bool {
        let _ = (code, kind, params);
        false
    }

    /// Approve or refuse a driver-visible parameter change.
    fn on_param(&self, code: u32, name: &str, value: &str) -> bool {
        let _ = (code, name, value);
        true
    }
}

/// Driver used when none is supplied.
struct NullDriver;

impl CircuitDriver for NullDriver {}

/// Event not yet delivered; held in the circuit's queue.
///
/// Queued events carry no back-reference so a pending queue cannot keep its
/// circuit alive.
struct QueuedEvent {
    id: u64,
    kind: CircuitEventKind,
    params: HashMap<String, String>,
}

/// A delivered circuit event.
///
/// Holds a strong reference to its originating circuit. Dropping the event
/// notifies the circuit so the next queued event becomes deliverable.
pub struct CircuitEvent {
    id: u64,
    circuit: Arc<Circuit>,
    kind: CircuitEventKind,
    name: String,
    params: HashMap<String, String>,
}

impl CircuitEvent {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> CircuitEventKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

impl Drop for CircuitEvent {
    fn drop(&mut self) {
        self.circuit.event_terminated(self.id);
    }
}

impl fmt::Debug for CircuitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitEvent")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("circuit", &self.circuit.code())
            .finish()
    }
}

struct CircuitState {
    status: CircuitStatus,
    lock_flags: u32,
    queue: VecDeque<QueuedEvent>,
    last_event_id: Option<u64>,
    params: HashMap<String, String>,
}

/// One addressable signalling/media channel.
pub struct Circuit {
    code: u32,
    kind: CircuitType,
    driver: Arc<dyn CircuitDriver>,
    group: Mutex<Weak<CircuitGroup>>,
    span: Mutex<Weak<CircuitSpan>>,
    state: Mutex<CircuitState>,
}

impl Circuit {
    /// Create a circuit attached to `group` in the default `Disabled` status.
    pub fn new(
        kind: CircuitType,
        code: u32,
        group: &Arc<CircuitGroup>,
        span: Option<&Arc<CircuitSpan>>,
    ) -> Arc<Self> {
        Self::with_driver(kind, code, CircuitStatus::Disabled, Arc::new(NullDriver), group, span)
    }

    /// Create a circuit with an explicit initial status.
    pub fn with_status(
        kind: CircuitType,
        code: u32,
        status: CircuitStatus,
        group: &Arc<CircuitGroup>,
        span: Option<&Arc<CircuitSpan>>,
    ) -> Arc<Self> {
        Self::with_driver(kind, code, status, Arc::new(NullDriver), group, span)
    }

    /// Create a circuit backed by a specific driver.
    pub fn with_driver(
        kind: CircuitType,
        code: u32,
        status: CircuitStatus,
        driver: Arc<dyn CircuitDriver>,
        group: &Arc<CircuitGroup>,
        span: Option<&Arc<CircuitSpan>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            code,
            kind,
            driver,
            group: Mutex::new(Arc::downgrade(group)),
            span: Mutex::new(span.map(Arc::downgrade).unwrap_or_default()),
            state: Mutex::new(CircuitState {
                status,
                lock_flags: 0,
                queue: VecDeque::new(),
                last_event_id: None,
                params: HashMap::new(),
            }),
        })
    }

    /// Local code inside the owning group.
    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn kind(&self) -> CircuitType {
        self.kind
    }

    /// Owning group, if still attached.
    pub fn group(&self) -> Option<Arc<CircuitGroup>> {
        self.group.lock().unwrap().upgrade()
    }

    /// Owning span, if any.
    pub fn span(&self) -> Option<Arc<CircuitSpan>> {
        self.span.lock().unwrap().upgrade()
    }

    pub(crate) fn detach_group(&self) {
        *self.group.lock().unwrap() = Weak::new();
    }

    pub(crate) fn span_is(&self, span: &Arc<CircuitSpan>) -> bool {
        self.span.lock().unwrap().ptr_eq(&Arc::downgrade(span))
    }

    pub fn status(&self) -> CircuitStatus {
        self.state.lock().unwrap().status
    }

    /// Change the circuit status, giving the driver a chance to refuse.
    pub fn set_status(&self, new_status: CircuitStatus, sync: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status == new_status {
            return true;
        }
        if !self.driver.on_status_change(self.code, new_status, sync) {
            return false;
        }
        debug!(cic = self.code, from = %state.status, to = %new_status, "circuit status changed");
        state.status = new_status;
        true
    }

    /// Atomically move `Idle -> Reserved`. Any other starting status fails.
    pub fn reserve(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != CircuitStatus::Idle {
            return false;
        }
        if !self.driver.on_status_change(self.code, CircuitStatus::Reserved, true) {
            return false;
        }
        state.status = CircuitStatus::Reserved;
        true
    }

    /// Connect the circuit: status moves to `Connected`.
    pub fn connect(&self) -> bool {
        self.set_status(CircuitStatus::Connected, true)
    }

    /// Disconnect the circuit: status moves back to `Reserved`.
    pub fn disconnect(&self) -> bool {
        self.set_status(CircuitStatus::Reserved, true)
    }

    pub fn lock(&self, mask: u32) {
        self.state.lock().unwrap().lock_flags |= mask;
    }

    pub fn unlock(&self, mask: u32) {
        self.state.lock().unwrap().lock_flags &= !mask;
    }

    /// True when any bit of `mask` is set in the lock flags.
    pub fn locked(&self, mask: u32) -> bool {
        self.state.lock().unwrap().lock_flags & mask != 0
    }

    /// Set a driver-visible parameter.
    pub fn set_param(&self, name: &str, value: &str) -> bool {
        if !self.driver.on_param(self.code, name, value) {
            return false;
        }
        self.state
            .lock()
            .unwrap()
            .params
            .insert(name.to_string(), value.to_string());
        true
    }

    pub fn get_param(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().params.get(name).cloned()
    }

    /// Append an event produced by the driver to the FIFO queue.
    pub fn enqueue_event(self: &Arc<Self>, kind: CircuitEventKind, params: HashMap<String, String>) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(QueuedEvent {
            id: next_event_id(),
            kind,
            params,
        });
    }

    /// Deliver the head of the event queue.
    ///
    /// Returns `None` while a previously delivered event is still alive: at
    /// most one event per circuit is in flight. The delivered event occupies
    /// the in-flight slot until it is dropped.
    pub fn get_event(self: &Arc<Self>, _now: Instant) -> Option<CircuitEvent> {
        let mut state = self.state.lock().unwrap();
        if state.last_event_id.is_some() {
            return None;
        }
        let queued = state.queue.pop_front()?;
        state.last_event_id = Some(queued.id);
        drop(state);
        Some(CircuitEvent {
            id: queued.id,
            circuit: Arc::clone(self),
            kind: queued.kind,
            name: queued.kind.to_string(),
            params: queued.params,
        })
    }

    /// Send an event toward the driver. The default driver refuses.
    pub fn send_event(&self, kind: CircuitEventKind, params: &HashMap<String, String>) -> bool {
        self.driver.send_event(self.code, kind, params)
    }

    /// Drop all queued events.
    pub fn clear_events(&self) {
        self.state.lock().unwrap().queue.clear();
    }

    /// Number of queued (undelivered) events.
    pub fn pending_events(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    fn event_terminated(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.last_event_id == Some(id) {
            state.last_event_id = None;
        }
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("code", &self.code)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

/// A driver-defined block of related circuits.
///
/// A span registers itself with its group on construction; dropping the last
/// external handle after the group has let go requests removal of the span's
/// circuits (`del_cics = true`, `del_span = false`).
pub struct CircuitSpan {
    id: String,
    group: Weak<CircuitGroup>,
    detached: AtomicBool,
}

impl CircuitSpan {
    pub fn new(id: &str, group: &Arc<CircuitGroup>) -> Arc<Self> {
        let span = Arc::new(Self {
            id: id.to_string(),
            group: Arc::downgrade(group),
            detached: AtomicBool::new(false),
        });
        group.insert_span(&span);
        span
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> Option<Arc<CircuitGroup>> {
        self.group.upgrade()
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::Relaxed);
    }
}

impl Drop for CircuitSpan {
    fn drop(&mut self) {
        if self.detached.load(Ordering::Relaxed) {
            return;
        }
        if let Some(group) = self.group.upgrade() {
            group.remove_span_by_id(&self.id, true, false);
        }
    }
}

impl fmt::Debug for CircuitSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitSpan").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{strategy_word, AllocationStrategy, CircuitGroup};

    fn group() -> Arc<CircuitGroup> {
        CircuitGroup::new("test", 0, strategy_word(AllocationStrategy::Increment, 0))
    }

    #[test]
    fn reserve_requires_idle() {
        let group = group();
        let cic = Circuit::new(CircuitType::Tdm, 0, &group, None);
        assert_eq!(cic.status(), CircuitStatus::Disabled);
        assert!(!cic.reserve());
        assert!(cic.set_status(CircuitStatus::Idle, false));
        assert!(cic.reserve());
        assert_eq!(cic.status(), CircuitStatus::Reserved);
        // Second reservation must fail: the circuit is no longer idle.
        assert!(!cic.reserve());
    }

    #[test]
    fn lock_flags_are_a_bitset() {
        let group = group();
        let cic = Circuit::new(CircuitType::Tdm, 0, &group, None);
        assert!(!cic.locked(LOCK_LOCAL_BLOCK));
        cic.lock(LOCK_LOCAL_BLOCK | LOCK_MAINTENANCE);
        assert!(cic.locked(LOCK_LOCAL_BLOCK));
        assert!(cic.locked(LOCK_MAINTENANCE));
        assert!(!cic.locked(LOCK_REMOTE_BLOCK));
        cic.unlock(LOCK_LOCAL_BLOCK);
        assert!(!cic.locked(LOCK_LOCAL_BLOCK));
        assert!(cic.locked(LOCK_MAINTENANCE | LOCK_REMOTE_BLOCK));
    }

    #[test]
    fn single_event_in_flight() {
        let group = group();
        let cic = Circuit::new(CircuitType::Tdm, 0, &group, None);
        cic.enqueue_event(CircuitEventKind::OffHook, HashMap::new());
        cic.enqueue_event(CircuitEventKind::Dtmf, HashMap::new());

        let now = Instant::now();
        let first = cic.get_event(now).expect("first event");
        assert_eq!(first.kind(), CircuitEventKind::OffHook);
        // Second delivery is blocked while the first event is alive.
        assert!(cic.get_event(now).is_none());
        drop(first);
        let second = cic.get_event(now).expect("second event");
        assert_eq!(second.kind(), CircuitEventKind::Dtmf);
        drop(second);
        assert!(cic.get_event(now).is_none());
    }

    #[test]
    fn driver_can_refuse_status() {
        struct RefuseConnect;
        impl CircuitDriver for RefuseConnect {
            fn on_status_change(&self, _code: u32, new_status: CircuitStatus, _sync: bool) -> bool {
                new_status != CircuitStatus::Connected
            }
        }
        let group = group();
        let cic = Circuit::with_driver(
            CircuitType::Tdm,
            0,
            CircuitStatus::Idle,
            Arc::new(RefuseConnect),
            &group,
            None,
        );
        assert!(cic.reserve());
        assert!(!cic.connect());
        assert_eq!(cic.status(), CircuitStatus::Reserved);
    }

    #[test]
    fn default_driver_refuses_outbound_events() {
        let group = group();
        let cic = Circuit::new(CircuitType::Tdm, 0, &group, None);
        assert!(!cic.send_event(CircuitEventKind::Dtmf, &HashMap::new()));
    }
}
