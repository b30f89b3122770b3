//! Analog lines.
//!
//! An [`AnalogLine`] pairs a circuit with line-side (FXO/FXS) semantics: a
//! forward-only finite state machine, optional peer linkage for monitored
//! pairs, echo canceller control and per-line timers.
//!
//! ## Line lifecycle
//!
//! ```text
//! OutOfService <--enable--> Idle -> Dialing -> DialComplete -> Ringing
//!                             ^                                   |
//!                             |        (reset to Idle only)       v
//!                             +---- CallEnded <- Answered <-------+
//! ```
//!
//! `change_state` only moves forward in the declared order (or resets to
//! `Idle`); entering or leaving `OutOfService` goes through
//! [`enable`](AnalogLine::enable) exclusively.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rsig_circuit_core::{Circuit, CircuitEvent, CircuitEventKind, CircuitStatus};

use crate::config::{timer_duration, AnalogLineConfig, CallSetup};
use crate::errors::{LineError, LineResult};
use crate::group::AnalogLineGroup;

/// Interface type of an analog line or line group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineKind {
    Unknown,
    /// Foreign exchange office: the line behaves like a phone.
    Fxo,
    /// Foreign exchange subscriber: the line feeds a phone.
    Fxs,
    /// Passive observer of an FXO/FXS pair.
    Monitor,
}

impl fmt::Display for LineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LineKind::Unknown => "Unknown",
            LineKind::Fxo => "FXO",
            LineKind::Fxs => "FXS",
            LineKind::Monitor => "monitor",
        };
        f.write_str(name)
    }
}

/// State of an analog line.
///
/// The declared order is the forward order of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LineState {
    OutOfService,
    Idle,
    Dialing,
    DialComplete,
    Ringing,
    Answered,
    CallEnded,
    OutOfOrder,
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-line timer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Waiting for call setup information to be delivered.
    CallSetup,
    /// Waiting for the first (or next) ring.
    NoRing,
    /// Waiting for an alarm condition to clear.
    Alarm,
    /// Delay before dialing on a freshly seized line.
    DelayDial,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerKind::CallSetup => "callsetup",
            TimerKind::NoRing => "ring",
            TimerKind::Alarm => "alarm",
            TimerKind::DelayDial => "delaydial",
        };
        f.write_str(name)
    }
}

/// A circuit event observed on a line.
pub struct AnalogLineEvent {
    line: Arc<AnalogLine>,
    event: CircuitEvent,
}

impl AnalogLineEvent {
    fn new(line: Arc<AnalogLine>, event: CircuitEvent) -> Self {
        Self { line, event }
    }

    pub fn line(&self) -> &Arc<AnalogLine> {
        &self.line
    }

    pub fn event(&self) -> &CircuitEvent {
        &self.event
    }

    /// Give up the wrapped circuit event.
    pub fn into_event(self) -> CircuitEvent {
        self.event
    }
}

impl fmt::Debug for AnalogLineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalogLineEvent")
            .field("line", &self.line.address())
            .field("event", &self.event)
            .finish()
    }
}

struct LineInner {
    state: LineState,
    peer: Weak<AnalogLine>,
    /// Alternation latch for monitor polling.
    get_peer_event: bool,
    timer: Option<(TimerKind, Instant)>,
}

/// An analog line over an exclusively owned circuit.
pub struct AnalogLine {
    kind: LineKind,
    address: String,
    circuit: Arc<Circuit>,
    group: Mutex<Weak<AnalogLineGroup>>,
    inner: Mutex<LineInner>,

    inband_dtmf: bool,
    echo_cancel: Option<bool>,
    accept_pulse: AtomicBool,
    answer_on_polarity: bool,
    hangup_on_polarity: bool,
    polarity_control: bool,
    call_setup: CallSetup,
    callsetup_timeout: Duration,
    no_ring_timeout: Duration,
    alarm_timeout: Duration,
    delay_dial: Duration,
}

impl AnalogLine {
    /// Build a line over circuit `code` of `group`.
    ///
    /// The group must be present, the circuit must exist in it and must not
    /// already back another line. Unless configured `out-of-service`, the
    /// circuit is reserved for the line and, when `connect` is set,
    /// connected immediately.
    pub fn new(
        group: Option<&Arc<AnalogLineGroup>>,
        code: u32,
        config: &AnalogLineConfig,
    ) -> LineResult<Arc<Self>> {
        let line = Self::acquire(group, code, config).map_err(|err| {
            warn!(cic = code, %err, "can't create analog line");
            err
        })?;
        if config.out_of_service {
            line.enable(false, false, false);
        } else {
            line.reset_circuit();
            if config.connect {
                line.connect(false);
            }
        }
        Ok(line)
    }

    fn acquire(
        group: Option<&Arc<AnalogLineGroup>>,
        code: u32,
        config: &AnalogLineConfig,
    ) -> LineResult<Arc<Self>> {
        let group = group.ok_or(LineError::MissingGroup)?;
        if group.find_line(code).is_some() {
            return Err(LineError::CircuitAllocated { code });
        }
        let circuit = group
            .circuits()
            .find(code)
            .ok_or(LineError::MissingCircuit { code })?;
        let address = format!("{}/{}", group.name(), circuit.code());
        debug!(addr = %address, kind = %group.kind(), "analog line created");
        Ok(Arc::new(Self {
            kind: group.kind(),
            address,
            circuit,
            group: Mutex::new(Arc::downgrade(group)),
            inner: Mutex::new(LineInner {
                state: LineState::Idle,
                peer: Weak::new(),
                get_peer_event: false,
                timer: None,
            }),
            inband_dtmf: config.inband_dtmf,
            echo_cancel: config.echo_cancel,
            accept_pulse: AtomicBool::new(true),
            answer_on_polarity: config.answer_on_polarity,
            hangup_on_polarity: config.hangup_on_polarity,
            polarity_control: config.polarity_control,
            call_setup: config.call_setup,
            callsetup_timeout: timer_duration(config.callsetup_timeout, 2000),
            no_ring_timeout: timer_duration(config.ring_timeout, 10000),
            alarm_timeout: timer_duration(config.alarm_timeout, 30000),
            delay_dial: timer_duration(config.delay_dial, 2000),
        }))
    }

    pub fn kind(&self) -> LineKind {
        self.kind
    }

    /// `<group name>/<circuit code>`.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    pub fn group(&self) -> Option<Arc<AnalogLineGroup>> {
        self.group.lock().unwrap().upgrade()
    }

    pub(crate) fn detach_group(&self) {
        *self.group.lock().unwrap() = Weak::new();
    }

    pub fn state(&self) -> LineState {
        self.inner.lock().unwrap().state
    }

    pub fn peer(&self) -> Option<Arc<AnalogLine>> {
        self.inner.lock().unwrap().peer.upgrade()
    }

    pub fn inband_dtmf(&self) -> bool {
        self.inband_dtmf
    }

    pub fn echo_cancel(&self) -> Option<bool> {
        self.echo_cancel
    }

    pub fn accept_pulse(&self) -> bool {
        self.accept_pulse.load(Ordering::Relaxed)
    }

    pub fn set_accept_pulse(&self, accept: bool) {
        self.accept_pulse.store(accept, Ordering::Relaxed);
    }

    pub fn answer_on_polarity(&self) -> bool {
        self.answer_on_polarity
    }

    pub fn hangup_on_polarity(&self) -> bool {
        self.hangup_on_polarity
    }

    pub fn polarity_control(&self) -> bool {
        self.polarity_control
    }

    pub fn call_setup(&self) -> CallSetup {
        self.call_setup
    }

    pub fn callsetup_timeout(&self) -> Duration {
        self.callsetup_timeout
    }

    pub fn no_ring_timeout(&self) -> Duration {
        self.no_ring_timeout
    }

    pub fn alarm_timeout(&self) -> Duration {
        self.alarm_timeout
    }

    pub fn delay_dial(&self) -> Duration {
        self.delay_dial
    }

    /// Pair this line with another one.
    ///
    /// The link is kept symmetric: with `sync` set, the old peer is unlinked
    /// and the new peer is pointed back at this line. Pairing a line with
    /// itself is refused.
    pub fn set_peer(self: &Arc<Self>, peer: Option<&Arc<AnalogLine>>, sync: bool) {
        if let Some(peer) = peer {
            if Arc::ptr_eq(self, peer) {
                warn!(addr = %self.address, "attempt to set peer to itself");
                return;
            }
        }
        let old = {
            let mut inner = self.inner.lock().unwrap();
            let current = inner.peer.upgrade();
            let same = match (&current, peer) {
                (Some(current), Some(peer)) => Arc::ptr_eq(current, peer),
                (None, None) => true,
                _ => false,
            };
            if same {
                drop(inner);
                if sync {
                    if let Some(peer) = peer {
                        peer.set_peer(Some(self), false);
                    }
                }
                return;
            }
            inner.peer = match peer {
                Some(peer) => Arc::downgrade(peer),
                None => Weak::new(),
            };
            current
        };
        if let Some(old) = &old {
            debug!(addr = %self.address, old = %old.address, "removed peer");
            if sync {
                old.set_peer(None, false);
            }
        }
        if let Some(peer) = peer {
            debug!(addr = %self.address, peer = %peer.address, "peer set");
            if sync {
                peer.set_peer(Some(self), false);
            }
        }
    }

    /// Drop the peer link if it points at `ptr`. Used during teardown, when
    /// no `Arc` to this side is available anymore.
    fn clear_peer_matching(&self, ptr: *const AnalogLine) {
        let mut inner = self.inner.lock().unwrap();
        if inner.peer.as_ptr() == ptr {
            inner.peer = Weak::new();
        }
    }

    /// Change the line state.
    ///
    /// Rules: a same-state change is a no-op; transitions touching
    /// `OutOfService` are refused (use [`enable`](AnalogLine::enable));
    /// otherwise only `Idle` (reset) or a forward move in declared order is
    /// accepted. With `sync` set the transition cascades to the peer.
    pub fn change_state(&self, new_state: LineState, sync: bool) -> bool {
        let peer = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == new_state {
                return true;
            }
            if inner.state == LineState::OutOfService || new_state == LineState::OutOfService {
                return false;
            }
            if new_state != LineState::Idle && new_state < inner.state {
                return false;
            }
            debug!(addr = %self.address, from = %inner.state, to = %new_state, "line state changed");
            inner.state = new_state;
            if sync {
                inner.peer.upgrade()
            } else {
                None
            }
        };
        if let Some(peer) = peer {
            peer.change_state(new_state, false);
        }
        true
    }

    /// Put the line in or out of service.
    ///
    /// `ok = true` leaves `OutOfService` for `Idle`, reserving the circuit
    /// and optionally connecting it right away. `ok = false` forces
    /// `OutOfService`, disconnecting the circuit and disabling it. The peer
    /// is mirrored when `sync` is set.
    pub fn enable(&self, ok: bool, sync: bool, connect_now: bool) -> bool {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            if ok && inner.state == LineState::OutOfService {
                inner.state = LineState::Idle;
                true
            } else if !ok && inner.state != LineState::OutOfService {
                inner.state = LineState::OutOfService;
                true
            } else {
                false
            }
        };
        if changed {
            if ok {
                info!(addr = %self.address, "back in service");
                self.circuit.set_status(CircuitStatus::Reserved, false);
                if connect_now {
                    self.connect(false);
                }
            } else {
                warn!(addr = %self.address, "out of service");
                self.disconnect(false);
                self.circuit.set_status(CircuitStatus::Disabled, false);
            }
        }
        if sync {
            if let Some(peer) = self.peer() {
                peer.enable(ok, false, connect_now);
            }
        }
        true
    }

    /// Connect the line's circuit and retrain the echo canceller.
    pub fn connect(&self, sync: bool) -> bool {
        let ok = self.circuit.connect();
        self.reset_echo(true);
        if sync && ok {
            if let Some(peer) = self.peer() {
                peer.connect(false);
            }
        }
        ok
    }

    /// Disconnect the line's circuit and reset the echo canceller.
    pub fn disconnect(&self, sync: bool) -> bool {
        let ok = self.circuit.disconnect();
        self.reset_echo(false);
        if sync && ok {
            if let Some(peer) = self.peer() {
                peer.disconnect(false);
            }
        }
        ok
    }

    /// Drive the circuit's echo canceller to the line's configured state.
    fn reset_echo(&self, train: bool) {
        let Some(enable) = self.echo_cancel else {
            return;
        };
        self.circuit
            .set_param("echocancel", if enable { "true" } else { "false" });
        if enable && train {
            self.circuit.set_param("echotrain", "");
        }
    }

    /// Reserve the owned circuit and drop any stale events.
    pub fn reset_circuit(&self) -> bool {
        self.circuit.clear_events();
        self.circuit.set_status(CircuitStatus::Reserved, false)
    }

    /// Send an event toward the line's circuit.
    ///
    /// Refused while out of service, and for tone events when DTMF is
    /// carried inband.
    pub fn send_event(&self, kind: CircuitEventKind, params: &HashMap<String, String>) -> bool {
        if self.state() == LineState::OutOfService {
            return false;
        }
        if self.inband_dtmf
            && matches!(kind, CircuitEventKind::Dtmf | CircuitEventKind::PulseDigit)
        {
            return false;
        }
        self.circuit.send_event(kind, params)
    }

    /// Pull one event from the line's circuit.
    ///
    /// Out of service the line only ticks its timers. Pulse events are
    /// silently dropped when pulse dialing is not accepted.
    pub fn get_event(self: &Arc<Self>, now: Instant) -> Option<AnalogLineEvent> {
        if self.state() == LineState::OutOfService {
            self.check_timeouts(now);
            return None;
        }
        let Some(event) = self.circuit.get_event(now) else {
            self.check_timeouts(now);
            return None;
        };
        if matches!(
            event.kind(),
            CircuitEventKind::PulseDigit | CircuitEventKind::PulseStart
        ) && !self.accept_pulse()
        {
            debug!(addr = %self.address, event = %event.name(), "ignoring pulse event");
            return None;
        }
        Some(AnalogLineEvent::new(Arc::clone(self), event))
    }

    /// Pull one event from this line or its peer, alternating fairly.
    pub fn get_monitor_event(self: &Arc<Self>, now: Instant) -> Option<AnalogLineEvent> {
        let own_first = {
            let mut inner = self.inner.lock().unwrap();
            inner.get_peer_event = !inner.get_peer_event;
            inner.get_peer_event
        };
        let peer = self.peer();
        if own_first {
            self.get_event(now)
                .or_else(|| peer.and_then(|peer| peer.get_event(now)))
        } else {
            peer.and_then(|peer| peer.get_event(now))
                .or_else(|| self.get_event(now))
        }
    }

    /// Arm the line timer of the given kind, replacing any armed timer.
    pub fn set_timer(&self, kind: TimerKind, now: Instant) {
        let duration = match kind {
            TimerKind::CallSetup => self.callsetup_timeout,
            TimerKind::NoRing => self.no_ring_timeout,
            TimerKind::Alarm => self.alarm_timeout,
            TimerKind::DelayDial => self.delay_dial,
        };
        self.inner.lock().unwrap().timer = Some((kind, now + duration));
    }

    pub fn clear_timer(&self) {
        self.inner.lock().unwrap().timer = None;
    }

    /// Fire the armed timer if it expired, surfacing a `Timeout` circuit
    /// event named after the timer.
    pub fn check_timeouts(self: &Arc<Self>, now: Instant) {
        let fired = {
            let mut inner = self.inner.lock().unwrap();
            match inner.timer {
                Some((kind, deadline)) if deadline <= now => {
                    inner.timer = None;
                    Some(kind)
                }
                _ => None,
            }
        };
        if let Some(kind) = fired {
            debug!(addr = %self.address, timer = %kind, "line timer expired");
            let mut params = HashMap::new();
            params.insert("timer".to_string(), kind.to_string());
            self.circuit.enqueue_event(CircuitEventKind::Timeout, params);
        }
    }
}

impl Drop for AnalogLine {
    fn drop(&mut self) {
        self.disconnect(false);
        self.circuit.set_status(CircuitStatus::Idle, false);
        let peer = self.inner.get_mut().unwrap().peer.upgrade();
        if let Some(peer) = peer {
            peer.clear_peer_matching(self as *const AnalogLine);
        }
    }
}

impl fmt::Debug for AnalogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalogLine")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_order_is_forward() {
        assert!(LineState::OutOfService < LineState::Idle);
        assert!(LineState::Idle < LineState::Dialing);
        assert!(LineState::Dialing < LineState::DialComplete);
        assert!(LineState::DialComplete < LineState::Ringing);
        assert!(LineState::Ringing < LineState::Answered);
        assert!(LineState::Answered < LineState::CallEnded);
        assert!(LineState::CallEnded < LineState::OutOfOrder);
    }

    #[test]
    fn timer_names() {
        assert_eq!(TimerKind::CallSetup.to_string(), "callsetup");
        assert_eq!(TimerKind::NoRing.to_string(), "ring");
        assert_eq!(TimerKind::DelayDial.to_string(), "delaydial");
    }
}
