//! The call controller.
//!
//! A [`CallControl`] mediates between protocol call state machines and a
//! [`CircuitGroup`]: it arbitrates circuit reservation according to the
//! configured strategy, tracks the live calls, and pumps their events toward
//! the layer above. Shutdown is cooperative: once `set_exiting` has been
//! called and the call set drains, [`get_event`](CallControl::get_event)
//! emits a single terminal `Disable` event.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::debug;

use crate::call::Call;
use crate::circuit::{Circuit, CircuitStatus};
use crate::config::ControlConfig;
use crate::event::{SignallingEvent, SignallingKind};
use crate::group::{flip_parity, CircuitGroup};

/// Sink for events passing through a controller, typically a wire dumper.
pub trait Dumper: Send {
    fn dump(&mut self, event: &SignallingEvent);
}

struct ControlState {
    group: Option<Arc<CircuitGroup>>,
    calls: Vec<Weak<dyn Call>>,
    exiting: bool,
    disable_emitted: bool,
    dumper: Option<Box<dyn Dumper>>,
}

/// Root controller owning the active circuit group and the set of calls.
pub struct CallControl {
    strategy: u32,
    state: Mutex<ControlState>,
}

impl CallControl {
    pub fn new(config: &ControlConfig) -> Arc<Self> {
        Arc::new(Self {
            strategy: config.strategy_word(),
            state: Mutex::new(ControlState {
                group: None,
                calls: Vec::new(),
                exiting: false,
                disable_emitted: false,
                dumper: None,
            }),
        })
    }

    /// The packed strategy word applied to attached groups.
    pub fn strategy(&self) -> u32 {
        self.strategy
    }

    /// Attach a circuit group, or detach with `None`.
    ///
    /// Idempotent when the argument is the currently attached group. Any
    /// other change first tears down the calls that depended on the old
    /// group, then installs the new group and applies the controller's
    /// strategy to it.
    pub fn attach(&self, group: Option<Arc<CircuitGroup>>) {
        let mut state = self.state.lock().unwrap();
        let same = match (&state.group, &group) {
            (Some(current), Some(new)) => Arc::ptr_eq(current, new),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }
        let reason = if group.is_some() {
            "circuit group attach"
        } else {
            "circuit group detach"
        };
        self.cleanup_locked(&mut state, reason);
        if state.group.is_some() && group.is_some() {
            debug!("replacing attached circuit group");
        }
        state.group = group;
        if let Some(group) = &state.group {
            group.set_strategy(self.strategy);
        }
    }

    /// Currently attached circuit group.
    pub fn group(&self) -> Option<Arc<CircuitGroup>> {
        self.state.lock().unwrap().group.clone()
    }

    /// Number of circuits in the attached group.
    pub fn circuit_count(&self) -> usize {
        self.group().map(|g| g.count()).unwrap_or(0)
    }

    fn cleanup_locked(&self, state: &mut ControlState, reason: &str) {
        debug!(reason, calls = state.calls.len(), "controller cleanup");
        state.calls.clear();
    }

    /// Register a call with the controller.
    pub fn add_call(&self, call: &Arc<dyn Call>) {
        let handle = Arc::downgrade(call);
        let mut state = self.state.lock().unwrap();
        if !state.calls.iter().any(|known| known.ptr_eq(&handle)) {
            state.calls.push(handle);
        }
    }

    /// Remove a call from the controller's list.
    pub fn remove_call(&self, call: &Arc<dyn Call>) {
        let target = Arc::downgrade(call);
        let mut state = self.state.lock().unwrap();
        state.calls.retain(|known| !known.ptr_eq(&target));
    }

    /// Drop every registered call handle.
    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub(crate) fn prune_calls(&self) {
        let mut state = self.state.lock().unwrap();
        state.calls.retain(|call| call.strong_count() > 0);
    }

    /// Begin cooperative shutdown.
    pub fn set_exiting(&self) {
        self.state.lock().unwrap().exiting = true;
    }

    pub fn exiting(&self) -> bool {
        self.state.lock().unwrap().exiting
    }

    /// Reserve a circuit into the caller's slot.
    ///
    /// Any circuit already held in `slot` is released first. With a `list`
    /// of global codes the listed circuits are tried in order; when the list
    /// is not `mandatory` and `reverse_restrict` is set, the fallthrough
    /// search runs with the opposite parity restriction of the group's
    /// strategy.
    pub fn reserve_circuit(
        &self,
        slot: &mut Option<Arc<Circuit>>,
        check_lock: u32,
        list: Option<&str>,
        mandatory: bool,
        reverse_restrict: bool,
    ) -> bool {
        self.release_circuit(slot, false);
        let Some(group) = self.group() else {
            return false;
        };
        let reserved = match list {
            Some(list) => {
                let strategy = if !mandatory && reverse_restrict {
                    Some(flip_parity(group.strategy()))
                } else {
                    None
                };
                group.reserve_from_list(list, mandatory, check_lock, strategy)
            }
            None => group.reserve(check_lock, None),
        };
        *slot = reserved;
        slot.is_some()
    }

    /// Release the circuit held in the caller's slot, setting it `Idle`.
    pub fn release_circuit(&self, slot: &mut Option<Arc<Circuit>>, sync: bool) -> bool {
        let Some(circuit) = slot.take() else {
            return false;
        };
        circuit.set_status(CircuitStatus::Idle, sync)
    }

    /// Release a circuit of the attached group by global code.
    pub fn release_circuit_code(&self, code: u32, sync: bool) -> bool {
        let Some(group) = self.group() else {
            return false;
        };
        match group.find(code) {
            Some(circuit) => circuit.set_status(CircuitStatus::Idle, sync),
            None => false,
        }
    }

    /// Pump one event from the registered calls.
    ///
    /// The call list is snapshotted under the lock and iterated with the
    /// lock released, so calls may register, de-register or die while the
    /// scan runs. An event the controller does not consume itself is handed
    /// to the caller. Once exiting and out of calls, a terminal `Disable`
    /// event is emitted exactly once.
    pub fn get_event(self: &Arc<Self>, now: Instant) -> Option<SignallingEvent> {
        let snapshot: Vec<Arc<dyn Call>> = {
            let mut state = self.state.lock().unwrap();
            state.calls.retain(|call| call.strong_count() > 0);
            state.calls.iter().filter_map(Weak::upgrade).collect()
        };
        for call in snapshot {
            if let Some(event) = call.get_event(now) {
                if !self.process_event(&event) {
                    return Some(event);
                }
            }
        }
        let mut state = self.state.lock().unwrap();
        state.calls.retain(|call| call.strong_count() > 0);
        if state.exiting && state.calls.is_empty() && !state.disable_emitted {
            state.disable_emitted = true;
            drop(state);
            debug!("call set drained while exiting, emitting terminal event");
            return Some(SignallingEvent::from_controller(
                SignallingKind::Disable,
                None,
                self,
            ));
        }
        None
    }

    /// Offer an event to the controller itself.
    ///
    /// Feeds the dumper and declines, leaving the event to the caller.
    fn process_event(&self, event: &SignallingEvent) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(dumper) = state.dumper.as_mut() {
            dumper.dump(event);
        }
        false
    }

    /// Install an event dumping sink; the previous dumper is dropped.
    pub fn set_dumper(&self, dumper: Option<Box<dyn Dumper>>) {
        self.state.lock().unwrap().dumper = dumper;
    }
}
