//! Circuit groups and the reservation allocator.
//!
//! A [`CircuitGroup`] owns a set of [`Circuit`]s (unique by local code) and
//! the [`CircuitSpan`]s they belong to, and arbitrates reservation of idle
//! circuits for outgoing calls.
//!
//! The allocation policy is a packed strategy word: the low 12 bits select
//! the scan order ([`AllocationStrategy`]), the high bits carry restriction
//! flags ([`ONLY_ODD`], [`ONLY_EVEN`]) and the parity [`FALLBACK`] flag.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::circuit::{Circuit, CircuitSpan, CircuitStatus};

/// Mask of the selector part of a strategy word.
pub const SELECTOR_MASK: u32 = 0x0fff;
/// Restrict the scan to odd local codes.
pub const ONLY_ODD: u32 = 0x1000;
/// Restrict the scan to even local codes.
pub const ONLY_EVEN: u32 = 0x2000;
/// Retry with the opposite parity when a restricted scan finds nothing.
pub const FALLBACK: u32 = 0x4000;

/// Scan-order selector of the reservation allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum AllocationStrategy {
    /// Round-robin upward from the last reserved code.
    #[default]
    Increment = 1,
    /// Round-robin downward from the last reserved code.
    Decrement = 2,
    /// Always scan upward from the lowest code.
    Lowest = 3,
    /// Always scan downward from the highest code.
    Highest = 4,
    /// Start from a random code.
    Random = 5,
}

impl AllocationStrategy {
    /// Extract the selector from a packed strategy word.
    ///
    /// Unknown selector values scan like `Random` does.
    pub fn from_word(word: u32) -> Self {
        match word & SELECTOR_MASK {
            1 => AllocationStrategy::Increment,
            2 => AllocationStrategy::Decrement,
            3 => AllocationStrategy::Lowest,
            4 => AllocationStrategy::Highest,
            _ => AllocationStrategy::Random,
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocationStrategy::Increment => "increment",
            AllocationStrategy::Decrement => "decrement",
            AllocationStrategy::Lowest => "lowest",
            AllocationStrategy::Highest => "highest",
            AllocationStrategy::Random => "random",
        };
        f.write_str(name)
    }
}

/// Pack a selector and restriction flags into a strategy word.
pub fn strategy_word(strategy: AllocationStrategy, flags: u32) -> u32 {
    (strategy as u32) | (flags & !SELECTOR_MASK)
}

/// Swap the `ONLY_EVEN`/`ONLY_ODD` restriction of a strategy word, keeping
/// the selector and the fallback flag.
pub fn flip_parity(word: u32) -> u32 {
    if word & ONLY_EVEN != 0 {
        (word & !ONLY_EVEN) | ONLY_ODD
    } else if word & ONLY_ODD != 0 {
        (word & !ONLY_ODD) | ONLY_EVEN
    } else {
        word
    }
}

/// Move `n` onto the parity requested by the strategy word.
fn adjust_parity(n: &mut u32, word: u32) {
    if word & ONLY_EVEN != 0 && *n & 1 != 0 {
        *n &= !1;
    } else if word & ONLY_ODD != 0 && *n & 1 == 0 {
        *n |= 1;
    }
}

struct GroupState {
    /// One past the highest local code currently present.
    last: u32,
    strategy: u32,
    /// Local code most recently returned by the allocator.
    used: u32,
    circuits: BTreeMap<u32, Arc<Circuit>>,
    spans: Vec<Arc<CircuitSpan>>,
}

impl GroupState {
    fn rescan_last(&mut self) {
        self.last = self
            .circuits
            .keys()
            .next_back()
            .map(|code| code + 1)
            .unwrap_or(0);
    }
}

/// Container owning circuits and spans for one trunk/controller.
pub struct CircuitGroup {
    name: String,
    /// Global offset: global code = `base` + local code.
    base: u32,
    state: Mutex<GroupState>,
}

impl CircuitGroup {
    pub fn new(name: &str, base: u32, strategy: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            base,
            state: Mutex::new(GroupState {
                last: 0,
                strategy,
                used: 0,
                circuits: BTreeMap::new(),
                spans: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn strategy(&self) -> u32 {
        self.state.lock().unwrap().strategy
    }

    pub fn set_strategy(&self, word: u32) {
        self.state.lock().unwrap().strategy = word;
    }

    /// Number of circuits currently owned.
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().circuits.len()
    }

    /// One past the highest local code currently present.
    pub fn last(&self) -> u32 {
        self.state.lock().unwrap().last
    }

    /// Insert a circuit. Fails when its local code is already taken.
    pub fn insert(&self, circuit: Arc<Circuit>) -> bool {
        let mut state = self.state.lock().unwrap();
        let code = circuit.code();
        if state.circuits.contains_key(&code) {
            return false;
        }
        if state.last <= code {
            state.last = code + 1;
        }
        state.circuits.insert(code, circuit);
        true
    }

    /// Remove a circuit and restore the `last` bound.
    pub fn remove(&self, circuit: &Arc<Circuit>) -> bool {
        let mut state = self.state.lock().unwrap();
        let code = circuit.code();
        let owned = state
            .circuits
            .get(&code)
            .map(|owned| Arc::ptr_eq(owned, circuit))
            .unwrap_or(false);
        if !owned {
            return false;
        }
        state.circuits.remove(&code);
        state.rescan_last();
        true
    }

    /// Find a circuit by global code.
    pub fn find(&self, code: u32) -> Option<Arc<Circuit>> {
        if code < self.base {
            return None;
        }
        self.find_local(code - self.base)
    }

    /// Find a circuit by local code.
    pub fn find_local(&self, code: u32) -> Option<Arc<Circuit>> {
        let state = self.state.lock().unwrap();
        if code >= state.last {
            return None;
        }
        state.circuits.get(&code).cloned()
    }

    /// Status of the circuit with the given global code; `Missing` when the
    /// circuit is not in the group.
    pub fn status(&self, code: u32) -> CircuitStatus {
        self.find(code)
            .map(|cic| cic.status())
            .unwrap_or(CircuitStatus::Missing)
    }

    /// Change the status of the circuit with the given global code.
    pub fn set_status(&self, code: u32, new_status: CircuitStatus, sync: bool) -> bool {
        match self.find(code) {
            Some(cic) => cic.set_status(new_status, sync),
            None => false,
        }
    }

    /// Comma-separated local codes, in code order.
    pub fn get_cic_list(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        for code in state.circuits.keys() {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(&code.to_string());
        }
        out
    }

    /// Register a span with the group.
    pub fn insert_span(&self, span: &Arc<CircuitSpan>) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.spans.iter().any(|s| Arc::ptr_eq(s, span)) {
            state.spans.push(Arc::clone(span));
        }
        true
    }

    /// Remove a span, optionally cascading to the circuits it owns.
    pub fn remove_span(&self, span: &Arc<CircuitSpan>, del_cics: bool, del_span: bool) {
        let dropped = {
            let mut state = self.state.lock().unwrap();
            if del_cics {
                remove_span_circuits_locked(&mut state, span);
            }
            if del_span {
                let mut dropped = None;
                state.spans.retain(|s| {
                    if Arc::ptr_eq(s, span) {
                        s.mark_detached();
                        dropped = Some(Arc::clone(s));
                        false
                    } else {
                        true
                    }
                });
                dropped
            } else {
                None
            }
        };
        // Dropped outside the lock: the span may be torn down right here.
        drop(dropped);
    }

    pub(crate) fn remove_span_by_id(&self, id: &str, del_cics: bool, del_span: bool) {
        let span = {
            let state = self.state.lock().unwrap();
            state.spans.iter().find(|s| s.id() == id).cloned()
        };
        if let Some(span) = span {
            self.remove_span(&span, del_cics, del_span);
        }
    }

    /// Remove all circuits belonging to a span.
    pub fn remove_span_circuits(&self, span: &Arc<CircuitSpan>) {
        let mut state = self.state.lock().unwrap();
        remove_span_circuits_locked(&mut state, span);
    }

    /// Set a reserved or connected circuit back to `Idle`.
    pub fn release(&self, circuit: &Arc<Circuit>) -> bool {
        circuit.set_status(CircuitStatus::Idle, true)
    }

    /// Reserve a circuit.
    ///
    /// `check_lock` is the administrative lock mask that disqualifies a
    /// circuit; `strategy` overrides the group strategy for this call only.
    ///
    /// Returns `None` when no circuit is available; callers treat that as a
    /// congestion signal.
    pub fn reserve(&self, check_lock: u32, strategy: Option<u32>) -> Option<Arc<Circuit>> {
        let word = {
            let mut state = self.state.lock().unwrap();
            if state.last < 1 {
                return None;
            }
            let word = strategy.unwrap_or(state.strategy);
            let last = state.last;
            let mut n = match AllocationStrategy::from_word(word) {
                AllocationStrategy::Increment => (state.used + 1) % last,
                AllocationStrategy::Decrement => {
                    (if state.used == 0 { last } else { state.used }) - 1
                }
                AllocationStrategy::Lowest => 0,
                AllocationStrategy::Highest => last - 1,
                AllocationStrategy::Random => {
                    if last > 1 {
                        // Bounded draw over [0, last) excluding the cursor.
                        let mut n = rand::thread_rng().gen_range(0..last - 1);
                        if n >= state.used {
                            n += 1;
                        }
                        n
                    } else {
                        0
                    }
                }
            };
            adjust_parity(&mut n, word);
            let start = n;
            let mut budget = if word & (ONLY_ODD | ONLY_EVEN) != 0 {
                (last + 1) / 2
            } else {
                last
            };
            while budget > 0 {
                budget -= 1;
                if let Some(circuit) = state.circuits.get(&n) {
                    if !circuit.locked(check_lock) && circuit.reserve() {
                        let circuit = Arc::clone(circuit);
                        state.used = n;
                        return Some(circuit);
                    }
                }
                n = advance(n, word, last);
                // Wrapped around: don't scan the same codes again.
                if n == start {
                    break;
                }
            }
            word
        };
        if word & FALLBACK != 0 {
            if word & ONLY_EVEN != 0 {
                warn!(group = %self.name, "no even circuits available, falling back to odd");
                return self.reserve(check_lock, Some((word & SELECTOR_MASK) | ONLY_ODD));
            }
            if word & ONLY_ODD != 0 {
                warn!(group = %self.name, "no odd circuits available, falling back to even");
                return self.reserve(check_lock, Some((word & SELECTOR_MASK) | ONLY_EVEN));
            }
        }
        None
    }

    /// Reserve a circuit from a comma-separated list of global codes.
    ///
    /// Unparseable entries are skipped. When no listed circuit is free and
    /// the list is not `mandatory`, falls through to a plain [`reserve`]
    /// with the given lock mask and strategy.
    ///
    /// [`reserve`]: CircuitGroup::reserve
    pub fn reserve_from_list(
        &self,
        list: &str,
        mandatory: bool,
        check_lock: u32,
        strategy: Option<u32>,
    ) -> Option<Arc<Circuit>> {
        {
            let mut state = self.state.lock().unwrap();
            for token in list.split(',') {
                let Ok(code) = token.trim().parse::<u32>() else {
                    continue;
                };
                if code < self.base {
                    continue;
                }
                let local = code - self.base;
                if local >= state.last {
                    continue;
                }
                if let Some(circuit) = state.circuits.get(&local) {
                    if !circuit.locked(check_lock) && circuit.reserve() {
                        let circuit = Arc::clone(circuit);
                        state.used = self.base + circuit.code();
                        debug!(group = %self.name, cic = circuit.code(), "reserved listed circuit");
                        return Some(circuit);
                    }
                }
            }
        }
        if mandatory {
            return None;
        }
        self.reserve(check_lock, strategy)
    }
}

/// Choose the next candidate code for a scan.
fn advance(n: u32, word: u32, last: u32) -> u32 {
    // Step by 2 when only even or only odd circuits are wanted.
    let delta = if word & (ONLY_ODD | ONLY_EVEN) != 0 { 2 } else { 1 };
    match AllocationStrategy::from_word(word) {
        AllocationStrategy::Increment | AllocationStrategy::Lowest => {
            let n = n + delta;
            if n >= last {
                delta
            } else {
                n
            }
        }
        AllocationStrategy::Decrement | AllocationStrategy::Highest => {
            if n >= delta {
                n - delta
            } else {
                let mut n = last - 1;
                adjust_parity(&mut n, word);
                n
            }
        }
        AllocationStrategy::Random => (n + 1) % last,
    }
}

fn remove_span_circuits_locked(state: &mut GroupState, span: &Arc<CircuitSpan>) {
    let doomed: Vec<u32> = state
        .circuits
        .values()
        .filter(|cic| cic.span_is(span))
        .map(|cic| cic.code())
        .collect();
    for code in doomed {
        if let Some(cic) = state.circuits.remove(&code) {
            cic.set_status(CircuitStatus::Missing, true);
            cic.detach_group();
        }
    }
    state.rescan_last();
}

impl Drop for CircuitGroup {
    fn drop(&mut self) {
        // Notify circuits of the group teardown; external holders may keep
        // some of them alive past this point.
        let state = self.state.get_mut().unwrap();
        for circuit in state.circuits.values() {
            circuit.set_status(CircuitStatus::Missing, true);
            circuit.detach_group();
        }
        state.circuits.clear();
        for span in &state.spans {
            span.mark_detached();
        }
        state.spans.clear();
    }
}

impl fmt::Debug for CircuitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitGroup")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("count", &self.count())
            .finish()
    }
}
