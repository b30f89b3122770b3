//! Analog line groups.
//!
//! An [`AnalogLineGroup`] is a circuit group that additionally owns the
//! [`AnalogLine`]s built over its circuits. It comes in two shapes:
//!
//! - **owning**: holds FXO or FXS lines directly,
//! - **monitor**: an FXS-typed group observing an FXO/FXS pair; it keeps a
//!   reference to the parallel FXO group and polls its lines with
//!   [`get_monitor_event`](AnalogLine::get_monitor_event) so events from
//!   either side of each pair are seen.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

use rsig_circuit_core::{strategy_word, AllocationStrategy, CircuitGroup};

use crate::line::{AnalogLine, AnalogLineEvent, LineKind};

/// A circuit group owning analog lines.
pub struct AnalogLineGroup {
    kind: LineKind,
    slave: bool,
    circuits: Arc<CircuitGroup>,
    fxo: Option<Arc<AnalogLineGroup>>,
    lines: Mutex<Vec<Arc<AnalogLine>>>,
}

impl AnalogLineGroup {
    /// Build a group owning FXO or FXS lines.
    ///
    /// `slave` marks an FXO group whose lines follow a master group; it is
    /// ignored for FXS groups.
    pub fn new(kind: LineKind, name: &str, slave: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            slave: kind == LineKind::Fxo && slave,
            circuits: CircuitGroup::new(name, 0, strategy_word(AllocationStrategy::Increment, 0)),
            fxo: None,
            lines: Mutex::new(Vec::new()),
        })
    }

    /// Build an FXS monitor group observing `fxo`.
    pub fn new_monitor(name: &str, fxo: Option<Arc<AnalogLineGroup>>) -> Arc<Self> {
        if fxo.is_none() {
            warn!(group = name, "request to create monitor without fxo group");
        }
        Arc::new(Self {
            kind: LineKind::Fxs,
            slave: false,
            circuits: CircuitGroup::new(name, 0, strategy_word(AllocationStrategy::Increment, 0)),
            fxo,
            lines: Mutex::new(Vec::new()),
        })
    }

    pub fn kind(&self) -> LineKind {
        self.kind
    }

    pub fn slave(&self) -> bool {
        self.slave
    }

    /// The paired FXO group of a monitor.
    pub fn fxo(&self) -> Option<&Arc<AnalogLineGroup>> {
        self.fxo.as_ref()
    }

    /// The underlying circuit group.
    pub fn circuits(&self) -> &Arc<CircuitGroup> {
        &self.circuits
    }

    /// Number of lines currently owned.
    pub fn line_count(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    /// Take ownership of a line.
    ///
    /// The line must carry this group's type and must have been built from
    /// this group; otherwise it is refused and the caller's handle stays the
    /// only owner.
    pub fn append_line(&self, line: &Arc<AnalogLine>) -> bool {
        let belongs = line
            .group()
            .map(|group| std::ptr::eq(Arc::as_ptr(&group), self))
            .unwrap_or(false);
        if line.kind() != self.kind || !belongs {
            debug!(group = self.name(), addr = %line.address(), "refusing foreign line");
            return false;
        }
        let mut lines = self.lines.lock().unwrap();
        if !lines.iter().any(|known| Arc::ptr_eq(known, line)) {
            debug!(group = self.name(), addr = %line.address(), "added line");
            lines.push(Arc::clone(line));
        }
        true
    }

    /// Remove the line backed by circuit `cic`, returning it.
    ///
    /// Dropping the returned handle tears the line down unless somebody else
    /// still holds it.
    pub fn remove_line(&self, cic: u32) -> Option<Arc<AnalogLine>> {
        let mut lines = self.lines.lock().unwrap();
        let pos = lines
            .iter()
            .position(|line| line.circuit().code() == cic)?;
        let line = lines.remove(pos);
        debug!(group = self.name(), addr = %line.address(), "removed line");
        Some(line)
    }

    /// Remove a specific line without tearing it down.
    pub fn remove_line_ref(&self, line: &Arc<AnalogLine>) {
        let mut lines = self.lines.lock().unwrap();
        if let Some(pos) = lines.iter().position(|known| Arc::ptr_eq(known, line)) {
            lines.remove(pos);
            debug!(group = self.name(), addr = %line.address(), "removed line");
        }
    }

    /// Find a line by the code of its circuit.
    pub fn find_line(&self, cic: u32) -> Option<Arc<AnalogLine>> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .find(|line| line.circuit().code() == cic)
            .cloned()
    }

    /// Find a line by its address.
    pub fn find_line_by_address(&self, address: &str) -> Option<Arc<AnalogLine>> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .find(|line| line.address() == address)
            .cloned()
    }

    /// Pull one event from the owned lines.
    ///
    /// The line list is snapshotted, then each line is polled with the group
    /// lock released. Monitor groups poll with
    /// [`get_monitor_event`](AnalogLine::get_monitor_event) so both sides of
    /// each pair are observed.
    pub fn get_event(&self, now: Instant) -> Option<AnalogLineEvent> {
        let snapshot: Vec<Arc<AnalogLine>> = self.lines.lock().unwrap().clone();
        let monitor = self.fxo.is_some();
        for line in snapshot {
            let event = if monitor {
                line.get_monitor_event(now)
            } else {
                line.get_event(now)
            };
            if event.is_some() {
                return event;
            }
        }
        None
    }
}

impl Deref for AnalogLineGroup {
    type Target = CircuitGroup;

    fn deref(&self) -> &CircuitGroup {
        &self.circuits
    }
}

impl Drop for AnalogLineGroup {
    fn drop(&mut self) {
        let lines = self.lines.get_mut().unwrap();
        for line in lines.iter() {
            line.detach_group();
        }
        lines.clear();
    }
}

impl fmt::Debug for AnalogLineGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalogLineGroup")
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("lines", &self.line_count())
            .finish()
    }
}
