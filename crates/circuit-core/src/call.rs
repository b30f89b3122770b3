//! Calls and call-scoped signalling messages.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::control::CallControl;
use crate::event::SignallingEvent;

/// A call-scoped protocol message.
#[derive(Debug, Clone)]
pub struct SignallingMessage {
    name: String,
    params: HashMap<String, String>,
}

impl SignallingMessage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: HashMap::new(),
        }
    }

    pub fn with_params(name: &str, params: HashMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// An in-flight call tracked by a [`CallControl`].
///
/// Protocol stacks implement this trait; [`CallData`] supplies the queue and
/// bookkeeping shared by every implementation. The controller pumps
/// [`get_event`](Call::get_event) on each registered call.
pub trait Call: Send + Sync {
    /// Shared call bookkeeping (queue, controller link, event slot).
    fn data(&self) -> &CallData;

    /// Produce the next event of this call, if any.
    fn get_event(&self, now: Instant) -> Option<SignallingEvent>;
}

struct CallQueues {
    in_msgs: VecDeque<Arc<SignallingMessage>>,
    last_event_id: Option<u64>,
}

/// State shared by every [`Call`] implementation.
pub struct CallData {
    controller: Weak<CallControl>,
    outgoing: bool,
    signal_only: bool,
    state: Mutex<CallQueues>,
}

impl CallData {
    pub fn new(controller: &Arc<CallControl>, outgoing: bool, signal_only: bool) -> Self {
        Self {
            controller: Arc::downgrade(controller),
            outgoing,
            signal_only,
            state: Mutex::new(CallQueues {
                in_msgs: VecDeque::new(),
                last_event_id: None,
            }),
        }
    }

    pub fn controller(&self) -> Option<Arc<CallControl>> {
        self.controller.upgrade()
    }

    pub(crate) fn controller_ref(&self) -> Weak<CallControl> {
        self.controller.clone()
    }

    pub fn outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn signal_only(&self) -> bool {
        self.signal_only
    }

    /// Append a received message to the inbound queue.
    pub fn enqueue(&self, msg: Arc<SignallingMessage>) {
        self.state.lock().unwrap().in_msgs.push_back(msg);
    }

    /// Peek (`remove = false`) or pop (`remove = true`) the queue head.
    pub fn dequeue(&self, remove: bool) -> Option<Arc<SignallingMessage>> {
        let mut state = self.state.lock().unwrap();
        if remove {
            state.in_msgs.pop_front()
        } else {
            state.in_msgs.front().cloned()
        }
    }

    /// True while an event of this call is owned by an external consumer.
    pub fn has_last_event(&self) -> bool {
        self.state.lock().unwrap().last_event_id.is_some()
    }

    pub(crate) fn set_last_event(&self, id: u64) {
        self.state.lock().unwrap().last_event_id = Some(id);
    }

    pub(crate) fn event_terminated(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.last_event_id == Some(id) {
            state.last_event_id = None;
        }
    }
}

impl Drop for CallData {
    fn drop(&mut self) {
        self.state.get_mut().unwrap().in_msgs.clear();
        // De-register: the controller keeps only weak handles, pruning the
        // dead entry is all that is left to do.
        if let Some(controller) = self.controller.upgrade() {
            controller.prune_calls();
        }
    }
}

impl fmt::Debug for CallData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CallData")
            .field("outgoing", &self.outgoing)
            .field("signal_only", &self.signal_only)
            .field("queued", &state.in_msgs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;

    fn call_data() -> CallData {
        let controller = CallControl::new(&ControlConfig::default());
        CallData::new(&controller, true, false)
    }

    #[test]
    fn messages_are_fifo() {
        let data = call_data();
        data.enqueue(Arc::new(SignallingMessage::new("setup")));
        data.enqueue(Arc::new(SignallingMessage::new("info")));

        // Peek does not consume.
        assert_eq!(data.dequeue(false).unwrap().name(), "setup");
        assert_eq!(data.dequeue(true).unwrap().name(), "setup");
        assert_eq!(data.dequeue(true).unwrap().name(), "info");
        assert!(data.dequeue(true).is_none());
    }

    #[test]
    fn message_params_round_trip() {
        let mut params = HashMap::new();
        params.insert("caller".to_string(), "1001".to_string());
        let msg = SignallingMessage::with_params("setup", params);
        assert_eq!(msg.param("caller"), Some("1001"));
        assert_eq!(msg.param("callee"), None);
    }
}
