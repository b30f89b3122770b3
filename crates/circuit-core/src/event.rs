//! Call-scoped signalling events.
//!
//! A [`SignallingEvent`] notifies the layer above the call controller of a
//! change in a call (or in the controller itself). Events keep their
//! originating call alive while in flight; dropping the event releases the
//! call's in-flight slot so the next event can be delivered.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::call::{Call, SignallingMessage};
use crate::circuit::next_event_id;
use crate::control::CallControl;

/// Type tag of a signalling event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignallingKind {
    Unknown,
    Generic,
    NewCall,
    Accept,
    Connect,
    Complete,
    Progress,
    Ringing,
    Answer,
    Transfer,
    Suspend,
    Resume,
    Release,
    Info,
    Message,
    Facility,
    Enable,
    Disable,
    Reset,
    Verify,
}

impl SignallingKind {
    /// Printable name of the tag.
    pub fn name(&self) -> &'static str {
        match self {
            SignallingKind::Unknown => "Unknown",
            SignallingKind::Generic => "Generic",
            SignallingKind::NewCall => "NewCall",
            SignallingKind::Accept => "Accept",
            SignallingKind::Connect => "Connect",
            SignallingKind::Complete => "Complete",
            SignallingKind::Progress => "Progress",
            SignallingKind::Ringing => "Ringing",
            SignallingKind::Answer => "Answer",
            SignallingKind::Transfer => "Transfer",
            SignallingKind::Suspend => "Suspend",
            SignallingKind::Resume => "Resume",
            SignallingKind::Release => "Release",
            SignallingKind::Info => "Info",
            SignallingKind::Message => "Message",
            SignallingKind::Facility => "Facility",
            SignallingKind::Enable => "Enable",
            SignallingKind::Disable => "Disable",
            SignallingKind::Reset => "Reset",
            SignallingKind::Verify => "Verify",
        }
    }
}

impl fmt::Display for SignallingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A signalling notification flowing from a call (or controller) upward.
pub struct SignallingEvent {
    id: u64,
    kind: SignallingKind,
    message: Option<Arc<SignallingMessage>>,
    call: Option<Arc<dyn Call>>,
    controller: Option<Weak<CallControl>>,
}

impl SignallingEvent {
    /// Build an event attributed to a call.
    ///
    /// The event takes the call's in-flight slot; the slot is released when
    /// the event is dropped.
    pub fn from_call(
        kind: SignallingKind,
        message: Option<Arc<SignallingMessage>>,
        call: &Arc<dyn Call>,
    ) -> Self {
        let id = next_event_id();
        call.data().set_last_event(id);
        Self {
            id,
            kind,
            message,
            controller: Some(call.data().controller_ref()),
            call: Some(Arc::clone(call)),
        }
    }

    /// Build an event attributed directly to a controller.
    pub fn from_controller(
        kind: SignallingKind,
        message: Option<Arc<SignallingMessage>>,
        controller: &Arc<CallControl>,
    ) -> Self {
        Self {
            id: next_event_id(),
            kind,
            message,
            call: None,
            controller: Some(Arc::downgrade(controller)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SignallingKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn message(&self) -> Option<&Arc<SignallingMessage>> {
        self.message.as_ref()
    }

    pub fn call(&self) -> Option<&Arc<dyn Call>> {
        self.call.as_ref()
    }

    pub fn controller(&self) -> Option<Arc<CallControl>> {
        self.controller.as_ref().and_then(Weak::upgrade)
    }
}

impl Drop for SignallingEvent {
    fn drop(&mut self) {
        if let Some(call) = &self.call {
            call.data().event_terminated(self.id);
        }
    }
}

impl fmt::Debug for SignallingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignallingEvent")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("has_call", &self.call.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_tags() {
        assert_eq!(SignallingKind::NewCall.name(), "NewCall");
        assert_eq!(SignallingKind::Disable.to_string(), "Disable");
    }
}
