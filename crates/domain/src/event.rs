//! The event taxonomy delivered through a caller-supplied sink (§4.C, §6).
//!
//! Emission is synchronous in the emitter's thread; a sink must be
//! non-blocking-safe (no further `.await` inside `on_event` beyond quick
//! buffering/forwarding). Events never carry mutable references escaping
//! the emitter's scope -- everything here is owned data.

use crate::agent_state::{AgentState, PendingToolCall};
use crate::error::Error;
use crate::message::Message;

/// `role` discriminator carried by message-lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    User,
    Assistant,
}

/// `kind` discriminator carried by `MessageUpdate` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Text,
    Reasoning,
    ToolArguments,
    Refusal,
}

#[derive(Debug, Clone)]
pub enum Event {
    AgentEvaluateStart { evaluation_id: String },
    AgentEvaluateEnd { evaluation_id: String, state: AgentState },

    TurnStart { turn_id: String },
    TurnEnd {
        turn_id: String,
        last_assistant_message: Option<Message>,
        error: Option<String>,
    },

    MessageStart { role: EventRole, message: Message },
    MessageUpdate {
        role: EventRole,
        message: Message,
        kind: UpdateKind,
        delta: String,
        item_id: Option<String>,
    },
    MessageEnd { role: EventRole, message: Message },

    ToolCallRequest { pending: PendingToolCall },
    ToolExecutionStart { pending: PendingToolCall },
    ToolExecutionEnd {
        pending: PendingToolCall,
        result: String,
        duration_ms: u64,
    },

    AgentError { error: String },
}

impl Event {
    /// The `AgentError` variant, built from any core `Error`.
    pub fn from_error(err: &Error) -> Self {
        Event::AgentError { error: err.to_string() }
    }
}

/// A caller-supplied sink for the event taxonomy. `on_event` must not block
/// indefinitely -- the middleware chain calls it synchronously at each
/// lifecycle point and relies on prompt return to keep ordering guarantees
/// (§5) intact.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: Event);
}

/// A sink that drops every event; useful as a default / in tests that only
/// care about the returned `AgentState`.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: Event) {}
}

/// Forwards every event into a `Vec`, for tests that assert on exact event
/// ordering (§8 concrete scenarios).
#[derive(Default)]
pub struct RecordingSink {
    pub events: parking_lot::Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: Event) {
        self.events.lock().push(event);
    }
}
