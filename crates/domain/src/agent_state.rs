//! `AgentState` (§3): the mutable state threaded through one evaluation.

use serde::{Deserialize, Serialize};

use crate::message::{Message, ToolCall};
use crate::stream::{StopReason, Usage};

/// A tool call emitted by the model but not yet resolved into a
/// `ToolResultMessage`.
pub type PendingToolCall = ToolCall;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub messages: Vec<Message>,
    /// Last provider `response_id`, for providers that chain state
    /// server-side (e.g. OpenAI Responses' `previous_response_id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub pending_tool_calls: Vec<PendingToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub most_recent_stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Set by the compaction engine when it has rewritten `messages`; the
    /// session middleware observes this to decide whether to write a
    /// compaction entry or a delta entry, then clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_compaction: Option<Message>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.as_assistant().is_some())
    }

    /// §3 invariant: a `CompactionSummaryMessage`, if present, is always at
    /// index 0.
    pub fn has_leading_compaction_summary(&self) -> bool {
        self.messages.first().map(Message::is_compaction_summary).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_no_pending_calls() {
        let state = AgentState::new();
        assert!(state.pending_tool_calls.is_empty());
        assert!(state.messages.is_empty());
    }

    #[test]
    fn last_assistant_message_skips_trailing_tool_results() {
        let mut state = AgentState::new();
        state.push(Message::user_text("hi"));
        state.push(Message::Assistant(crate::message::AssistantMessage::new(
            "anthropic", "messages", "claude-3",
        )));
        state.push(Message::tool_result("c1", "echo", "hi", false));
        assert!(state.last_assistant_message().is_some());
    }
}
