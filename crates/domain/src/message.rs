//! Canonical message/content-block model shared by every provider adapter.
//!
//! A [`Message`] is one of four kinds, tagged by `type` on the wire. Content
//! blocks inside [`AssistantMessage`] carry opaque `signature` strings that
//! must only survive a round-trip when the next call targets the exact same
//! `(provider, api, model)` triple — see [`Message::strip_signatures_for`].

use serde::{Deserialize, Serialize};

/// One entry in an agent state's ordered message sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
    CompactionSummary(CompactionSummaryMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UserMessage {
    pub content: Vec<UserContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContentBlock {
    Text { text: String },
    Image { url: String, media_type: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub provider: String,
    pub api: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub content: Vec<AssistantContentBlock>,
    /// Redundant flat list of completed tool calls in this message, in the
    /// order they were requested. Kept alongside `content` so callers don't
    /// have to filter block variants to find tool calls.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum AssistantContentBlock {
    #[serde(rename = "text")]
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "toolCall")]
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as emitted by the provider stream.
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultMessage {
    pub call_id: String,
    pub tool_name: String,
    pub content: Vec<ToolResultContentBlock>,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContentBlock {
    Text { text: String },
    Image { url: String, media_type: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompactionSummaryMessage {
    pub text: String,
    pub tokens_before: u64,
    /// Unix epoch seconds.
    pub compacted_at: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constructors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage {
            content: vec![UserContentBlock::Text { text: text.into() }],
        })
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Message::ToolResult(ToolResultMessage {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            content: vec![ToolResultContentBlock::Text { text: text.into() }],
            is_error,
        })
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Message::User(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResultMessage> {
        match self {
            Message::ToolResult(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User(_))
    }

    pub fn is_compaction_summary(&self) -> bool {
        matches!(self, Message::CompactionSummary(_))
    }

    /// Concatenate every user/tool-result text block, used by the input
    /// guardrail to find "string-ish" content to classify.
    pub fn text_for_guardrail(&self) -> Option<String> {
        match self {
            Message::User(m) => {
                let parts: Vec<&str> = m
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        UserContentBlock::Text { text } => Some(text.as_str()),
                        UserContentBlock::Image { .. } => None,
                    })
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            // Tool-result inputs bypass the guardrail per spec.
            _ => None,
        }
    }

    /// Drop signature fields on any content block whose originating
    /// `(provider, api, model)` differs from the target triple.
    pub fn strip_signatures_for(&mut self, provider: &str, api: &str, model: &str) {
        if let Message::Assistant(m) = self {
            if m.provider == provider && m.api == api && m.model == model {
                return;
            }
            for block in &mut m.content {
                match block {
                    AssistantContentBlock::Text { signature, .. }
                    | AssistantContentBlock::Thinking { signature, .. } => {
                        *signature = None;
                    }
                    AssistantContentBlock::ToolCall(tc) => {
                        tc.signature = None;
                    }
                }
            }
            for tc in &mut m.tool_calls {
                tc.signature = None;
            }
        }
    }
}

impl AssistantMessage {
    pub fn new(provider: impl Into<String>, api: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            api: api.into(),
            model: model.into(),
            response_id: None,
            content: Vec::new(),
            tool_calls: Vec::new(),
        }
    }

    /// Fuse a text delta into the trailing block if it is already a `Text`
    /// block; otherwise start a new one.
    pub fn append_text(&mut self, delta: &str) {
        if let Some(AssistantContentBlock::Text { text, .. }) = self.content.last_mut() {
            text.push_str(delta);
        } else {
            self.content.push(AssistantContentBlock::Text {
                text: delta.to_string(),
                signature: None,
            });
        }
    }

    pub fn append_thinking(&mut self, delta: &str) {
        if let Some(AssistantContentBlock::Thinking { text, .. }) = self.content.last_mut() {
            text.push_str(delta);
        } else {
            self.content.push(AssistantContentBlock::Thinking {
                text: delta.to_string(),
                signature: None,
            });
        }
    }

    /// Overwrite the trailing text block's content wholesale (used when a
    /// provider emits the final canonical text after streaming deltas).
    pub fn set_last_text(&mut self, text: &str) {
        if let Some(AssistantContentBlock::Text { text: t, .. }) = self.content.last_mut() {
            *t = text.to_string();
        } else {
            self.content.push(AssistantContentBlock::Text {
                text: text.to_string(),
                signature: None,
            });
        }
    }

    pub fn set_last_thinking(&mut self, text: &str) {
        if let Some(AssistantContentBlock::Thinking { text: t, .. }) = self.content.last_mut() {
            *t = text.to_string();
        } else {
            self.content.push(AssistantContentBlock::Thinking {
                text: text.to_string(),
                signature: None,
            });
        }
    }

    pub fn push_tool_call(&mut self, call: ToolCall) {
        self.content.push(AssistantContentBlock::ToolCall(call.clone()));
        self.tool_calls.push(call);
    }

    /// Concatenation of every text block, in order.
    pub fn message_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                AssistantContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Concatenation of every thinking block, in order.
    pub fn message_thinking(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                AssistantContentBlock::Thinking { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

impl ToolResultMessage {
    /// Concatenation of every text block.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ToolResultContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_text_fuses_into_trailing_block() {
        let mut m = AssistantMessage::new("anthropic", "messages", "claude-3");
        m.append_text("Hello");
        m.append_text(", world");
        assert_eq!(m.content.len(), 1);
        assert_eq!(m.message_text(), "Hello, world");
    }

    #[test]
    fn append_text_starts_new_block_after_tool_call() {
        let mut m = AssistantMessage::new("anthropic", "messages", "claude-3");
        m.append_text("thinking...");
        m.push_tool_call(ToolCall {
            call_id: "c1".into(),
            name: "echo".into(),
            arguments: "{}".into(),
            signature: None,
        });
        m.append_text(" done");
        assert_eq!(m.content.len(), 3);
        assert_eq!(m.message_text(), "thinking... done");
    }

    #[test]
    fn set_last_text_overwrites_streamed_deltas() {
        let mut m = AssistantMessage::new("openai", "responses", "gpt-5");
        m.append_text("partial");
        m.set_last_text("final canonical text");
        assert_eq!(m.message_text(), "final canonical text");
    }

    #[test]
    fn strip_signatures_for_matching_triple_keeps_them() {
        let mut msg = Message::Assistant(AssistantMessage {
            provider: "anthropic".into(),
            api: "messages".into(),
            model: "claude-3".into(),
            response_id: None,
            content: vec![AssistantContentBlock::Thinking {
                text: "reasoning".into(),
                signature: Some("sig123".into()),
            }],
            tool_calls: vec![],
        });
        msg.strip_signatures_for("anthropic", "messages", "claude-3");
        let AssistantContentBlock::Thinking { signature, .. } =
            &msg.as_assistant().unwrap().content[0]
        else {
            panic!("expected thinking block");
        };
        assert_eq!(signature.as_deref(), Some("sig123"));
    }

    #[test]
    fn strip_signatures_for_mismatched_triple_drops_them() {
        let mut msg = Message::Assistant(AssistantMessage {
            provider: "anthropic".into(),
            api: "messages".into(),
            model: "claude-3".into(),
            response_id: None,
            content: vec![AssistantContentBlock::Thinking {
                text: "reasoning".into(),
                signature: Some("sig123".into()),
            }],
            tool_calls: vec![],
        });
        msg.strip_signatures_for("anthropic", "messages", "claude-4");
        let AssistantContentBlock::Thinking { signature, .. } =
            &msg.as_assistant().unwrap().content[0]
        else {
            panic!("expected thinking block");
        };
        assert!(signature.is_none());
    }

    #[test]
    fn message_round_trips_through_json() {
        let original = Message::ToolResult(ToolResultMessage {
            call_id: "c1".into(),
            tool_name: "echo".into(),
            content: vec![ToolResultContentBlock::Text { text: "hi".into() }],
            is_error: false,
        });
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn compaction_summary_round_trips() {
        let original = Message::CompactionSummary(CompactionSummaryMessage {
            text: "summary".into(),
            tokens_before: 4200,
            compacted_at: 1_700_000_000.0,
        });
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn text_for_guardrail_bypasses_tool_results() {
        let tr = Message::tool_result("c1", "echo", "hi", false);
        assert_eq!(tr.text_for_guardrail(), None);
        let user = Message::user_text("hello there");
        assert_eq!(user.text_for_guardrail().as_deref(), Some("hello there"));
    }
}
