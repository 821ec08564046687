//! Streaming event types emitted by provider adapters while consuming an
//! SSE response (§4.F.3).

use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Canonical stop reason, normalized from each provider's own vocabulary.
/// The rule "tool calls present → `ToolCalls` regardless of reason" is
/// applied by the adapter, not by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Safety,
    Error,
    Other,
}

/// Token accounting, monotonically accumulated into `AgentState`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    pub total: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.total += other.total;
    }
}

/// Events emitted during LLM streaming (provider-agnostic). `kind` on
/// content-bearing events follows §6: `{text, reasoning, tool_arguments,
/// refusal}`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A plain text delta (`kind = text`).
    Token { text: String },
    /// A reasoning/thinking delta (`kind = reasoning`).
    Thinking { text: String },
    /// A refusal delta (`kind = refusal`).
    Refusal { text: String },
    ToolCallStarted {
        index: usize,
        call_id: String,
        name: String,
    },
    /// An accumulating fragment of a tool call's JSON arguments
    /// (`kind = tool_arguments`).
    ToolCallDelta {
        index: usize,
        arguments_fragment: String,
    },
    ToolCallFinished {
        index: usize,
        call_id: String,
        name: String,
        arguments: String,
        signature: Option<String>,
    },
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
    Error {
        message: String,
    },
}

pub type StreamResult<'a> = BoxStream<'a, Result<StreamEvent>>;
