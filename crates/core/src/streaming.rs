//! Streaming leaf (§4.G/§4.H.10): the innermost stage. Builds one
//! `ChatRequest` from the current state, opens a stream via the router, and
//! folds `StreamEvent`s into message-lifecycle events and `AgentState`.

use std::sync::Arc;

use futures_util::StreamExt;

use sa_domain::agent_state::AgentState;
use sa_domain::capability::ModelRole;
use sa_domain::error::Result;
use sa_domain::event::{Event, EventRole, EventSink, UpdateKind};
use sa_domain::message::{AssistantMessage, Message, ToolCall};
use sa_domain::stream::StreamEvent;
use sa_domain::tool::ToolRegistry;

use sa_providers::router::LlmRouter;
use sa_providers::ChatRequest;

use crate::abort::AbortFlag;

/// Per-call overrides layered over an agent's stored defaults
/// (defaults < per-agent < per-call, per §4.G).
#[derive(Debug, Clone, Default)]
pub struct ChatDefaults {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
}

impl ChatDefaults {
    fn merge(&self, override_: &ChatDefaults) -> ChatDefaults {
        ChatDefaults {
            temperature: override_.temperature.or(self.temperature),
            max_tokens: override_.max_tokens.or(self.max_tokens),
            json_mode: override_.json_mode || self.json_mode,
        }
    }
}

pub struct StreamingContext {
    pub router: Arc<LlmRouter>,
    pub role: ModelRole,
    pub tools: Arc<ToolRegistry>,
    pub chat_defaults: ChatDefaults,
}

#[derive(Default)]
struct InFlightToolCall {
    name: String,
    call_id: String,
    arguments: String,
}

/// Runs one assistant turn: appends `turn_input` to `state`, calls the
/// model, and folds the resulting stream into `state` and `sink`.
///
/// Tool calls the model requests are left on `state.pending_tool_calls` for
/// the tool-call loop (§4.I) to dispatch; this stage never invokes a tool
/// itself.
pub async fn run_streaming_leaf(
    ctx: &StreamingContext,
    system_prompt: &str,
    per_call: &ChatDefaults,
    sink: &dyn EventSink,
    abort: &AbortFlag,
    mut state: AgentState,
    turn_input: Vec<Message>,
) -> Result<AgentState> {
    state.messages.extend(turn_input);

    let chat = ctx.chat_defaults.merge(per_call);
    let req = ChatRequest {
        messages: state.messages.clone(),
        tools: ctx.tools.definitions().into_iter().cloned().collect(),
        temperature: chat.temperature,
        max_tokens: chat.max_tokens,
        json_mode: chat.json_mode,
        model: None,
        previous_response_id: state.response_id.clone(),
        system_prompt: Some(system_prompt.to_string()),
    };

    let mut stream = ctx.router.stream_for_role(ctx.role, req).await?;

    let mut assistant = AssistantMessage::new("", "", "");
    let mut started = false;
    let mut in_flight: Vec<InFlightToolCall> = Vec::new();
    state.pending_tool_calls.clear();

    while let Some(event) = stream.next().await {
        abort.check()?;
        let event = event?;
        match event {
            StreamEvent::Token { text } => {
                if !started {
                    sink.on_event(Event::MessageStart {
                        role: EventRole::Assistant,
                        message: Message::Assistant(assistant.clone()),
                    });
                    started = true;
                }
                assistant.append_text(&text);
                sink.on_event(Event::MessageUpdate {
                    role: EventRole::Assistant,
                    message: Message::Assistant(assistant.clone()),
                    kind: UpdateKind::Text,
                    delta: text,
                    item_id: None,
                });
            }
            StreamEvent::Thinking { text } => {
                assistant.append_thinking(&text);
                sink.on_event(Event::MessageUpdate {
                    role: EventRole::Assistant,
                    message: Message::Assistant(assistant.clone()),
                    kind: UpdateKind::Reasoning,
                    delta: text,
                    item_id: None,
                });
            }
            StreamEvent::Refusal { text } => {
                sink.on_event(Event::MessageUpdate {
                    role: EventRole::Assistant,
                    message: Message::Assistant(assistant.clone()),
                    kind: UpdateKind::Refusal,
                    delta: text,
                    item_id: None,
                });
            }
            StreamEvent::ToolCallStarted { index, call_id, name } => {
                if in_flight.len() <= index {
                    in_flight.resize_with(index + 1, InFlightToolCall::default);
                }
                in_flight[index] = InFlightToolCall { name, call_id, arguments: String::new() };
            }
            StreamEvent::ToolCallDelta { index, arguments_fragment } => {
                if let Some(call) = in_flight.get_mut(index) {
                    call.arguments.push_str(&arguments_fragment);
                }
            }
            StreamEvent::ToolCallFinished { index, call_id, name, arguments, signature } => {
                if index < in_flight.len() {
                    in_flight[index] = InFlightToolCall::default();
                }
                let call = ToolCall { call_id, name, arguments, signature };
                assistant.push_tool_call(call.clone());
                state.pending_tool_calls.push(call.clone());
                sink.on_event(Event::ToolCallRequest { pending: call });
            }
            StreamEvent::Done { usage, finish_reason: _ } => {
                // Finalize any tool call that started but never got an
                // explicit ToolCallFinished (adapter closed the stream early).
                for call in in_flight.drain(..) {
                    if call.call_id.is_empty() {
                        continue;
                    }
                    tracing::warn!(call_id = %call.call_id, "tool call never finished, finalizing from accumulated deltas");
                    let call = ToolCall {
                        call_id: call.call_id,
                        name: call.name,
                        arguments: call.arguments,
                        signature: None,
                    };
                    assistant.push_tool_call(call.clone());
                    state.pending_tool_calls.push(call.clone());
                    sink.on_event(Event::ToolCallRequest { pending: call });
                }
                if let Some(usage) = usage {
                    state.usage.accumulate(&usage);
                }
            }
            StreamEvent::Error { message } => {
                sink.on_event(Event::AgentError { error: message.clone() });
                return Err(sa_domain::error::Error::ProviderStream(message));
            }
        }
    }

    if started {
        sink.on_event(Event::MessageEnd {
            role: EventRole::Assistant,
            message: Message::Assistant(assistant.clone()),
        });
    }
    state.push(Message::Assistant(assistant));
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_call_override_wins_over_agent_default() {
        let defaults = ChatDefaults { temperature: Some(0.7), max_tokens: Some(100), json_mode: false };
        let per_call = ChatDefaults { temperature: Some(0.1), max_tokens: None, json_mode: true };
        let merged = defaults.merge(&per_call);
        assert_eq!(merged.temperature, Some(0.1));
        assert_eq!(merged.max_tokens, Some(100));
        assert!(merged.json_mode);
    }
}
